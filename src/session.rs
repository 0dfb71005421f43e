// OMChat Client: Session facade and stream client
// The integration point the host UI drives: login/logout/init, and the
// one logical "send message to agent" operation. A logical send may span
// several physical attempts when the server rejects credentials; events
// reach the UI through the caller's sink in wire order, and terminal
// failures are always delivered as an `error` event before the call
// returns.

use crate::config::ApiConfig;
use crate::conversations::ConversationRegistry;
use crate::error::{ClientError, ClientResult};
use crate::sse;
use crate::storage::KeyValueStore;
use crate::tokens::TokenManager;
use crate::transport::{
    http_client, HttpLoginEndpoint, HttpStreamTransport, HttpTokenEndpoint, LoginEndpoint,
    StreamTransport, TokenEndpoint,
};
use crate::types::{
    sanitize_instance_id, truncate_utf8, EventStatus, LoginOutcome, SessionSignal, StreamEvent,
    TokenSet, CLIENT_INSTANCE_KEY,
};
use futures::StreamExt;
use log::{info, warn};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Agent used when the caller does not name one.
pub const DEFAULT_AGENT_ID: &str = "om_assistant";

/// Auth-driven retry budget per logical send.
const MAX_AUTH_RETRIES: u32 = 3;

/// Response headers inspected for tokens after login.
const LOGIN_TOKEN_HEADERS: [&str; 5] = [
    "OM-Access-Token",
    "OM-Refresh-Token",
    "Client-Access-Token",
    "Client-Refresh-Token",
    CLIENT_INSTANCE_KEY,
];

pub struct SessionClient {
    config: ApiConfig,
    tokens: Arc<TokenManager>,
    conversations: ConversationRegistry,
    login: Arc<dyn LoginEndpoint>,
    transport: Arc<dyn StreamTransport>,
    signals: broadcast::Sender<SessionSignal>,
}

impl SessionClient {
    /// Build a client against the real network. One reqwest client is
    /// shared across login, refresh, and streaming.
    pub fn new(config: ApiConfig, store: Arc<dyn KeyValueStore>) -> Self {
        let http = http_client();
        let endpoint = Arc::new(HttpTokenEndpoint::new(http.clone(), config.refresh_url()));
        let login = Arc::new(HttpLoginEndpoint::new(
            http.clone(),
            config.login_url(),
            config.origin.clone(),
        ));
        let transport = Arc::new(HttpStreamTransport::new(http));
        Self::with_transports(config, store, endpoint, login, transport)
    }

    /// Build a client with injected network seams.
    pub fn with_transports(
        config: ApiConfig,
        store: Arc<dyn KeyValueStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        login: Arc<dyn LoginEndpoint>,
        transport: Arc<dyn StreamTransport>,
    ) -> Self {
        let (signals, _) = broadcast::channel(16);
        let tokens = Arc::new(TokenManager::new(
            store.clone(),
            endpoint,
            config.origin.clone(),
            signals.clone(),
        ));
        let conversations = ConversationRegistry::new(store);
        SessionClient { config, tokens, conversations, login, transport, signals }
    }

    /// Subscribe to session signals (auth failure, logout), so hosts can
    /// react without a global event bus.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionSignal> {
        self.signals.subscribe()
    }

    /// Restore tokens and conversation ids from storage. Returns whether a
    /// usable session exists afterwards.
    pub fn init(&self) -> ClientResult<bool> {
        self.tokens.restore()?;
        self.conversations.restore()?;
        Ok(self.is_authenticated())
    }

    /// True iff a recognized access-token field is present and non-empty.
    pub fn is_authenticated(&self) -> bool {
        self.tokens.is_authenticated()
    }

    /// The known conversation id for an agent, if any.
    pub fn conversation_id(&self, agent_id: &str) -> Option<String> {
        self.conversations.get(agent_id)
    }

    /// Forget an agent's conversation so the next send starts a new one.
    pub fn reset_conversation(&self, agent_id: &str) -> ClientResult<()> {
        self.conversations.set(agent_id, None)
    }

    // ── Login / logout ─────────────────────────────────────────────────

    /// Post credentials and capture tokens from the response headers and,
    /// when present, the response-body token block. HTTP and network
    /// failures come back as an unsuccessful outcome, not an `Err`.
    pub async fn login(&self, email: &str, password: &str) -> ClientResult<LoginOutcome> {
        let response = match self.login.submit(email, password).await {
            Ok(r) => r,
            Err(e) => {
                warn!("[session] Login request failed: {}", e);
                return Ok(LoginOutcome {
                    success: false,
                    message: format!("An error occurred during login: {}", e),
                    tokens: None,
                });
            }
        };

        if !(200..300).contains(&response.status) {
            // Prefer the server's message field when the body is JSON
            let message = serde_json::from_str::<Value>(&response.body)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(String::from))
                .unwrap_or_else(|| {
                    format!(
                        "Login failed: {} - {}",
                        response.status,
                        truncate_utf8(&response.body, 200)
                    )
                });
            return Ok(LoginOutcome { success: false, message, tokens: None });
        }

        let body: Value = serde_json::from_str(&response.body).unwrap_or(Value::Null);
        let tokens = extract_login_tokens(&response.headers, &body);
        self.tokens.set_tokens(tokens.clone())?;

        info!("[session] Login successful");
        Ok(LoginOutcome {
            success: true,
            message: "Login successful".into(),
            tokens: Some(tokens),
        })
    }

    /// Clear all token and conversation state, in memory and in storage.
    pub fn logout(&self) -> ClientResult<()> {
        self.tokens.clear()?;
        self.conversations.clear()?;
        let _ = self.signals.send(SessionSignal::LoggedOut);
        info!("[session] Logged out");
        Ok(())
    }

    // ── Streaming send ─────────────────────────────────────────────────

    /// Send one message to an agent, streaming normalized events into
    /// `on_event`. Auth rejections are recovered via refresh-and-retry up
    /// to three times; all terminal failures are delivered as an `error`
    /// event before the error is returned.
    pub async fn send_agent_request_stream<F>(
        &self,
        query: &str,
        agent_id: &str,
        mut on_event: F,
    ) -> ClientResult<()>
    where
        F: FnMut(StreamEvent) + Send,
    {
        if !self.is_authenticated() && !self.init().unwrap_or(false) {
            on_event(StreamEvent::error("Not authenticated. Please log in."));
            let _ = self.signals.send(SessionSignal::AuthFailure);
            return Err(ClientError::Unauthenticated);
        }

        let mut attempt: u32 = 0;
        loop {
            match self.send_once(query, agent_id, &mut on_event).await {
                Ok(()) => return Ok(()),
                Err(ClientError::AuthExpired { status }) => {
                    if attempt >= MAX_AUTH_RETRIES {
                        let err = ClientError::AuthExhausted { attempts: attempt };
                        on_event(StreamEvent::error(err.to_string()));
                        return Err(err);
                    }
                    attempt += 1;
                    info!(
                        "[stream] Auth rejection ({}), refreshing and retrying ({}/{})",
                        status, attempt, MAX_AUTH_RETRIES
                    );
                    // Retry even if the refresh fails: the next attempt
                    // then consumes the budget and surfaces the rejection.
                    self.tokens.refresh().await;
                }
                Err(e) if mentions_auth_failure(&e) => {
                    on_event(StreamEvent::error(
                        "Authentication error. Attempting to refresh session...",
                    ));
                    let refreshed = self.tokens.refresh().await;
                    if refreshed && attempt < MAX_AUTH_RETRIES {
                        attempt += 1;
                        on_event(StreamEvent::info("Session refreshed. Retrying request..."));
                        continue;
                    }
                    on_event(StreamEvent::error("Authentication failed. Please log in again."));
                    let _ = self.signals.send(SessionSignal::AuthFailure);
                    return Err(e);
                }
                Err(e) => {
                    warn!("[stream] Send failed: {}", e);
                    on_event(StreamEvent::error(e.to_string()));
                    return Err(e);
                }
            }
        }
    }

    /// One physical attempt: endpoint selection, headers, request, and the
    /// incremental decode loop.
    async fn send_once<F>(
        &self,
        query: &str,
        agent_id: &str,
        on_event: &mut F,
    ) -> ClientResult<()>
    where
        F: FnMut(StreamEvent) + Send,
    {
        let conversation_id = self.conversations.get(agent_id);
        let (url, payload) = match &conversation_id {
            Some(id) => (
                self.config.conversation_stream_url(id),
                json!({ "query": query }),
            ),
            None => (
                self.config.tool_stream_url(),
                json!({ "tool_id": agent_id, "input_args": { "query": query } }),
            ),
        };
        match &conversation_id {
            Some(id) => info!("[stream] Agent {}: continuing conversation {}", agent_id, id),
            None => info!("[stream] Agent {}: starting new conversation", agent_id),
        }

        let mut headers = self.tokens.build_auth_headers().await?;
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        let response = self.transport.post_stream(&url, headers, payload).await?;
        match response.status {
            401 | 403 => return Err(ClientError::AuthExpired { status: response.status }),
            s if !(200..300).contains(&s) => {
                let body = response.text().await;
                return Err(ClientError::Api {
                    status: s,
                    message: truncate_utf8(&body, 500).to_string(),
                });
            }
            _ => {}
        }

        let started_new = conversation_id.is_none();
        let mut body = response.body;
        let mut buffer: Vec<u8> = Vec::new();
        let mut final_result: Option<Value> = None;

        while let Some(chunk) = body.next().await {
            let bytes = chunk?;
            buffer.extend_from_slice(&bytes);

            // Frames are delimited in byte space; a multi-byte character
            // split across chunks stays buffered until its frame completes.
            while let Some(pos) = buffer.windows(2).position(|w| w == b"\n\n") {
                let frame: Vec<u8> = buffer.drain(..pos + 2).collect();
                let frame = String::from_utf8_lossy(&frame);
                self.handle_frame(&frame, agent_id, started_new, &mut final_result, on_event);
            }
        }

        // Best-effort parse of a residual partial frame at stream end.
        if !buffer.is_empty() {
            let frame = String::from_utf8_lossy(&buffer);
            if !frame.trim().is_empty() {
                self.handle_frame(&frame, agent_id, started_new, &mut final_result, on_event);
            }
        }

        info!("[stream] Stream completed");
        on_event(StreamEvent::completed(final_result.unwrap_or_else(|| {
            json!({ "result": "Operation completed successfully." })
        })));
        Ok(())
    }

    fn handle_frame<F>(
        &self,
        frame: &str,
        agent_id: &str,
        started_new: bool,
        final_result: &mut Option<Value>,
        on_event: &mut F,
    ) where
        F: FnMut(StreamEvent) + Send,
    {
        let Some(event) = sse::decode_frame(frame) else {
            return; // blank frame
        };

        if event.status == Some(EventStatus::Completed) {
            if let Some(data) = &event.data {
                let result = sse::extract_result(data);

                // First message of a conversation: capture the id the
                // server assigned so the next send continues it.
                if started_new {
                    if let Some(cid) = result.get("conversation_id").and_then(Value::as_str) {
                        if self.conversations.get(agent_id).is_none() {
                            info!("[stream] New conversation created with id {}", cid);
                            if let Err(e) = self.conversations.set(agent_id, Some(cid)) {
                                warn!("[stream] Failed to persist conversation id: {}", e);
                            }
                        }
                    }
                }

                *final_result = Some(result);
            }
        }

        on_event(event);
    }
}

/// Pull the fixed token headers (case-insensitively) and the optional
/// body token block out of a login response.
fn extract_login_tokens(headers: &HeaderMap, body: &Value) -> TokenSet {
    let mut tokens = TokenSet::new();

    for name in LOGIN_TOKEN_HEADERS {
        let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        if name == CLIENT_INSTANCE_KEY {
            let (fixed, was_duplicated) = sanitize_instance_id(value);
            if was_duplicated {
                warn!("[session] Duplicate {} in login response, collapsing", CLIENT_INSTANCE_KEY);
            }
            tokens.insert(name, fixed);
        } else {
            tokens.insert(name, value);
        }
    }

    // Body token block rides along when the auth service handled the login
    if body.get("metadata").and_then(|m| m.get("user")).is_some() {
        if let Some(block) = body.get("tokens") {
            for field in ["access_token", "refresh_token", "expires_in", "expires_at"] {
                if let Some(v) = block.get(field) {
                    tokens.0.insert(field.to_string(), v.clone());
                }
            }
        }
    }

    tokens
}

/// Transport-level failures can carry an auth status in their message
/// rather than a typed variant; sniff for it before giving up, since a
/// refresh may still rescue the send.
fn mentions_auth_failure(e: &ClientError) -> bool {
    let msg = e.to_string().to_lowercase();
    msg.contains("401") || msg.contains("403") || msg.contains("authentication failed")
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::tokens::TOKENS_KEY;
    use crate::transport::{LoginResponse, StreamingResponse};
    use crate::types::EventKind;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    const TOOL_FRAME: &str =
        "data: {\"status\":\"tool_call\",\"tool\":{\"name\":\"x\"},\"ai_message\":{\"content\":\"y\"}}\n\n";
    const DONE_FRAME: &str =
        "data: {\"status\":\"completed\",\"data\":{\"content\":\"done\"}}\n\n";
    const DONE_FRAME_WITH_CONV: &str =
        "data: {\"status\":\"completed\",\"data\":{\"content\":\"done\",\"conversation_id\":\"conv-9\"}}\n\n";

    struct FakeEndpoint {
        calls: AtomicU32,
    }

    #[async_trait]
    impl TokenEndpoint for FakeEndpoint {
        async fn exchange(&self, _refresh_token: &str) -> ClientResult<TokenSet> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::from_value(json!({
                "access_token": "fresh",
                "refresh_token": "fresh-r",
                "expires_in": 3600
            }))
            .unwrap())
        }
    }

    /// Scripted login endpoint: hands out one prepared response.
    struct FakeLogin {
        response: Mutex<Option<ClientResult<LoginResponse>>>,
    }

    impl FakeLogin {
        fn unscripted() -> Self {
            FakeLogin { response: Mutex::new(None) }
        }
    }

    #[async_trait]
    impl LoginEndpoint for FakeLogin {
        async fn submit(&self, _email: &str, _password: &str) -> ClientResult<LoginResponse> {
            self.response.lock().take().unwrap_or_else(|| {
                Ok(LoginResponse { status: 500, headers: HeaderMap::new(), body: String::new() })
            })
        }
    }

    /// Scripted transport: pops one (status, chunks) response per attempt.
    struct FakeStream {
        script: Mutex<VecDeque<(u16, Vec<Bytes>)>>,
        calls: AtomicU32,
        last_url: Mutex<Option<String>>,
        last_body: Mutex<Option<Value>>,
        last_headers: Mutex<Option<HeaderMap>>,
    }

    impl FakeStream {
        fn new(script: Vec<(u16, Vec<Bytes>)>) -> Self {
            FakeStream {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                last_url: Mutex::new(None),
                last_body: Mutex::new(None),
                last_headers: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl StreamTransport for FakeStream {
        async fn post_stream(
            &self,
            url: &str,
            headers: HeaderMap,
            body: Value,
        ) -> ClientResult<StreamingResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_url.lock() = Some(url.to_string());
            *self.last_body.lock() = Some(body);
            *self.last_headers.lock() = Some(headers);

            let (status, chunks) = self.script.lock().pop_front().unwrap_or((200, vec![]));
            let chunks: Vec<ClientResult<Bytes>> = chunks.into_iter().map(Ok).collect();
            Ok(StreamingResponse { status, body: stream::iter(chunks).boxed() })
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        endpoint: Arc<FakeEndpoint>,
        login: Arc<FakeLogin>,
        transport: Arc<FakeStream>,
        client: SessionClient,
    }

    fn harness(script: Vec<(u16, Vec<&'static str>)>) -> Harness {
        harness_bytes(
            script
                .into_iter()
                .map(|(status, chunks)| (status, chunks.into_iter().map(Bytes::from).collect()))
                .collect(),
        )
    }

    fn harness_bytes(script: Vec<(u16, Vec<Bytes>)>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let endpoint = Arc::new(FakeEndpoint { calls: AtomicU32::new(0) });
        let login = Arc::new(FakeLogin::unscripted());
        let transport = Arc::new(FakeStream::new(script));
        let client = SessionClient::with_transports(
            ApiConfig {
                base_url: "http://api.test/v1".into(),
                agent_url: "http://agent.test".into(),
                auth_url: "http://auth.test/auth/v1".into(),
                origin: "http://api.test".into(),
            },
            store.clone(),
            endpoint.clone(),
            login.clone(),
            transport.clone(),
        );
        Harness { store, endpoint, login, transport, client }
    }

    fn seed_session(store: &MemoryStore) {
        let far = chrono::Utc::now().timestamp() + 7200;
        store
            .set(
                TOKENS_KEY,
                &json!({
                    "OM-Access-Token": "om-a",
                    "access_token": "a",
                    "refresh_token": "r",
                    "expires_at": far
                })
                .to_string(),
            )
            .unwrap();
    }

    #[tokio::test]
    async fn events_arrive_in_wire_order_then_synthesized_completion() {
        let h = harness(vec![(200, vec![TOOL_FRAME, DONE_FRAME])]);
        seed_session(&h.store);

        let mut events = Vec::new();
        h.client
            .send_agent_request_stream("hello", DEFAULT_AGENT_ID, |ev| events.push(ev))
            .await
            .unwrap();

        assert_eq!(events.len(), 3);

        assert_eq!(events[0].status, Some(EventStatus::ToolCall));
        assert_eq!(events[0].event_type, Some(EventKind::AgentThinks));
        assert_eq!(events[0].data.as_ref().unwrap()["tool"]["name"], json!("x"));

        assert_eq!(events[1].status, Some(EventStatus::Completed));
        assert_eq!(events[1].data, Some(json!({"content": "done"})));

        // Synthesized terminal event carries the extracted result
        assert_eq!(events[2].status, Some(EventStatus::Completed));
        assert_eq!(events[2].event_type, Some(EventKind::Completion));
        let result = events[2].data.as_ref().unwrap();
        assert_eq!(result["content"], json!("done"));
        assert_eq!(result["result"], json!("done"));
    }

    #[tokio::test]
    async fn frames_split_across_chunks_are_reassembled() {
        // The tool frame arrives byte-split mid-JSON; the delimiter of the
        // final frame never arrives and is flushed at stream end.
        let h = harness(vec![(
            200,
            vec![
                "data: {\"status\":\"tool_call\",\"tool\"",
                ":{\"name\":\"x\"}}\n\ndata: {\"status\":\"completed\",\"data\":{\"content\":\"done\"}}",
            ],
        )]);
        seed_session(&h.store);

        let mut events = Vec::new();
        h.client
            .send_agent_request_stream("hello", DEFAULT_AGENT_ID, |ev| events.push(ev))
            .await
            .unwrap();

        assert_eq!(events.len(), 3);
        assert_eq!(events[0].status, Some(EventStatus::ToolCall));
        assert_eq!(events[1].status, Some(EventStatus::Completed));
        assert_eq!(events[2].data.as_ref().unwrap()["result"], json!("done"));
    }

    #[tokio::test]
    async fn multibyte_character_split_across_chunks_survives() {
        // The "é" of "café" (0xC3 0xA9) arrives split between two chunks
        let h = harness_bytes(vec![(
            200,
            vec![
                Bytes::from_static(b"data: {\"status\":\"completed\",\"data\":{\"content\":\"caf\xC3"),
                Bytes::from_static(b"\xA9\"}}\n\n"),
            ],
        )]);
        seed_session(&h.store);

        let mut events = Vec::new();
        h.client
            .send_agent_request_stream("hello", DEFAULT_AGENT_ID, |ev| events.push(ev))
            .await
            .unwrap();

        assert_eq!(events[0].data.as_ref().unwrap()["content"], json!("café"));
        assert_eq!(events.last().unwrap().data.as_ref().unwrap()["result"], json!("café"));
    }

    #[tokio::test]
    async fn malformed_frame_does_not_stop_the_stream() {
        let h = harness(vec![(200, vec!["data: {broken\n\n", DONE_FRAME])]);
        seed_session(&h.store);

        let mut events = Vec::new();
        h.client
            .send_agent_request_stream("hello", DEFAULT_AGENT_ID, |ev| events.push(ev))
            .await
            .unwrap();

        // Malformed JSON arrives as a raw-string payload, then the stream continues
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].data, Some(json!("{broken")));
        assert_eq!(events[1].status, Some(EventStatus::Completed));
    }

    #[tokio::test]
    async fn first_completion_captures_conversation_id() {
        let h = harness(vec![
            (200, vec![DONE_FRAME_WITH_CONV]),
            (200, vec![DONE_FRAME]),
        ]);
        seed_session(&h.store);

        h.client
            .send_agent_request_stream("first", "carrier_agent", |_| {})
            .await
            .unwrap();
        assert_eq!(h.client.conversation_id("carrier_agent").as_deref(), Some("conv-9"));

        // First send went to the tool-invocation endpoint
        assert!(h.transport.last_url.lock().as_ref().unwrap().ends_with("/tools/apply/stream"));

        // Second send continues the conversation with the other payload shape
        h.client
            .send_agent_request_stream("second", "carrier_agent", |_| {})
            .await
            .unwrap();
        assert!(h
            .transport
            .last_url
            .lock()
            .as_ref()
            .unwrap()
            .contains("/conversations/conv-9/chat/stream"));
        assert_eq!(h.transport.last_body.lock().clone().unwrap(), json!({"query": "second"}));
    }

    #[tokio::test]
    async fn reset_conversation_starts_fresh() {
        let h = harness(vec![(200, vec![DONE_FRAME]), (200, vec![DONE_FRAME])]);
        seed_session(&h.store);
        h.client.conversations.set("agent_a", Some("conv-1")).unwrap();

        h.client.send_agent_request_stream("q", "agent_a", |_| {}).await.unwrap();
        assert!(h
            .transport
            .last_url
            .lock()
            .as_ref()
            .unwrap()
            .contains("/conversations/conv-1/"));

        h.client.reset_conversation("agent_a").unwrap();
        h.client.send_agent_request_stream("q", "agent_a", |_| {}).await.unwrap();
        let body = h.transport.last_body.lock().clone().unwrap();
        assert_eq!(body["tool_id"], json!("agent_a"));
        assert_eq!(body["input_args"]["query"], json!("q"));
    }

    #[tokio::test]
    async fn requests_carry_auth_and_event_stream_headers() {
        let h = harness(vec![(200, vec![DONE_FRAME])]);
        seed_session(&h.store);

        h.client.send_agent_request_stream("q", DEFAULT_AGENT_ID, |_| {}).await.unwrap();

        let headers = h.transport.last_headers.lock().clone().unwrap();
        assert_eq!(headers.get("OM-Access-Token").unwrap(), "om-a");
        assert_eq!(headers.get("accept").unwrap(), "text/event-stream");
        assert_eq!(headers.get("origin").unwrap(), "http://api.test");
    }

    #[tokio::test]
    async fn auth_rejection_refreshes_once_and_retries() {
        let h = harness(vec![(401, vec![]), (200, vec![DONE_FRAME])]);
        seed_session(&h.store);

        let mut events = Vec::new();
        h.client
            .send_agent_request_stream("q", DEFAULT_AGENT_ID, |ev| events.push(ev))
            .await
            .unwrap();

        assert_eq!(h.endpoint.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.calls.load(Ordering::SeqCst), 2);
        // Retried request went out with the refreshed token
        let headers = h.transport.last_headers.lock().clone().unwrap();
        assert_eq!(headers.get("access_token").unwrap(), "fresh");
        assert_eq!(events.last().unwrap().status, Some(EventStatus::Completed));
    }

    #[tokio::test]
    async fn persistent_rejection_exhausts_the_retry_budget() {
        let h = harness(vec![(401, vec![]), (403, vec![]), (401, vec![]), (401, vec![])]);
        seed_session(&h.store);

        let mut events = Vec::new();
        let err = h
            .client
            .send_agent_request_stream("q", DEFAULT_AGENT_ID, |ev| events.push(ev))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::AuthExhausted { attempts: 3 }));
        assert_eq!(h.transport.calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.endpoint.calls.load(Ordering::SeqCst), 3);
        let last = events.last().unwrap();
        assert_eq!(last.status, Some(EventStatus::Error));
        assert!(last.message.as_ref().unwrap().contains("3 retries"));
    }

    #[tokio::test]
    async fn unauthenticated_send_is_terminal() {
        let h = harness(vec![]);
        let mut rx = h.client.subscribe();

        let mut events = Vec::new();
        let err = h
            .client
            .send_agent_request_stream("q", DEFAULT_AGENT_ID, |ev| events.push(ev))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Unauthenticated));
        assert_eq!(h.transport.calls.load(Ordering::SeqCst), 0);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status, Some(EventStatus::Error));
        assert_eq!(rx.try_recv().unwrap(), SessionSignal::AuthFailure);
    }

    #[tokio::test]
    async fn server_error_surfaces_without_retry() {
        let h = harness(vec![(500, vec!["upstream exploded"])]);
        seed_session(&h.store);

        let mut events = Vec::new();
        let err = h
            .client
            .send_agent_request_stream("q", DEFAULT_AGENT_ID, |ev| events.push(ev))
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::Api { status: 500, .. }));
        assert_eq!(h.transport.calls.load(Ordering::SeqCst), 1);
        let last = events.last().unwrap();
        assert_eq!(last.status, Some(EventStatus::Error));
        assert!(last.message.as_ref().unwrap().contains("upstream exploded"));
    }

    #[tokio::test]
    async fn init_restores_a_previous_session() {
        let h = harness(vec![]);
        seed_session(&h.store);
        h.store
            .set(
                crate::conversations::CONVERSATION_IDS_KEY,
                &json!({"agent_a": "conv-a"}).to_string(),
            )
            .unwrap();

        assert!(h.client.init().unwrap());
        assert!(h.client.is_authenticated());
        assert_eq!(h.client.conversation_id("agent_a").as_deref(), Some("conv-a"));
    }

    #[tokio::test]
    async fn logout_clears_everything_and_signals() {
        let h = harness(vec![]);
        seed_session(&h.store);
        assert!(h.client.init().unwrap());
        h.client.conversations.set("agent_a", Some("conv-a")).unwrap();

        let mut rx = h.client.subscribe();
        h.client.logout().unwrap();

        assert!(!h.client.is_authenticated());
        assert_eq!(h.client.conversation_id("agent_a"), None);
        assert_eq!(h.store.get(TOKENS_KEY).unwrap(), None);
        assert_eq!(rx.try_recv().unwrap(), SessionSignal::LoggedOut);
    }

    #[tokio::test]
    async fn login_success_stores_tokens() {
        let h = harness(vec![]);
        let mut headers = HeaderMap::new();
        headers.insert("om-access-token", HeaderValue::from_static("om-a"));
        headers.insert("om-refresh-token", HeaderValue::from_static("om-r"));
        *h.login.response.lock() =
            Some(Ok(LoginResponse { status: 200, headers, body: "{}".into() }));

        let outcome = h.client.login("user@example.com", "pw").await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.tokens.unwrap().get_str("OM-Access-Token"), Some("om-a"));
        assert!(h.client.is_authenticated());
        assert!(h.store.get(TOKENS_KEY).unwrap().is_some());
    }

    #[tokio::test]
    async fn login_rejection_surfaces_the_server_message() {
        let h = harness(vec![]);
        *h.login.response.lock() = Some(Ok(LoginResponse {
            status: 401,
            headers: HeaderMap::new(),
            body: r#"{"message":"Invalid credentials"}"#.into(),
        }));

        let outcome = h.client.login("user@example.com", "bad").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.message, "Invalid credentials");
        assert!(!h.client.is_authenticated());
    }

    #[tokio::test]
    async fn login_network_failure_is_an_unsuccessful_outcome() {
        let h = harness(vec![]);
        *h.login.response.lock() = Some(Err(ClientError::Transport("dns failure".into())));

        let outcome = h.client.login("user@example.com", "pw").await.unwrap();
        assert!(!outcome.success);
        assert!(outcome.message.contains("dns failure"));
    }

    #[test]
    fn login_tokens_come_from_headers_and_body() {
        let mut headers = HeaderMap::new();
        headers.insert("om-access-token", HeaderValue::from_static("om-a"));
        headers.insert("om-refresh-token", HeaderValue::from_static("om-r"));
        headers.insert(
            "client-instance-identifier",
            HeaderValue::from_static("inst-1, inst-1"),
        );

        let body = json!({
            "metadata": { "user": { "id": 1 } },
            "tokens": {
                "access_token": "a",
                "refresh_token": "r",
                "expires_in": 3600,
                "expires_at": 1900000000u64
            }
        });

        let tokens = extract_login_tokens(&headers, &body);
        assert_eq!(tokens.get_str("OM-Access-Token"), Some("om-a"));
        assert_eq!(tokens.get_str("OM-Refresh-Token"), Some("om-r"));
        // Comma-duplicated identifier collapsed at extraction time
        assert_eq!(tokens.client_instance_identifier(), Some("inst-1"));
        assert_eq!(tokens.get_str("access_token"), Some("a"));
        assert_eq!(tokens.expires_at_secs(), Some(1_900_000_000));
    }

    #[test]
    fn body_tokens_require_the_user_metadata_block() {
        let body = json!({ "tokens": { "access_token": "a" } });
        let tokens = extract_login_tokens(&HeaderMap::new(), &body);
        assert!(tokens.is_empty());
    }
}
