// OMChat Client: Token manager
// Owns the token set: sanitization on ingestion, expiry tracking, header
// assembly, and the single-flight refresh exchange. The refresh token may
// be single-use upstream, so concurrent callers must share one in-flight
// attempt instead of racing duplicate exchanges.

use crate::error::ClientResult;
use crate::storage::KeyValueStore;
use crate::transport::TokenEndpoint;
use crate::types::{
    sanitize_instance_id, SessionSignal, TokenSet, CLIENT_INSTANCE_KEY,
};
use log::{info, warn};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_TYPE, ORIGIN};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Storage key for the persisted token set.
pub const TOKENS_KEY: &str = "om_tokens";

/// Tokens within this margin of expiry count as expired, so a token that
/// would lapse mid-request is refreshed up front.
const EXPIRY_MARGIN_MS: i64 = 60_000;

#[derive(Default)]
struct TokenState {
    tokens: TokenSet,
    client_instance_identifier: Option<String>,
    refresh_token: Option<String>,
    /// Absolute expiry in epoch milliseconds; `None` reads as expired.
    expires_at_ms: Option<i64>,
}

pub struct TokenManager {
    store: Arc<dyn KeyValueStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    origin: String,
    state: Mutex<TokenState>,
    /// Single-flight gate: holds the waiter channel while a refresh is
    /// in flight.
    inflight: Mutex<Option<broadcast::Sender<bool>>>,
    signals: broadcast::Sender<SessionSignal>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        endpoint: Arc<dyn TokenEndpoint>,
        origin: String,
        signals: broadcast::Sender<SessionSignal>,
    ) -> Self {
        TokenManager {
            store,
            endpoint,
            origin,
            state: Mutex::new(TokenState::default()),
            inflight: Mutex::new(None),
            signals,
        }
    }

    /// Ingest a token set from login, refresh, or storage.
    ///
    /// Sanitizes the client-instance identifier (comma-duplicated values
    /// collapse to the first segment), computes absolute expiry
    /// (`expires_at` takes precedence over `expires_in`; malformed fields
    /// leave expiry unset, which reads as expired), captures the refresh
    /// token, and persists the full set.
    pub fn set_tokens(&self, mut tokens: TokenSet) -> ClientResult<()> {
        let instance_id = tokens.client_instance_identifier().map(|raw| {
            let (fixed, was_duplicated) = sanitize_instance_id(raw);
            if was_duplicated {
                warn!("[tokens] Duplicate {} detected, collapsing", CLIENT_INSTANCE_KEY);
            }
            fixed
        });
        if let Some(id) = &instance_id {
            tokens.insert(CLIENT_INSTANCE_KEY, id.clone());
            info!("[tokens] Client instance identifier set to {}…", prefix(id));
        }

        // Server-supplied values; saturate rather than trusting the range
        let expires_at_ms = if let Some(at) = tokens.expires_at_secs() {
            Some(at.saturating_mul(1000))
        } else {
            tokens.expires_in_secs().map(|secs| {
                chrono::Utc::now()
                    .timestamp_millis()
                    .saturating_add(secs.saturating_mul(1000))
            })
        };

        let refresh_token = tokens.refresh_token().map(|t| t.to_string());

        let blob = serde_json::to_string(&tokens)?;
        {
            let mut state = self.state.lock();
            state.tokens = tokens;
            state.client_instance_identifier = instance_id;
            state.refresh_token = refresh_token;
            state.expires_at_ms = expires_at_ms;
        }
        self.store.set(TOKENS_KEY, &blob)
    }

    /// Restore the token set from storage. Corrupt blobs are discarded.
    pub fn restore(&self) -> ClientResult<bool> {
        let Some(blob) = self.store.get(TOKENS_KEY)? else {
            return Ok(false);
        };
        match serde_json::from_str::<TokenSet>(&blob) {
            Ok(tokens) => {
                self.set_tokens(tokens)?;
                Ok(true)
            }
            Err(e) => {
                warn!("[tokens] Discarding corrupt stored tokens: {}", e);
                Ok(false)
            }
        }
    }

    /// True when no expiry is known, or the known expiry is within the
    /// 60-second safety margin.
    pub fn is_expired(&self) -> bool {
        match self.state.lock().expires_at_ms {
            None => true,
            Some(at) => at < chrono::Utc::now().timestamp_millis() + EXPIRY_MARGIN_MS,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().tokens.has_access_token()
    }

    pub fn has_refresh_token(&self) -> bool {
        self.state.lock().refresh_token.is_some()
    }

    /// Snapshot of the current token set.
    pub fn tokens(&self) -> TokenSet {
        self.state.lock().tokens.clone()
    }

    /// Assemble request headers, refreshing first when the tokens look
    /// expired and a refresh token is held. Every string-valued token field
    /// is forwarded as a header except the client-instance identifier,
    /// which goes out once under its normalized lowercase name.
    pub async fn build_auth_headers(&self) -> ClientResult<HeaderMap> {
        if self.is_expired() && self.has_refresh_token() {
            // A failed refresh clears the tokens; the request then goes
            // out without credentials and the caller handles the 401.
            self.refresh().await;
        }

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        if let Ok(origin) = HeaderValue::from_str(&self.origin) {
            headers.insert(ORIGIN, origin);
        }

        let state = self.state.lock();
        for (key, value) in &state.tokens.0 {
            if key == CLIENT_INSTANCE_KEY {
                continue;
            }
            let Value::String(value) = value else { continue };
            if value.is_empty() {
                continue;
            }
            match (
                HeaderName::from_bytes(key.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!("[tokens] Skipping token field unusable as header: {}", key),
            }
        }

        if let Some(id) = &state.client_instance_identifier {
            if let Ok(value) = HeaderValue::from_str(id) {
                headers.insert(
                    HeaderName::from_static("client-instance-identifier"),
                    value,
                );
            }
        }

        Ok(headers)
    }

    /// Single-flight token refresh.
    ///
    /// If an exchange is already in flight, the caller is parked on its
    /// waiter channel and resolves with that attempt's outcome, success
    /// or failure, never a hang. Otherwise this caller performs exactly
    /// one exchange; the gate is cleared on every exit path.
    pub async fn refresh(&self) -> bool {
        let waiter = {
            let mut gate = self.inflight.lock();
            match gate.as_ref() {
                Some(tx) => Some(tx.subscribe()),
                None => {
                    let (tx, _rx) = broadcast::channel(1);
                    *gate = Some(tx);
                    None
                }
            }
        };

        if let Some(mut rx) = waiter {
            return rx.recv().await.unwrap_or(false);
        }

        let outcome = self.refresh_inner().await;

        let tx = self.inflight.lock().take();
        if let Some(tx) = tx {
            let _ = tx.send(outcome);
        }
        outcome
    }

    /// One physical exchange. Any failure clears all tokens and raises the
    /// auth-failure signal for the session to react to.
    async fn refresh_inner(&self) -> bool {
        let refresh_token = self.state.lock().refresh_token.clone();
        let Some(refresh_token) = refresh_token else {
            warn!("[tokens] No refresh token available");
            self.fail_auth();
            return false;
        };

        match self.endpoint.exchange(&refresh_token).await {
            Ok(tokens) => match self.set_tokens(tokens) {
                Ok(()) => {
                    info!("[tokens] Token refreshed successfully");
                    true
                }
                Err(e) => {
                    warn!("[tokens] Failed to persist refreshed tokens: {}", e);
                    self.fail_auth();
                    false
                }
            },
            Err(e) => {
                warn!("[tokens] Token refresh failed: {}", e);
                self.fail_auth();
                false
            }
        }
    }

    fn fail_auth(&self) {
        if let Err(e) = self.clear() {
            warn!("[tokens] Failed to clear tokens: {}", e);
        }
        let _ = self.signals.send(SessionSignal::AuthFailure);
    }

    /// Wipe in-memory token state and the persisted copy.
    pub fn clear(&self) -> ClientResult<()> {
        *self.state.lock() = TokenState::default();
        self.store.remove(TOKENS_KEY)
    }
}

/// Short non-secret prefix for logging identifiers.
fn prefix(s: &str) -> &str {
    crate::types::truncate_utf8(s, 10)
}

// ── Tests ──────────────────────────────────────────────────────────────
