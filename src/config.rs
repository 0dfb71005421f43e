// OMChat Client: API endpoint configuration
// Three separate origins: the user API (login), the agent API (streaming
// chat), and the auth service (token refresh). Defaults match the staging
// deployment; each can be overridden via environment.

use serde::{Deserialize, Serialize};

const DEFAULT_API_BASE_URL: &str = "https://api.stage.outmarket.ai/v1";
const DEFAULT_AGENT_API_URL: &str = "http://localhost:9000";
const DEFAULT_AUTH_URL: &str = "https://auth.stage.outmarket.ai/auth/v1";
const DEFAULT_ORIGIN: &str = "https://api.stage.outmarket.ai";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the user API (`/user/login`).
    pub base_url: String,
    /// Base URL of the agent API (conversation + tool streaming).
    pub agent_url: String,
    /// Base URL of the auth service (`/token?grant_type=refresh_token`).
    pub auth_url: String,
    /// Fixed Origin header sent with every request.
    pub origin: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: DEFAULT_API_BASE_URL.to_string(),
            agent_url: DEFAULT_AGENT_API_URL.to_string(),
            auth_url: DEFAULT_AUTH_URL.to_string(),
            origin: DEFAULT_ORIGIN.to_string(),
        }
    }
}

impl ApiConfig {
    /// Defaults overridden by `OMCHAT_API_BASE_URL`, `OMCHAT_AGENT_API_URL`,
    /// and `OMCHAT_AUTH_URL` where set.
    pub fn from_env() -> Self {
        let mut config = ApiConfig::default();
        if let Ok(v) = std::env::var("OMCHAT_API_BASE_URL") {
            config.base_url = v;
        }
        if let Ok(v) = std::env::var("OMCHAT_AGENT_API_URL") {
            config.agent_url = v;
        }
        if let Ok(v) = std::env::var("OMCHAT_AUTH_URL") {
            config.auth_url = v;
        }
        config
    }

    pub fn login_url(&self) -> String {
        format!("{}/user/login", self.base_url.trim_end_matches('/'))
    }

    pub fn refresh_url(&self) -> String {
        format!(
            "{}/token?grant_type=refresh_token",
            self.auth_url.trim_end_matches('/')
        )
    }

    /// Endpoint for continuing an existing conversation.
    pub fn conversation_stream_url(&self, conversation_id: &str) -> String {
        format!(
            "{}/api/v1/carrier_explorer/conversations/{}/chat/stream",
            self.agent_url.trim_end_matches('/'),
            conversation_id
        )
    }

    /// Endpoint for starting a new conversation via tool invocation.
    pub fn tool_stream_url(&self) -> String {
        format!(
            "{}/api/v1/carrier_explorer/tools/apply/stream",
            self.agent_url.trim_end_matches('/')
        )
    }
}

// ── Tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_trim_trailing_slashes() {
        let config = ApiConfig {
            base_url: "https://api.example.com/v1/".into(),
            agent_url: "http://localhost:9000/".into(),
            auth_url: "https://auth.example.com/auth/v1/".into(),
            origin: "https://api.example.com".into(),
        };
        assert_eq!(config.login_url(), "https://api.example.com/v1/user/login");
        assert_eq!(
            config.refresh_url(),
            "https://auth.example.com/auth/v1/token?grant_type=refresh_token"
        );
        assert_eq!(
            config.conversation_stream_url("conv-1"),
            "http://localhost:9000/api/v1/carrier_explorer/conversations/conv-1/chat/stream"
        );
        assert_eq!(
            config.tool_stream_url(),
            "http://localhost:9000/api/v1/carrier_explorer/tools/apply/stream"
        );
    }
}
