// OMChat Client: API and session layer for the OutMarket chat dashboard.
//
// The crate covers everything between a chat UI and the OutMarket
// services: credential persistence, token lifecycle with single-flight
// refresh, per-agent conversation tracking, and the SSE stream client
// that turns the agent API's uneven wire events into one normalized
// envelope. `SessionClient` is the facade a host embeds; the seams
// underneath (`KeyValueStore`, `TokenEndpoint`, `StreamTransport`) are
// traits so hosts and tests can swap storage and network.

pub mod config;
pub mod conversations;
pub mod error;
pub mod session;
pub mod sse;
pub mod storage;
pub mod tokens;
pub mod transport;
pub mod types;

pub use config::ApiConfig;
pub use conversations::ConversationRegistry;
pub use error::{ClientError, ClientResult};
pub use session::{SessionClient, DEFAULT_AGENT_ID};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use tokens::TokenManager;
pub use transport::{LoginEndpoint, LoginResponse, StreamTransport, StreamingResponse, TokenEndpoint};
pub use types::{
    EventKind, EventStatus, LoginOutcome, SessionSignal, StreamEvent, TokenSet,
};
