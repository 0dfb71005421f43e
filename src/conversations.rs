// OMChat Client: Conversation registry
// Maps agent id → server-assigned conversation id. The stream client uses
// the presence of an entry to pick between the continue-conversation and
// start-conversation endpoints. The whole map persists on every write.

use crate::error::ClientResult;
use crate::storage::KeyValueStore;
use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Storage key for the persisted agent → conversation-id map.
pub const CONVERSATION_IDS_KEY: &str = "om_conversation_ids";

pub struct ConversationRegistry {
    store: Arc<dyn KeyValueStore>,
    ids: Mutex<HashMap<String, String>>,
}

impl ConversationRegistry {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        ConversationRegistry { store, ids: Mutex::new(HashMap::new()) }
    }

    /// Restore the map from storage. A corrupt blob is discarded with a
    /// warning rather than failing startup.
    pub fn restore(&self) -> ClientResult<bool> {
        let Some(blob) = self.store.get(CONVERSATION_IDS_KEY)? else {
            return Ok(false);
        };
        match serde_json::from_str::<HashMap<String, String>>(&blob) {
            Ok(map) => {
                *self.ids.lock() = map;
                Ok(true)
            }
            Err(e) => {
                warn!("[conversations] Discarding corrupt conversation map: {}", e);
                Ok(false)
            }
        }
    }

    /// The conversation id for `agent_id`, if one is known. Unknown agents
    /// simply have no entry and start a new conversation on next send.
    pub fn get(&self, agent_id: &str) -> Option<String> {
        self.ids.lock().get(agent_id).cloned()
    }

    /// Record or reset the conversation for an agent. `None` clears the
    /// association so the next send starts a new conversation. Every write
    /// persists the entire map.
    pub fn set(&self, agent_id: &str, conversation_id: Option<&str>) -> ClientResult<()> {
        let snapshot = {
            let mut ids = self.ids.lock();
            match conversation_id {
                Some(id) => {
                    info!("[conversations] Set conversation for {}: {}", agent_id, id);
                    ids.insert(agent_id.to_string(), id.to_string());
                }
                None => {
                    info!("[conversations] Reset conversation for {}", agent_id);
                    ids.remove(agent_id);
                }
            }
            ids.clone()
        };
        self.store.set(CONVERSATION_IDS_KEY, &serde_json::to_string(&snapshot)?)
    }

    /// Wipe all conversation state, in memory and in storage.
    pub fn clear(&self) -> ClientResult<()> {
        self.ids.lock().clear();
        self.store.remove(CONVERSATION_IDS_KEY)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
