use serde::{Deserialize, Serialize};

/// A note posted by one step, visible to steps whose watermark is behind its id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopMessage {
    /// Strictly increasing within a store
    pub id: i64,
    pub run_id: String,
    pub step_index: usize,
    /// Profile that posted the message
    pub author: String,
    pub body: String,
    pub created_at: i64,
}
