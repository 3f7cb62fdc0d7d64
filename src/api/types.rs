use serde::{Deserialize, Serialize};

use crate::conversation::ChatTurn;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    /// Optional prior turns, oldest first. Entries with unknown roles or
    /// empty content are dropped before prompting.
    #[serde(default)]
    pub history: Option<Vec<ChatTurn>>,
}

#[derive(Debug, Serialize)]
pub struct ChatReply {
    pub reply: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}
