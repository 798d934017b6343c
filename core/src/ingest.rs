use serde::{Deserialize, Serialize};

/// One turn of a conversation, as carried by the `ingest-conversation` and
/// `deep-research` job payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationMessage {
    pub id: String,
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub name: Option<String>,
    pub content: String,
    pub timestamp: i64,
}
