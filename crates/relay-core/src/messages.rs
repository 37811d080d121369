use serde::{Deserialize, Serialize};

use crate::ids::SessionToken;

/// A persisted chat line. Ordering authority is `id`; `sent_at` is display only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: i64,
    pub sent_at: String,
    pub origin_is_visitor: bool,
    pub text: String,
}

/// Entry in the admin's live conversation list.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUserSummary {
    #[serde(rename = "socketID")]
    pub token: SessionToken,
    #[serde(rename = "loginTime")]
    pub login_time: String,
    #[serde(rename = "lastMessage")]
    pub last_message: Option<String>,
}
