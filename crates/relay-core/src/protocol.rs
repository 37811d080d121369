//! Closed wire vocabulary for both endpoints.
//!
//! Every frame is a JSON object whose `TYPE` field selects the variant. The
//! payload, when present, lives under a key named after the type. Inbound
//! frames are decoded exactly once at the socket boundary; outbound frames are
//! encoded by `to_wire`.

use serde::{Deserialize, Deserializer, Serialize};

use crate::errors::RelayError;
use crate::ids::SessionToken;
use crate::messages::{ChatMessage, ChatUserSummary};

/// Admin UI screen an admin-bound frame targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum View {
    MainScreen,
    ChatScreen,
}

/// `{code, message}` body of an `ERROR` frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&RelayError> for ErrorBody {
    fn from(err: &RelayError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

// ── Inbound ──

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "TYPE")]
pub enum AdminInbound {
    #[serde(rename = "ONLINE")]
    Online,
    #[serde(rename = "OFFLINE")]
    Offline,
    #[serde(rename = "SOCKETID")]
    SelectSession {
        #[serde(rename = "SOCKETID")]
        token: SessionToken,
    },
    #[serde(rename = "MESSAGE")]
    Message {
        #[serde(rename = "MESSAGE")]
        text: String,
        #[serde(rename = "SOCKETID")]
        target: SessionToken,
    },
    #[serde(other)]
    Unknown,
}

impl AdminInbound {
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::ProtocolViolation(e.to_string()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "TYPE")]
pub enum VisitorInbound {
    /// Resume with a previously issued token. A missing or non-string token
    /// is kept as `None` so it can be answered with `INVALIDCOOKIE`.
    #[serde(rename = "COOKIE")]
    Resume {
        #[serde(rename = "COOKIE", default, deserialize_with = "lenient_token")]
        token: Option<SessionToken>,
    },
    #[serde(rename = "GETCOOKIE")]
    RequestNewToken,
    #[serde(rename = "MESSAGE")]
    Message {
        #[serde(rename = "MESSAGE")]
        text: String,
    },
    #[serde(other)]
    Unknown,
}

impl VisitorInbound {
    pub fn decode(text: &str) -> Result<Self, RelayError> {
        serde_json::from_str(text).map_err(|e| RelayError::ProtocolViolation(e.to_string()))
    }
}

fn lenient_token<'de, D>(deserializer: D) -> Result<Option<SessionToken>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = serde_json::Value::deserialize(deserializer)?;
    Ok(value.as_str().map(SessionToken::from_raw))
}

// ── Outbound ──

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "TYPE")]
pub enum AdminOutbound {
    #[serde(rename = "ONLINE")]
    Online,
    #[serde(rename = "OFFLINE")]
    Offline,
    #[serde(rename = "CHATUSERS")]
    ChatUsers {
        #[serde(rename = "CHATUSERS")]
        users: Vec<ChatUserSummary>,
        #[serde(rename = "CONNECTEDUSER")]
        connected: usize,
    },
    #[serde(rename = "ADDCHATUSER")]
    AddChatUser {
        #[serde(rename = "ADDCHATUSER")]
        user: ChatUserSummary,
    },
    #[serde(rename = "REMOVECHATUSER")]
    RemoveChatUser {
        #[serde(rename = "SOCKETID")]
        token: SessionToken,
    },
    #[serde(rename = "ADDCONNECTEDUSER")]
    AddConnectedUser,
    #[serde(rename = "REMOVECONNECTEDUSER")]
    RemoveConnectedUser,
    #[serde(rename = "CHATLOG")]
    ChatLog {
        #[serde(rename = "CHATLOG")]
        messages: Vec<ChatMessage>,
    },
    #[serde(rename = "APPENDMESSAGE")]
    AppendMessage {
        #[serde(rename = "APPENDMESSAGE")]
        message: ChatMessage,
    },
    #[serde(rename = "NEWMESSAGE")]
    NewMessage {
        #[serde(rename = "NEWMESSAGE")]
        token: SessionToken,
    },
    #[serde(rename = "ERROR")]
    Error {
        #[serde(rename = "ERROR")]
        error: ErrorBody,
    },
}

impl AdminOutbound {
    pub fn view(&self) -> View {
        match self {
            Self::Online | Self::Offline => View::MainScreen,
            _ => View::ChatScreen,
        }
    }

    /// Serialize with the `VIEW` field attached.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        let mut value = serde_json::to_value(self)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("VIEW".into(), serde_json::to_value(self.view())?);
        }
        serde_json::to_string(&value)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "TYPE")]
pub enum VisitorOutbound {
    #[serde(rename = "ONLINE")]
    Online,
    #[serde(rename = "OFFLINE")]
    Offline,
    #[serde(rename = "SETCOOKIE")]
    SetCookie {
        #[serde(rename = "COOKIE")]
        token: SessionToken,
    },
    #[serde(rename = "SENDCOOKIE")]
    SendCookie,
    #[serde(rename = "INVALIDCOOKIE")]
    InvalidCookie,
    #[serde(rename = "CHATLOG")]
    ChatLog {
        #[serde(rename = "CHATLOG")]
        messages: Vec<ChatMessage>,
    },
    #[serde(rename = "MESSAGE")]
    Message {
        #[serde(rename = "MESSAGE")]
        message: ChatMessage,
    },
    #[serde(rename = "ERROR")]
    Error {
        #[serde(rename = "ERROR")]
        error: ErrorBody,
    },
}

impl VisitorOutbound {
    pub fn presence(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }

    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
