pub mod errors;
pub mod ids;
pub mod messages;
pub mod protocol;

pub use errors::RelayError;
pub use ids::{ConnectionId, SessionToken};
pub use messages::{ChatMessage, ChatUserSummary};
