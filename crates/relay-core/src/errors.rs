/// Failures the relay core surfaces to either side of a conversation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RelayError {
    /// Unknown or malformed visitor token.
    #[error("invalid session")]
    InvalidSession,

    /// Non-text frame, missing `TYPE`, unparseable payload, or a request
    /// that is not legal in the connection's current state.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("token space exhausted after {attempts} attempts")]
    TokenSpaceExhausted { attempts: u32 },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

impl RelayError {
    /// Stable code sent on the wire in `ERROR` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidSession => "INVALID_SESSION",
            Self::ProtocolViolation(_) => "PROTOCOL_VIOLATION",
            Self::TokenSpaceExhausted { .. } => "TOKEN_SPACE_EXHAUSTED",
            Self::StoreUnavailable(_) => "STORE_UNAVAILABLE",
        }
    }

    /// Only protocol violations end the connection; everything else fails
    /// the current request and leaves the socket open.
    pub fn terminates_connection(&self) -> bool {
        matches!(self, Self::ProtocolViolation(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(RelayError::InvalidSession.code(), "INVALID_SESSION");
        assert_eq!(
            RelayError::ProtocolViolation("x".into()).code(),
            "PROTOCOL_VIOLATION"
        );
        assert_eq!(
            RelayError::TokenSpaceExhausted { attempts: 3 }.code(),
            "TOKEN_SPACE_EXHAUSTED"
        );
        assert_eq!(
            RelayError::StoreUnavailable("down".into()).code(),
            "STORE_UNAVAILABLE"
        );
    }

    #[test]
    fn only_violations_terminate() {
        assert!(RelayError::ProtocolViolation("binary frame".into()).terminates_connection());
        assert!(!RelayError::InvalidSession.terminates_connection());
        assert!(!RelayError::TokenSpaceExhausted { attempts: 1 }.terminates_connection());
        assert!(!RelayError::StoreUnavailable("x".into()).terminates_connection());
    }

    #[test]
    fn display_includes_detail() {
        let err = RelayError::TokenSpaceExhausted { attempts: 16 };
        assert_eq!(err.to_string(), "token space exhausted after 16 attempts");
    }
}
