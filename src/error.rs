use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A frame could not be decoded; the frame is discarded, the link stays up.
    MalformedMessage,
    /// No member with that name is declared on the target object.
    UnknownMember,
    InvalidArguments,
    /// No response arrived within the configured round-trip window.
    RequestTimeout,
    /// The socket closed or failed while the request was pending.
    ConnectionLost,
    /// The target id is no longer exposed by the server.
    StaleReference,
    SerializeFailed,
    DeserializeFailed,
    WebSocketConnectFailed,
    WebSocketAcceptFailed,
    WebSocketSendFailed,
    WebSocketClosed,
    TcpBindFailed,
    InvalidState,
    #[serde(untagged)]
    Unknown(String),
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Error {
    pub kind: ErrorKind,
    pub msg: String,
}

impl Error {
    #[must_use]
    pub fn new(kind: ErrorKind, msg: String) -> Self {
        Self { kind, msg }
    }

    #[must_use]
    pub fn kind(kind: ErrorKind) -> Self {
        Self {
            kind,
            msg: String::default(),
        }
    }
}

impl std::error::Error for Error {}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Self::kind(kind)
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self {
            kind: ErrorKind::DeserializeFailed,
            msg: value.to_string(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.msg.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            write!(f, "{:?}: {}", self.kind, self.msg)
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind() {
        let kind = ErrorKind::RequestTimeout;
        let error: Error = kind.into();
        assert_eq!(error.to_string(), "RequestTimeout");

        let error = Error::new(ErrorKind::UnknownMember, "no such property: Foo".into());
        assert_eq!(error.to_string(), "UnknownMember: no such property: Foo");

        let error: Error = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert_eq!(error.kind, ErrorKind::DeserializeFailed);
    }

    #[test]
    fn test_error_on_the_wire() {
        let error = Error::new(ErrorKind::StaleReference, "deleted".into());
        let text = serde_json::to_string(&error).unwrap();
        let back: Error = serde_json::from_str(&text).unwrap();
        assert_eq!(back, error);
    }
}
