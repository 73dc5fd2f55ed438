use thiserror::Error;

/// Errors reported while turning a message body into an event
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// The body is not a well-formed JSON document
    #[error("failed to decode message body: {msg}")]
    Decode {
        /// Decoder message, including line and column
        msg: String,
    },

    /// The body decoded to something other than an object
    #[error("message body is a JSON {found}, expected an object")]
    NotAnObject {
        /// JSON type actually found
        found: &'static str,
    },

    /// The reserved name field is absent or empty
    #[error("event name is empty")]
    MissingEventName,

    /// The reserved name field holds a non-string value
    #[error("event name must be a string, found {found}")]
    InvalidEventName {
        /// Type of the stored value
        found: &'static str,
    },
}

impl ParseError {
    /// Whether the body itself could not be decoded
    pub fn is_decode_failure(&self) -> bool {
        matches!(self, ParseError::Decode { .. } | ParseError::NotAnObject { .. })
    }
}

impl From<serde_json::Error> for ParseError {
    fn from(err: serde_json::Error) -> Self {
        ParseError::Decode {
            msg: err.to_string(),
        }
    }
}
