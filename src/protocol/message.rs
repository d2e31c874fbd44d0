use serde::{Deserialize, Serialize};

/// Text both sides must exchange before anything else.
pub const HANDSHAKE_TEXT: &str = "dirsync/1 hello";

/// One control message. The `type` tag picks the variant on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    Handshake {
        text: String,
    },
    /// Followed by exactly `size` raw bytes when `size` is nonzero.
    GetFile {
        path: String,
        size: u64,
    },
    #[serde(rename = "MKDIR")]
    MakeDir {
        path: String,
    },
    Unlink {
        path: String,
    },
    UnlinkDir {
        path: String,
    },
    /// Toggles the sender's transaction open or closed.
    Transaction,
    Success,
    Fail {
        error: String,
    },
}

impl Message {
    pub fn handshake() -> Self {
        Message::Handshake {
            text: HANDSHAKE_TEXT.to_string(),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Message::Fail {
            error: error.into(),
        }
    }

    /// Wire name of the variant, for logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "HANDSHAKE",
            Message::GetFile { .. } => "GET_FILE",
            Message::MakeDir { .. } => "MKDIR",
            Message::Unlink { .. } => "UNLINK",
            Message::UnlinkDir { .. } => "UNLINK_DIR",
            Message::Transaction => "TRANSACTION",
            Message::Success => "SUCCESS",
            Message::Fail { .. } => "FAIL",
        }
    }
}
