use crate::models::PollRecord;
use serde::{Deserialize, Serialize};

pub const NORMAL_CLOSURE: u16 = 1000;
// Reported when the stream ends without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

// What travels over the transport, independent of the websocket library
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close { code: u16, reason: String },
}

// Messages sent by the server
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Ping,
    Pong,
    PollResults { poll_results: PollRecord },
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Unknown,
}

// Messages sent by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    Pong,
    RequestUpdate { poll_id: String },
}

impl ClientMessage {
    pub fn to_frame(&self) -> Option<Frame> {
        match serde_json::to_string(self) {
            Ok(text) => Some(Frame::Text(text)),
            Err(e) => {
                log::error!("Failed to encode {:?}: {}", self, e);
                None
            }
        }
    }
}
