use super::protocol::{ABNORMAL_CLOSURE, Frame};
use super::{Connector, FrameSink, FrameStream};
use crate::error::SyncError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use log::debug;
use std::borrow::Cow;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;

// Connects to `{base_url}/{poll_id}/`
pub struct WsConnector {
    base_url: String,
}

impl WsConnector {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    pub fn url_for(&self, poll_id: &str) -> String {
        format!("{}/{}/", self.base_url.trim_end_matches('/'), poll_id)
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, poll_id: &str) -> Result<(FrameSink, FrameStream), SyncError> {
        let url = self.url_for(poll_id);
        debug!("Connecting to {}", url);
        let (socket, _response) = connect_async(url.as_str()).await?;
        let (writer, reader) = socket.split();

        let sink: FrameSink = Box::pin(
            writer
                .sink_map_err(SyncError::from)
                .with(|frame: Frame| future::ready(Ok::<_, SyncError>(into_message(frame)))),
        );
        let stream: FrameStream = Box::pin(reader.filter_map(|message| future::ready(from_message(message))));
        Ok((sink, stream))
    }
}

fn into_message(frame: Frame) -> Message {
    match frame {
        Frame::Text(text) => Message::Text(text),
        Frame::Close { code, reason } => Message::Close(Some(CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason),
        })),
    }
}

// Control frames other than close are handled by tungstenite itself
fn from_message(
    message: Result<Message, tokio_tungstenite::tungstenite::Error>,
) -> Option<Result<Frame, SyncError>> {
    match message {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes) {
            Ok(text) => Some(Ok(Frame::Text(text))),
            Err(_) => {
                debug!("Ignoring non-UTF-8 binary frame");
                None
            }
        },
        Ok(Message::Close(frame)) => Some(Ok(match frame {
            Some(frame) => Frame::Close {
                code: u16::from(frame.code),
                reason: frame.reason.into_owned(),
            },
            None => Frame::Close {
                code: ABNORMAL_CLOSURE,
                reason: String::new(),
            },
        })),
        Ok(_) => None,
        Err(e) => Some(Err(e.into())),
    }
}
