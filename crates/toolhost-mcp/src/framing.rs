//! Newline-delimited framing shared by every byte-stream transport.

use crate::protocol::Message;
use crate::transport::Incoming;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, trace, warn};

/// Longest accepted frame, in bytes.
pub const MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// Line codec with the frame length cap applied.
pub fn codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_FRAME_LENGTH)
}

/// Encode a message as one frame body (no delimiter).
pub fn encode_line(message: &Message) -> String {
    message.to_value().to_string()
}

/// Decode frames from `reader` until EOF or a framing error.
///
/// Undecodable lines are dropped unless they carry a readable id, in which
/// case they are forwarded as [`Incoming::Malformed`]. When the loop ends
/// `connected` is cleared and `tx` is dropped, which the receiving side
/// observes as a closed stream.
pub(crate) async fn read_loop<R>(
    label: String,
    reader: R,
    tx: mpsc::UnboundedSender<Incoming>,
    connected: Arc<AtomicBool>,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut frames = FramedRead::new(reader, codec());

    while let Some(frame) = frames.next().await {
        let line = match frame {
            Ok(line) => line,
            Err(e) => {
                warn!(server = %label, error = %e, "Frame error, closing read loop");
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let incoming = match Message::decode(line.as_bytes()) {
            Ok(message) => {
                trace!(server = %label, message = %line, "Received message");
                Incoming::Message(message)
            }
            Err(e) if e.id.is_some() => {
                warn!(server = %label, error = %e, "Received malformed frame");
                Incoming::Malformed(e)
            }
            Err(e) => {
                warn!(server = %label, error = %e, "Dropping undecodable frame");
                continue;
            }
        };
        if tx.send(incoming).is_err() {
            break;
        }
    }

    connected.store(false, Ordering::SeqCst);
    debug!(server = %label, "Read loop finished");
}
