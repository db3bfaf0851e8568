//! Transport over any async byte stream pair.

use crate::error::{McpError, McpResult};
use crate::framing::{self, encode_line};
use crate::protocol::Message;
use crate::transport::{Inbound, Transport, TransportKind};
use async_trait::async_trait;
use futures::SinkExt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedWrite, LinesCodec};
use tracing::{debug, trace};

type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Newline-delimited JSON over an `AsyncRead`/`AsyncWrite` pair.
pub struct StreamTransport {
    label: String,
    writer: Mutex<Option<FramedWrite<BoxedWriter, LinesCodec>>>,
    connected: Arc<AtomicBool>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StreamTransport {
    /// Wrap `reader`/`writer` and start the background read loop.
    pub fn new<R, W>(label: impl Into<String>, reader: R, writer: W) -> (Self, Inbound)
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Send + 'static,
    {
        let label = label.into();
        let connected = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::unbounded_channel();

        let reader_task = tokio::spawn(framing::read_loop(
            label.clone(),
            reader,
            tx,
            connected.clone(),
        ));

        let writer: BoxedWriter = Box::pin(writer);
        let transport = Self {
            label,
            writer: Mutex::new(Some(FramedWrite::new(writer, framing::codec()))),
            connected,
            reader: std::sync::Mutex::new(Some(reader_task)),
        };
        (transport, rx)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Close only the outbound half, leaving the read loop running.
    pub(crate) async fn close_writer(&self) {
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            let _ = SinkExt::<String>::close(&mut writer).await;
        }
    }

    fn stop_reader(&self) {
        let handle = match self.reader.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    async fn send(&self, message: &Message) -> McpResult<()> {
        let line = encode_line(message);
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(McpError::ConnectionClosed)?;

        trace!(server = %self.label, message = %line, "Sending message");
        if let Err(e) = writer.send(line).await {
            self.connected.store(false, Ordering::SeqCst);
            guard.take();
            return Err(McpError::connection_failed(format!(
                "write to {} failed: {e}",
                self.label
            )));
        }
        Ok(())
    }

    async fn close(&self) -> McpResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        self.close_writer().await;
        self.stop_reader();
        debug!(server = %self.label, "Stream transport closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.stop_reader();
    }
}
