//! Dedicated writer task for outbound RPC messages.
//!
//! Every thread that talks to the host (listener thread, host executor,
//! foreground) hands encoded messages to one writer task through an
//! unbounded channel. Sending never blocks and never needs a runtime
//! context, so blocking handlers can issue host calls from plain threads.
//!
//! # Architecture
//!
//! ```text
//! Listener thread ─┐
//! Host executor   ─┼─► mpsc::UnboundedSender<Bytes> ─► Writer Task ─► Host
//! Foreground      ─┘
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::MsgPackCodec;
use crate::error::{BridgeError, Result};
use crate::protocol::RpcMessage;

/// Maximum messages to coalesce into a single write.
const MAX_BATCH_SIZE: usize = 64;

/// Handle for sending messages to the writer task.
///
/// Cheaply cloneable and usable from any thread.
#[derive(Clone)]
pub struct WriterHandle {
    /// Channel sender for encoded messages.
    tx: mpsc::UnboundedSender<Bytes>,
    /// Messages queued but not yet written.
    pending: Arc<AtomicUsize>,
}

impl WriterHandle {
    /// Encode and queue a message.
    pub fn send(&self, message: RpcMessage) -> Result<()> {
        let bytes = MsgPackCodec::encode(&message.into_value())?;
        self.send_bytes(Bytes::from(bytes))
    }

    /// Queue pre-encoded bytes.
    pub fn send_bytes(&self, bytes: Bytes) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(bytes).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            BridgeError::ConnectionClosed
        })
    }

    /// Get current pending message count.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// Whether the writer task has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Spawn the writer task on `runtime` and return a handle for sending.
pub fn spawn_writer_task<W>(writer: W, runtime: &Handle) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
    };

    let task = runtime.spawn(writer_loop(rx, writer, pending));

    (handle, task)
}

/// Main writer loop - receives messages and writes them out in batches.
async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = BytesMut::new();

    loop {
        let first = match rx.recv().await {
            Some(bytes) => bytes,
            None => {
                // Every handle dropped, clean shutdown
                return Ok(());
            }
        };

        batch.clear();
        batch.extend_from_slice(&first);
        let mut count = 1;

        while count < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(bytes) => {
                    batch.extend_from_slice(&bytes);
                    count += 1;
                }
                Err(_) => break,
            }
        }

        if let Err(e) = write_batch(&mut writer, &batch).await {
            tracing::error!(error = %e, "writer failed, closing host connection");
            rx.close();
            return Err(e);
        }

        pending.fetch_sub(count, Ordering::Release);
    }
}

async fn write_batch<W>(writer: &mut W, batch: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(batch).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MessageBuffer;
    use rmpv::Value;
    use std::io::Cursor;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    fn notification(method: &str) -> RpcMessage {
        RpcMessage::Notification {
            method: method.to_string(),
            params: vec![Value::from(1)],
        }
    }

    #[tokio::test]
    async fn test_writer_handle_send() {
        let (client, mut server) = duplex(4096);
        let (handle, _task) = spawn_writer_task(client, &Handle::current());

        handle.send(notification("nvim_command")).unwrap();

        let mut buf = vec![0u8; 256];
        let n = server.read(&mut buf).await.unwrap();

        let mut decoder = MessageBuffer::new();
        let messages = decoder.push(&buf[..n]).unwrap();
        assert_eq!(messages, vec![notification("nvim_command")]);
    }

    #[tokio::test]
    async fn test_writer_batching_preserves_order() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task(client, &Handle::current());

        for i in 0..10 {
            handle.send(notification(&format!("m{}", i))).unwrap();
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handle.pending_count(), 0);

        let mut buf = vec![0u8; 64 * 1024];
        let n = server.read(&mut buf).await.unwrap();
        let messages = MessageBuffer::new().push(&buf[..n]).unwrap();

        assert_eq!(messages.len(), 10);
        assert_eq!(messages[9], notification("m9"));
    }

    #[tokio::test]
    async fn test_send_after_shutdown_fails() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, &Handle::current());

        task.abort();
        let _ = task.await;

        assert!(handle.is_closed());
        assert!(matches!(
            handle.send(notification("late")),
            Err(BridgeError::ConnectionClosed)
        ));
        assert_eq!(handle.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_write_batch_writes_everything() {
        let mut buf = Cursor::new(Vec::new());
        write_batch(&mut buf, b"abcdef").await.unwrap();
        assert_eq!(buf.into_inner(), b"abcdef");
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_channel_close() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, &Handle::current());

        drop(handle);

        let result = task.await.unwrap();
        assert!(result.is_ok());
    }
}
