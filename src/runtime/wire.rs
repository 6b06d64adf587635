//! Line pumps between typed channels and a byte stream.
//!
//! Used on both ends of a worker connection: the supervisor writes
//! [`ParentMessage`](crate::core::ParentMessage)s and reads
//! [`WorkerMessage`](crate::core::WorkerMessage)s, the worker does the
//! opposite.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::{decode_line, encode_line};

/// Both halves of a pumped stream.
pub struct Wire<Out, In> {
    /// Messages queued here are written one line each, in order.
    pub outgoing: mpsc::UnboundedSender<Out>,
    /// Messages parsed from the stream.
    pub incoming: mpsc::UnboundedReceiver<In>,
    /// Finishes at end of stream.
    pub reader: JoinHandle<()>,
    /// Finishes once every sender is dropped and the queue is flushed.
    pub writer: JoinHandle<()>,
}

/// Start the reader and writer pumps.
///
/// Lines that do not parse as `In` are skipped: a worker may print unrelated
/// output on the protocol stream.
pub fn connect<Out, In, R, W>(reader: R, writer: W) -> Wire<Out, In>
where
    Out: Serialize + Send + 'static,
    In: DeserializeOwned + Send + 'static,
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (outgoing, mut outbox) = mpsc::unbounded_channel::<Out>();
    let (inbox, incoming) = mpsc::unbounded_channel::<In>();

    let writer = tokio::spawn(async move {
        let mut writer = writer;
        while let Some(message) = outbox.recv().await {
            let line = match encode_line(&message) {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "dropping unserializable message");
                    continue;
                }
            };
            if writer.write_all(line.as_bytes()).await.is_err() || writer.flush().await.is_err() {
                debug!("peer closed the stream");
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    let reader = tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let Ok(line) = std::str::from_utf8(&buf) else {
                        debug!(bytes = buf.len(), "skipping non-UTF-8 line");
                        continue;
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    match decode_line::<In>(line) {
                        Ok(message) => {
                            if inbox.send(message).is_err() {
                                break;
                            }
                        }
                        Err(_) => debug!(line = %line.trim_end(), "skipping non-protocol line"),
                    }
                }
                Err(err) => {
                    debug!(error = %err, "stream read failed");
                    break;
                }
            }
        }
    });

    Wire {
        outgoing,
        incoming,
        reader,
        writer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ParentMessage, WorkerMessage};

    #[tokio::test]
    async fn both_ends_exchange_messages_and_skip_noise() {
        let (left, right) = tokio::io::duplex(1024);
        let (left_read, left_write) = tokio::io::split(left);
        let (right_read, mut right_write) = tokio::io::split(right);

        let mut parent: Wire<ParentMessage, WorkerMessage> = connect(left_read, left_write);
        let mut worker: Wire<WorkerMessage, ParentMessage> = connect(right_read, tokio::io::sink());

        parent.outgoing.send(ParentMessage::Exit).unwrap();
        assert_eq!(worker.incoming.recv().await, Some(ParentMessage::Exit));

        right_write
            .write_all(b"some log line\n{\"type\":\"state\",\"processing\":true}\n")
            .await
            .unwrap();
        assert_eq!(
            parent.incoming.recv().await,
            Some(WorkerMessage::State { processing: true })
        );

        // Binary garbage does not end the stream.
        right_write
            .write_all(b"\xff\xfe binary noise\n{\"type\":\"state\",\"processing\":false}\n")
            .await
            .unwrap();
        assert_eq!(
            parent.incoming.recv().await,
            Some(WorkerMessage::State { processing: false })
        );

        right_write.shutdown().await.unwrap();
        assert_eq!(parent.incoming.recv().await, None);
    }
}
