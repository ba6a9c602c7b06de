//! Streaming chunk-info delivery: a bounded channel of frames with an
//! end-of-stream sentinel. Both sides observe a receive-idle deadline, and
//! dropping either end cancels the other (the sender's `send` fails, the
//! receiver sees the channel close).

use std::time::Duration;
use tokio::sync::mpsc;
use tracing::warn;

use crate::meta::types::{ChunkInfoList, MetaStatus};

const STREAM_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug)]
pub enum StreamFrame {
    Data { chunk_index: u64, list: ChunkInfoList },
    Eof,
}

pub struct ChunkInfoStream {
    rx: mpsc::Receiver<StreamFrame>,
    idle_timeout: Duration,
}

pub struct ChunkInfoStreamSender {
    tx: mpsc::Sender<StreamFrame>,
    idle_timeout: Duration,
}

pub fn channel(idle_timeout: Duration) -> (ChunkInfoStreamSender, ChunkInfoStream) {
    let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
    (
        ChunkInfoStreamSender { tx, idle_timeout },
        ChunkInfoStream { rx, idle_timeout },
    )
}

impl ChunkInfoStreamSender {
    pub async fn send(&self, chunk_index: u64, list: ChunkInfoList) -> Result<(), MetaStatus> {
        self.send_frame(StreamFrame::Data { chunk_index, list }).await
    }

    /// Send the EOF sentinel. The stream is not complete without it.
    pub async fn finish(self) -> Result<(), MetaStatus> {
        self.send_frame(StreamFrame::Eof).await
    }

    async fn send_frame(&self, frame: StreamFrame) -> Result<(), MetaStatus> {
        match tokio::time::timeout(self.idle_timeout, self.tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                warn!("chunk-info stream receiver went away");
                Err(MetaStatus::RpcStreamError)
            }
            Err(_) => {
                warn!("chunk-info stream send stalled past idle deadline");
                Err(MetaStatus::RpcStreamError)
            }
        }
    }
}

impl ChunkInfoStream {
    /// Next data frame, or `None` once EOF arrives. A closed channel before
    /// EOF or an idle period past the deadline is a stream error.
    pub async fn recv(&mut self) -> Result<Option<(u64, ChunkInfoList)>, MetaStatus> {
        match tokio::time::timeout(self.idle_timeout, self.rx.recv()).await {
            Ok(Some(StreamFrame::Data { chunk_index, list })) => Ok(Some((chunk_index, list))),
            Ok(Some(StreamFrame::Eof)) => Ok(None),
            Ok(None) => {
                warn!("chunk-info stream closed before EOF");
                Err(MetaStatus::RpcStreamError)
            }
            Err(_) => {
                warn!("chunk-info stream idle past deadline");
                Err(MetaStatus::RpcStreamError)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::types::{ChunkInfo, ChunkInfoList};

    fn list(chunk_id: u64) -> ChunkInfoList {
        ChunkInfoList::new(vec![ChunkInfo {
            chunk_id,
            offset: 0,
            len: 1,
            size: 1,
            zero: false,
        }])
    }

    #[tokio::test]
    async fn test_frames_then_eof() {
        let (tx, mut rx) = channel(Duration::from_secs(1));
        tx.send(0, list(1)).await.unwrap();
        tx.send(1, list(2)).await.unwrap();
        tx.finish().await.unwrap();

        assert_eq!(rx.recv().await.unwrap().unwrap().0, 0);
        assert_eq!(rx.recv().await.unwrap().unwrap().0, 1);
        assert!(rx.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_drop_without_eof_is_error() {
        let (tx, mut rx) = channel(Duration::from_secs(1));
        tx.send(0, list(1)).await.unwrap();
        drop(tx);

        assert!(rx.recv().await.unwrap().is_some());
        assert_eq!(rx.recv().await.unwrap_err(), MetaStatus::RpcStreamError);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_deadline_fires() {
        let (_tx, mut rx) = channel(Duration::from_millis(50));
        assert_eq!(rx.recv().await.unwrap_err(), MetaStatus::RpcStreamError);
    }

    #[tokio::test]
    async fn test_receiver_drop_cancels_sender() {
        let (tx, rx) = channel(Duration::from_millis(50));
        drop(rx);
        // Bounded channel: once the buffer is gone the send fails.
        let mut result = Ok(());
        for i in 0..(STREAM_CHANNEL_CAPACITY + 1) as u64 {
            result = tx.send(i, list(i)).await;
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result.unwrap_err(), MetaStatus::RpcStreamError);
    }
}
