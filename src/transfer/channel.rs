//! Data channel: newline-delimited JSON frames over any async byte stream
//!
//! Outbound frames go through a writer task so the sender can observe how
//! many bytes are still buffered and hold back when over the threshold.

use super::frame::{TransferFrame, CHUNK_SIZE};
use super::TransferError;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Stop enqueuing frames while more than this many bytes are buffered
pub const BUFFER_THRESHOLD: usize = CHUNK_SIZE * 10;

pub const BACKPRESSURE_POLL: Duration = Duration::from_millis(10);

pub struct FrameWriter {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    buffered: Arc<AtomicUsize>,
    task: Option<JoinHandle<std::io::Result<()>>>,
}

impl FrameWriter {
    pub fn spawn<W>(writer: W) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let buffered = Arc::new(AtomicUsize::new(0));
        let counter = buffered.clone();

        let task = tokio::spawn(async move {
            let mut writer = writer;
            while let Some(line) = rx.recv().await {
                let len = line.len();
                let result = writer.write_all(&line).await;
                counter.fetch_sub(len, Ordering::SeqCst);
                result?;
            }
            writer.flush().await?;
            writer.shutdown().await
        });

        Self {
            tx: Some(tx),
            buffered,
            task: Some(task),
        }
    }

    /// Bytes handed to `send` but not yet written to the stream
    pub fn buffered_amount(&self) -> usize {
        self.buffered.load(Ordering::SeqCst)
    }

    pub fn send<T: Serialize>(&self, message: &T) -> Result<(), TransferError> {
        let tx = self.tx.as_ref().ok_or(TransferError::ChannelClosed)?;

        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');
        let len = line.len();

        self.buffered.fetch_add(len, Ordering::SeqCst);
        tx.send(line).map_err(|_| {
            self.buffered.fetch_sub(len, Ordering::SeqCst);
            TransferError::ChannelClosed
        })
    }

    /// Wait until the outbound buffer is at or below `threshold`
    pub async fn wait_for_drain(&self, threshold: usize) -> Result<(), TransferError> {
        while self.buffered_amount() > threshold {
            if self.tx.as_ref().map_or(true, |tx| tx.is_closed()) {
                return Err(TransferError::ChannelClosed);
            }
            tokio::time::sleep(BACKPRESSURE_POLL).await;
        }
        Ok(())
    }

    /// Flush everything queued and close the stream
    pub async fn finish(mut self) -> Result<(), TransferError> {
        drop(self.tx.take());
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| TransferError::Protocol(format!("writer task failed: {}", e)))??;
        }
        Ok(())
    }
}

pub struct FrameReader<R> {
    lines: Lines<BufReader<R>>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
        }
    }

    /// Next message, or None at end of stream
    pub async fn recv_json<T: DeserializeOwned>(&mut self) -> Result<Option<T>, TransferError> {
        loop {
            match self.lines.next_line().await? {
                Some(line) if line.trim().is_empty() => continue,
                Some(line) => return Ok(Some(serde_json::from_str(&line)?)),
                None => return Ok(None),
            }
        }
    }

    pub async fn recv(&mut self) -> Result<Option<TransferFrame>, TransferError> {
        self.recv_json().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_the_stream_in_order() {
        let (a, b) = tokio::io::duplex(1024);
        let writer = FrameWriter::spawn(a);
        let mut reader = FrameReader::new(b);

        writer.send(&TransferFrame::Metadata { total_chunks: 1, total_size: 3, checksum: None }).unwrap();
        writer.send(&TransferFrame::Chunk { index: 0, data: vec![7, 8, 9] }).unwrap();
        writer.send(&TransferFrame::Complete).unwrap();

        let finished = tokio::spawn(writer.finish());

        assert!(matches!(reader.recv().await.unwrap(), Some(TransferFrame::Metadata { .. })));
        assert_eq!(
            reader.recv().await.unwrap(),
            Some(TransferFrame::Chunk { index: 0, data: vec![7, 8, 9] })
        );
        assert_eq!(reader.recv().await.unwrap(), Some(TransferFrame::Complete));
        assert_eq!(reader.recv().await.unwrap(), None);

        finished.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_buffered_amount_drains() {
        // Small pipe: the writer task blocks until the reader catches up
        let (a, b) = tokio::io::duplex(64);
        let writer = FrameWriter::spawn(a);
        let mut reader = FrameReader::new(b);

        for index in 0..20 {
            writer.send(&TransferFrame::Chunk { index, data: vec![0; 32] }).unwrap();
        }
        assert!(writer.buffered_amount() > 0);

        let drain = tokio::spawn(async move {
            let mut count = 0;
            while let Some(TransferFrame::Chunk { .. }) = reader.recv().await.unwrap() {
                count += 1;
            }
            count
        });

        writer.wait_for_drain(0).await.unwrap();
        assert_eq!(writer.buffered_amount(), 0);
        writer.finish().await.unwrap();
        assert_eq!(drain.await.unwrap(), 20);
    }

    #[tokio::test]
    async fn test_send_after_peer_gone() {
        let (a, b) = tokio::io::duplex(16);
        drop(b);
        let writer = FrameWriter::spawn(a);

        writer.send(&TransferFrame::Complete).unwrap();
        // The writer task fails on the broken pipe and the wait reports it
        let result = writer.wait_for_drain(0).await;
        assert!(result.is_ok() || matches!(result, Err(TransferError::ChannelClosed)));
        assert!(writer.finish().await.is_err());
    }
}
