//! Transfer framing: metadata / chunk / complete messages and reassembly

use super::TransferError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Payload bytes per chunk frame
pub const CHUNK_SIZE: usize = 16384;

/// Upper bound accepted from a peer's metadata frame
pub const MAX_PAYLOAD_BYTES: usize = 512 * 1024 * 1024;

/// Application-level messages on the open channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransferFrame {
    /// Sent once, before the first chunk
    #[serde(rename_all = "camelCase")]
    Metadata {
        total_chunks: usize,
        total_size: usize,
        /// SHA-256 of the whole payload, hex encoded
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
    },

    Chunk { index: usize, data: Vec<u8> },

    /// Sent once, after the last chunk
    Complete,
}

impl TransferFrame {
    pub fn metadata_for(payload: &[u8]) -> Self {
        TransferFrame::Metadata {
            total_chunks: chunk_count(payload.len()),
            total_size: payload.len(),
            checksum: Some(checksum(payload)),
        }
    }
}

pub fn chunk_count(len: usize) -> usize {
    len.div_ceil(CHUNK_SIZE)
}

/// Chunk frames for `payload`, in index order
pub fn chunk_frames(payload: &[u8]) -> impl Iterator<Item = TransferFrame> + '_ {
    payload
        .chunks(CHUNK_SIZE)
        .enumerate()
        .map(|(index, data)| TransferFrame::Chunk {
            index,
            data: data.to_vec(),
        })
}

pub fn checksum(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Transfer progress as published to observers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Progress {
    pub current: usize,
    pub total: usize,
    pub percentage: u8,
}

impl Progress {
    pub fn new(current: usize, total: usize) -> Self {
        let percentage = if total == 0 {
            100
        } else {
            ((current.min(total) * 100) / total) as u8
        };
        Self {
            current,
            total,
            percentage,
        }
    }
}

/// Receiver-side slot array, filled by chunk index
#[derive(Debug)]
pub struct ChunkAssembler {
    slots: Vec<Option<Vec<u8>>>,
    total_size: usize,
    checksum: Option<String>,
    received: usize,
}

impl ChunkAssembler {
    pub fn new(total_chunks: usize, total_size: usize, checksum: Option<String>) -> Result<Self, TransferError> {
        if total_size > MAX_PAYLOAD_BYTES {
            return Err(TransferError::Protocol(format!(
                "payload of {} bytes exceeds the {} byte limit",
                total_size, MAX_PAYLOAD_BYTES
            )));
        }
        // Chunking is fixed at CHUNK_SIZE; anything else is a foreign framing
        let expected = chunk_count(total_size);
        if total_chunks != expected {
            return Err(TransferError::Protocol(format!(
                "{} chunks announced for {} bytes, expected {}",
                total_chunks, total_size, expected
            )));
        }

        Ok(Self {
            slots: vec![None; total_chunks],
            total_size,
            checksum,
            received: 0,
        })
    }

    /// Store a chunk; arrival order does not matter
    pub fn insert(&mut self, index: usize, data: Vec<u8>) -> Result<(), TransferError> {
        let total = self.slots.len();
        let slot = self.slots.get_mut(index).ok_or_else(|| {
            TransferError::Protocol(format!("chunk index {} out of range (0..{})", index, total))
        })?;

        if slot.is_none() {
            self.received += 1;
        }
        *slot = Some(data);
        Ok(())
    }

    pub fn progress(&self) -> Progress {
        Progress::new(self.received, self.slots.len())
    }

    /// Concatenate every slot. Any empty slot fails the whole transfer.
    pub fn finish(self) -> Result<Vec<u8>, TransferError> {
        let mut payload = Vec::with_capacity(self.total_size);
        for (index, slot) in self.slots.into_iter().enumerate() {
            let data = slot.ok_or(TransferError::MissingChunk(index))?;
            payload.extend_from_slice(&data);
        }

        if payload.len() != self.total_size {
            return Err(TransferError::Protocol(format!(
                "expected {} bytes, reassembled {}",
                self.total_size,
                payload.len()
            )));
        }

        if let Some(expected) = &self.checksum {
            if &checksum(&payload) != expected {
                return Err(TransferError::ChecksumMismatch);
            }
        }

        Ok(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn reassemble(payload: &[u8], order: impl Fn(Vec<TransferFrame>) -> Vec<TransferFrame>) -> Result<Vec<u8>, TransferError> {
        let TransferFrame::Metadata { total_chunks, total_size, checksum } = TransferFrame::metadata_for(payload) else {
            unreachable!()
        };
        let mut assembler = ChunkAssembler::new(total_chunks, total_size, checksum)?;
        for frame in order(chunk_frames(payload).collect()) {
            if let TransferFrame::Chunk { index, data } = frame {
                assembler.insert(index, data)?;
            }
        }
        assembler.finish()
    }

    #[test]
    fn test_frame_wire_format() {
        let meta = serde_json::to_value(TransferFrame::Metadata {
            total_chunks: 3,
            total_size: 40000,
            checksum: None,
        })
        .unwrap();
        assert_eq!(meta, serde_json::json!({"type": "metadata", "totalChunks": 3, "totalSize": 40000}));

        let chunk = serde_json::to_value(TransferFrame::Chunk { index: 1, data: vec![1, 2] }).unwrap();
        assert_eq!(chunk, serde_json::json!({"type": "chunk", "index": 1, "data": [1, 2]}));

        let complete: TransferFrame = serde_json::from_str(r#"{"type":"complete"}"#).unwrap();
        assert_eq!(complete, TransferFrame::Complete);
    }

    #[test]
    fn test_chunk_count_boundaries() {
        assert_eq!(chunk_count(1), 1);
        assert_eq!(chunk_count(CHUNK_SIZE), 1);
        assert_eq!(chunk_count(CHUNK_SIZE + 1), 2);
        assert_eq!(chunk_count(CHUNK_SIZE * 3), 3);
    }

    #[test]
    fn test_reassembly_tolerates_reordering() {
        let payload = sample_payload(CHUNK_SIZE * 4 + 123);
        let reversed = reassemble(&payload, |mut frames| {
            frames.reverse();
            frames
        })
        .unwrap();
        assert_eq!(reversed, payload);

        let interleaved = reassemble(&payload, |frames| {
            let (even, odd): (Vec<_>, Vec<_>) = frames
                .into_iter()
                .enumerate()
                .partition(|(i, _)| i % 2 == 0);
            odd.into_iter().chain(even).map(|(_, f)| f).collect()
        })
        .unwrap();
        assert_eq!(interleaved, payload);
    }

    #[test]
    fn test_missing_chunk_is_hard_failure() {
        let payload = sample_payload(CHUNK_SIZE * 3);
        let result = reassemble(&payload, |frames| {
            frames
                .into_iter()
                .filter(|f| !matches!(f, TransferFrame::Chunk { index: 1, .. }))
                .collect()
        });
        assert!(matches!(result, Err(TransferError::MissingChunk(1))));
    }

    #[test]
    fn test_corrupted_chunk_detected() {
        let payload = sample_payload(CHUNK_SIZE + 10);
        let result = reassemble(&payload, |mut frames| {
            if let Some(TransferFrame::Chunk { data, .. }) = frames.first_mut() {
                data[0] ^= 0xff;
            }
            frames
        });
        assert!(matches!(result, Err(TransferError::ChecksumMismatch)));
    }

    #[test]
    fn test_out_of_range_index_rejected() {
        let mut assembler = ChunkAssembler::new(2, CHUNK_SIZE + 1, None).unwrap();
        assert!(assembler.insert(2, vec![0]).is_err());
    }

    #[test]
    fn test_oversized_metadata_rejected() {
        assert!(ChunkAssembler::new(1, MAX_PAYLOAD_BYTES + 1, None).is_err());
        assert!(ChunkAssembler::new(1000, 10, None).is_err());
    }

    #[test]
    fn test_nonstandard_chunking_rejected() {
        // One-byte chunks
        assert!(matches!(
            ChunkAssembler::new(100, 100, None),
            Err(TransferError::Protocol(_))
        ));
        // Slot inflation just under the size limit
        assert!(ChunkAssembler::new(MAX_PAYLOAD_BYTES, MAX_PAYLOAD_BYTES, None).is_err());
        // Too few chunks for the size
        assert!(ChunkAssembler::new(1, CHUNK_SIZE + 1, None).is_err());

        assert!(ChunkAssembler::new(1, 100, None).is_ok());
        assert!(ChunkAssembler::new(2, CHUNK_SIZE + 1, None).is_ok());
        assert!(ChunkAssembler::new(0, 0, None).is_ok());
    }

    #[test]
    fn test_progress_percentage() {
        let mut assembler = ChunkAssembler::new(4, 4 * CHUNK_SIZE, None).unwrap();
        assembler.insert(0, vec![]).unwrap();
        assembler.insert(0, vec![]).unwrap();
        assert_eq!(assembler.progress(), Progress { current: 1, total: 4, percentage: 25 });
    }
}
