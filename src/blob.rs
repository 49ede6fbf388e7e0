//! Chunked transfer of binary payloads over the line channel.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

use crate::error::ErrorCode;
use crate::message::base64_bytes;

/// One piece of a chunked blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlobChunk {
    pub id: String,
    pub sequence: u64,
    pub total_length: u64,
    #[serde(with = "base64_bytes")]
    pub blob: Vec<u8>,
    #[serde(default)]
    pub end: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BlobError {
    #[error("blob {id}: missing chunk {sequence}")]
    Gap { id: String, sequence: u64 },
    #[error("blob {id}: assembled {actual} bytes, declared {declared}")]
    LengthMismatch {
        id: String,
        declared: u64,
        actual: u64,
    },
    #[error("blob {id}: exceeds {limit} bytes")]
    TooLarge { id: String, limit: usize },
}

impl BlobError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::BlobIncomplete
    }
}

/// Split `data` into chunks of at most `chunk_size` bytes. Only the last chunk
/// has `end = true`; an empty payload yields a single empty final chunk.
pub fn split_blob(id: &str, data: &[u8], chunk_size: usize) -> Vec<BlobChunk> {
    let chunk_size = chunk_size.max(1);
    let total_length = data.len() as u64;
    if data.is_empty() {
        return vec![BlobChunk {
            id: id.to_string(),
            sequence: 0,
            total_length,
            blob: Vec::new(),
            end: true,
        }];
    }

    let count = data.len().div_ceil(chunk_size);
    data.chunks(chunk_size)
        .enumerate()
        .map(|(i, piece)| BlobChunk {
            id: id.to_string(),
            sequence: i as u64,
            total_length,
            blob: piece.to_vec(),
            end: i + 1 == count,
        })
        .collect()
}

#[derive(Debug, Default)]
struct PartialBlob {
    chunks: BTreeMap<u64, Vec<u8>>,
    size: usize,
}

/// Reassembles chunked blobs, keyed by blob id.
#[derive(Debug)]
pub struct BlobAssembler {
    pending: HashMap<String, PartialBlob>,
    max_bytes: usize,
}

impl Default for BlobAssembler {
    fn default() -> Self {
        Self::new(usize::MAX)
    }
}

impl BlobAssembler {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            pending: HashMap::new(),
            max_bytes,
        }
    }

    /// Number of blobs with buffered chunks.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Buffer `chunk`. Returns the full payload once the final chunk arrives and
    /// every earlier sequence number is present. Any failure discards the blob.
    pub fn push(&mut self, chunk: BlobChunk) -> Result<Option<Vec<u8>>, BlobError> {
        let BlobChunk {
            id,
            sequence,
            total_length,
            blob,
            end,
        } = chunk;

        let entry = self.pending.entry(id.clone()).or_default();
        let added = blob.len();
        if let Some(previous) = entry.chunks.insert(sequence, blob) {
            entry.size -= previous.len();
        }
        entry.size += added;

        if entry.size > self.max_bytes {
            self.pending.remove(&id);
            return Err(BlobError::TooLarge {
                id,
                limit: self.max_bytes,
            });
        }
        if !end {
            return Ok(None);
        }

        let Some(partial) = self.pending.remove(&id) else {
            return Ok(None);
        };
        // Chunks past the final sequence number are ignored.
        let mut data = Vec::with_capacity(partial.size);
        let mut chunks = partial.chunks.into_iter();
        for expected in 0..=sequence {
            match chunks.next() {
                Some((seq, bytes)) if seq == expected => data.extend_from_slice(&bytes),
                _ => {
                    return Err(BlobError::Gap {
                        id,
                        sequence: expected,
                    })
                }
            }
        }

        if total_length != 0 && total_length != data.len() as u64 {
            return Err(BlobError::LengthMismatch {
                id,
                declared: total_length,
                actual: data.len() as u64,
            });
        }
        debug!(blob_id = %id, bytes = data.len(), "blob assembled");
        Ok(Some(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn reassemble(chunks: Vec<BlobChunk>) -> Result<Option<Vec<u8>>, BlobError> {
        let mut assembler = BlobAssembler::default();
        let mut result = Ok(None);
        for chunk in chunks {
            result = assembler.push(chunk);
            if result.is_err() {
                break;
            }
        }
        result
    }

    #[test]
    fn test_split_then_assemble_sizes() {
        let n = 16;
        for len in [0, 1, n - 1, n, n + 1, 10 * n] {
            let data = payload(len);
            let chunks = split_blob("b", &data, n);
            assert_eq!(chunks.iter().filter(|c| c.end).count(), 1);
            assert!(chunks.last().unwrap().end);
            assert_eq!(reassemble(chunks).unwrap(), Some(data), "len {}", len);
        }
    }

    #[test]
    fn test_split_chunk_count() {
        assert_eq!(split_blob("b", &[], 4).len(), 1);
        assert_eq!(split_blob("b", &payload(4), 4).len(), 1);
        assert_eq!(split_blob("b", &payload(5), 4).len(), 2);
        let chunks = split_blob("b", &payload(9), 4);
        let seqs: Vec<u64> = chunks.iter().map(|c| c.sequence).collect();
        assert_eq!(seqs, vec![0, 1, 2]);
        assert!(chunks.iter().all(|c| c.total_length == 9));
    }

    #[test]
    fn test_out_of_order_chunks_assemble() {
        let data = payload(30);
        let mut chunks = split_blob("b", &data, 8);
        let last = chunks.pop().unwrap();
        chunks.reverse();
        chunks.push(last);
        assert_eq!(reassemble(chunks).unwrap(), Some(data));
    }

    #[test]
    fn test_gap_is_rejected_and_discarded() {
        let mut chunks = split_blob("b", &payload(30), 8);
        chunks.remove(1);
        let mut assembler = BlobAssembler::default();
        let mut last = Ok(None);
        for chunk in chunks {
            last = assembler.push(chunk);
        }
        assert_eq!(
            last.unwrap_err(),
            BlobError::Gap {
                id: "b".into(),
                sequence: 1
            }
        );
        assert_eq!(assembler.pending(), 0);
    }

    #[test]
    fn test_length_mismatch() {
        let mut chunks = split_blob("b", &payload(10), 4);
        for c in &mut chunks {
            c.total_length = 11;
        }
        let err = reassemble(chunks).unwrap_err();
        assert!(matches!(err, BlobError::LengthMismatch { actual: 10, .. }));
        assert_eq!(err.code(), ErrorCode::BlobIncomplete);
    }

    #[test]
    fn test_size_limit() {
        let mut assembler = BlobAssembler::new(10);
        let chunks = split_blob("big", &payload(20), 6);
        let results: Vec<_> = chunks.into_iter().map(|c| assembler.push(c)).collect();
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(BlobError::TooLarge { .. }))));
    }

    #[test]
    fn test_interleaved_blobs_stay_separate() {
        let a = payload(12);
        let b: Vec<u8> = payload(12).into_iter().rev().collect();
        let mut assembler = BlobAssembler::default();
        let mut done = Vec::new();
        for (ca, cb) in split_blob("a", &a, 5)
            .into_iter()
            .zip(split_blob("b", &b, 5))
        {
            if let Some(d) = assembler.push(ca).unwrap() {
                done.push(("a", d));
            }
            if let Some(d) = assembler.push(cb).unwrap() {
                done.push(("b", d));
            }
        }
        assert_eq!(done, vec![("a", a), ("b", b)]);
    }

    #[test]
    fn test_chunk_wire_shape() {
        let chunk = &split_blob("x", b"hi", 8)[0];
        let v = serde_json::to_value(chunk).unwrap();
        assert_eq!(v["totalLength"], 2);
        assert_eq!(v["blob"], "aGk=");
        assert_eq!(v["end"], true);
    }
}
