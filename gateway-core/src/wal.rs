//! Append-only write-ahead log for critical events: a length-prefixed `bincode` header plus a
//! `crc32fast` checksum per record.

use crate::event_bus::Topic;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum WalError {
    #[error("io error: {0}")]
    Io(String),
    #[error("wal corrupt at offset {offset}: {reason}")]
    Corrupt { offset: u64, reason: String },
    #[error("serialization error: {0}")]
    Encode(String),
}

impl From<std::io::Error> for WalError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// A single durable record: `{sequence, timestamp, topic, payload, crc}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub topic: String,
    pub payload: serde_json::Value,
    pub crc: u32,
}

impl WalRecord {
    fn new(sequence: u64, topic: Topic, payload: serde_json::Value) -> Self {
        let payload_bytes = serde_json::to_vec(&payload).unwrap_or_default();
        let crc = crc32fast::hash(&payload_bytes);
        Self {
            sequence,
            timestamp: Utc::now(),
            topic: topic.to_string(),
            payload,
            crc,
        }
    }

    fn verify(&self) -> bool {
        let payload_bytes = serde_json::to_vec(&self.payload).unwrap_or_default();
        crc32fast::hash(&payload_bytes) == self.crc
    }
}

/// Append-only, fsync'd-on-write log. A record is considered durable once this call returns.
pub struct WriteAheadLog {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    sequence: std::sync::atomic::AtomicU64,
}

impl WriteAheadLog {
    /// Open (creating if absent) the WAL file at `dir/wal.log`, recovering the next sequence
    /// number from whatever valid records already exist.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self, WalError> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;
        let path = dir.join("wal.log");

        let (records, valid_len) = Self::scan_file(&path)?;
        if valid_len
            != std::fs::metadata(&path)
                .map(|m| m.len())
                .unwrap_or(0)
        {
            // Corrupt tail detected: truncate to the last valid record boundary.
            let file = std::fs::OpenOptions::new().write(true).open(&path)?;
            file.set_len(valid_len)?;
        }

        let next_sequence = records.last().map(|r| r.sequence + 1).unwrap_or(0);

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            sequence: std::sync::atomic::AtomicU64::new(next_sequence),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `payload` under `topic`, flush, and fsync before returning. Durable once this
    /// resolves.
    pub async fn append(
        &self,
        topic: Topic,
        payload: &serde_json::Value,
    ) -> Result<u64, WalError> {
        let sequence = self
            .sequence
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let record = WalRecord::new(sequence, topic, payload.clone());

        let frame = encode_frame(&record)?;

        let mut file = self.file.lock().await;
        file.write_all(&frame).await?;
        file.flush().await?;
        file.sync_all().await?;

        Ok(sequence)
    }

    /// Scan every valid record from `path` sequentially. A corrupt or truncated tail record is
    /// dropped rather than erroring the whole scan, matching "on corrupt tail, truncate to the
    /// last valid record".
    pub fn scan(path: impl AsRef<Path>) -> Result<Vec<WalRecord>, WalError> {
        Self::scan_file(path.as_ref()).map(|(records, _)| records)
    }

    fn scan_file(path: &Path) -> Result<(Vec<WalRecord>, u64), WalError> {
        use std::io::Read;

        let mut records = Vec::new();
        let mut valid_len: u64 = 0;

        let mut file = match std::fs::File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((records, 0)),
            Err(e) => return Err(e.into()),
        };

        loop {
            let mut len_buf = [0u8; 4];
            match file.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let frame_len = u32::from_le_bytes(len_buf) as usize;

            let mut frame_buf = vec![0u8; frame_len];
            if file.read_exact(&mut frame_buf).is_err() {
                // Truncated tail: stop here, keep everything validated so far.
                break;
            }

            let record: WalRecord = match bincode::deserialize(&frame_buf) {
                Ok(record) => record,
                Err(_) => break,
            };

            if !record.verify() {
                break;
            }

            valid_len += 4 + frame_len as u64;
            records.push(record);
        }

        Ok((records, valid_len))
    }
}

fn encode_frame(record: &WalRecord) -> Result<Vec<u8>, WalError> {
    let body = bincode::serialize(record).map_err(|e| WalError::Encode(e.to_string()))?;
    let len = body.len() as u32;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("gateway_wal_test_{label}_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[tokio::test]
    async fn append_then_reopen_recovers_sequence() {
        let dir = temp_dir("reopen");
        let wal = WriteAheadLog::open(&dir).await.unwrap();
        wal.append(Topic::RiskAlert, &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        wal.append(Topic::RiskAlert, &serde_json::json!({"a": 2}))
            .await
            .unwrap();
        drop(wal);

        let records = WriteAheadLog::scan(dir.join("wal.log")).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].sequence, 0);
        assert_eq!(records[1].sequence, 1);

        let wal = WriteAheadLog::open(&dir).await.unwrap();
        let seq = wal
            .append(Topic::RiskAlert, &serde_json::json!({"a": 3}))
            .await
            .unwrap();
        assert_eq!(seq, 2);
    }

    #[tokio::test]
    async fn corrupt_tail_is_truncated_on_open() {
        let dir = temp_dir("corrupt");
        let wal = WriteAheadLog::open(&dir).await.unwrap();
        wal.append(Topic::RiskAlert, &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        drop(wal);

        // Append a garbage trailing byte to simulate a crash mid-write.
        let path = dir.join("wal.log");
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        use std::io::Write;
        file.write_all(&[0xFF, 0xFF]).unwrap();
        drop(file);

        let wal = WriteAheadLog::open(&dir).await.unwrap();
        let records = WriteAheadLog::scan(&path).unwrap();
        assert_eq!(records.len(), 1);

        // Sequence continues from the valid record, not corrupted by the garbage bytes.
        let seq = wal
            .append(Topic::RiskAlert, &serde_json::json!({"a": 2}))
            .await
            .unwrap();
        assert_eq!(seq, 1);
    }
}
