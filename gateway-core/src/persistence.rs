//! Durable order store keyed by client order id, with secondary indices by venue order id and
//! symbol: an `FnvIndexMap` guarded by a `parking_lot::RwLock` is mirrored to an append-only
//! JSON-lines file so a restart can rebuild it without a database dependency.

use crate::{
    balance::FnvIndexMap,
    order::{ClientOrderId, OrderRecord, OrderStatus, VenueOrderId},
};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("io error: {0}")]
    Io(String),
    #[error("corrupt persistence record: {0}")]
    Corrupt(String),
    #[error("no record for client order id {0}")]
    NotFound(ClientOrderId),
}

impl From<std::io::Error> for PersistenceError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

/// One line of the append-only log: either a full upsert or an appended transition. Reconstructing
/// the in-memory index replays these in file order.
#[derive(Debug, Clone, Serialize, Deserialize)]
enum LogLine {
    Put(OrderRecord),
}

struct Index {
    by_client_id: FnvIndexMap<ClientOrderId, OrderRecord>,
    by_venue_id: HashMap<VenueOrderId, ClientOrderId>,
    by_symbol: HashMap<SmolStr, Vec<ClientOrderId>>,
}

impl Index {
    fn empty() -> Self {
        Self {
            by_client_id: FnvIndexMap::default(),
            by_venue_id: HashMap::new(),
            by_symbol: HashMap::new(),
        }
    }

    fn upsert(&mut self, record: OrderRecord) {
        let client_id = record.client_order_id.clone();
        if let Some(venue_id) = &record.venue_order_id {
            self.by_venue_id.insert(venue_id.clone(), client_id.clone());
        }
        self.by_symbol
            .entry(record.symbol.clone())
            .or_default()
            .retain(|id| *id != client_id);
        self.by_symbol
            .entry(record.symbol.clone())
            .or_default()
            .push(client_id.clone());
        self.by_client_id.insert(client_id, record);
    }
}

/// The sole writer of order records. Writes are idempotent with respect to client order id:
/// concurrent updaters of the same id are serialized by the single `RwLock`.
pub struct OrderPersistence {
    path: PathBuf,
    index: parking_lot::RwLock<Index>,
    file: tokio::sync::Mutex<tokio::fs::File>,
}

impl OrderPersistence {
    /// Open (creating if absent) the log at `path`, replaying every line to rebuild the in-memory
    /// index before returning.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, PersistenceError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut index = Index::empty();
        if let Ok(contents) = tokio::fs::read_to_string(&path).await {
            for (lineno, line) in contents.lines().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                let parsed: LogLine = serde_json::from_str(line)
                    .map_err(|e| PersistenceError::Corrupt(format!("line {lineno}: {e}")))?;
                let LogLine::Put(record) = parsed;
                index.upsert(record);
            }
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            index: parking_lot::RwLock::new(index),
            file: tokio::sync::Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Upsert `record`, appending it to the durable log before updating the in-memory index so a
    /// crash mid-write leaves the log (not the transient index) as the source of truth.
    pub async fn put(&self, record: OrderRecord) -> Result<(), PersistenceError> {
        let line = serde_json::to_string(&LogLine::Put(record.clone()))
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        drop(file);

        self.index.write().upsert(record);
        Ok(())
    }

    pub fn get_by_client_id(&self, client_id: &ClientOrderId) -> Option<OrderRecord> {
        self.index.read().by_client_id.get(client_id).cloned()
    }

    pub fn get_by_venue_id(&self, venue_id: &VenueOrderId) -> Option<OrderRecord> {
        let index = self.index.read();
        let client_id = index.by_venue_id.get(venue_id)?;
        index.by_client_id.get(client_id).cloned()
    }

    pub fn list_by_symbol(&self, symbol: &str) -> Vec<OrderRecord> {
        let index = self.index.read();
        index
            .by_symbol
            .get(symbol)
            .into_iter()
            .flatten()
            .filter_map(|id| index.by_client_id.get(id).cloned())
            .collect()
    }

    /// Every record whose status is not yet terminal — the set startup recovery must resolve
    /// against the exchange before the gateway is marked ready.
    pub fn list_in_flight(&self) -> Vec<OrderRecord> {
        self.index
            .read()
            .by_client_id
            .values()
            .filter(|record| !record.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Every record startup recovery must resolve against the exchange: everything
    /// `list_in_flight` returns, plus `PendingVerification` orders. `PendingVerification` is a
    /// terminal status for the gateway's own idempotency check (a retry with the same client
    /// order id gets the pending outcome back rather than re-polling), but its true fill state
    /// was never confirmed before the process exited, so recovery must still fetch it.
    pub fn list_needing_recovery(&self) -> Vec<OrderRecord> {
        self.index
            .read()
            .by_client_id
            .values()
            .filter(|record| {
                !record.status.is_terminal() || record.status == OrderStatus::PendingVerification
            })
            .cloned()
            .collect()
    }

    /// Append a transition to an existing record without touching earlier entries.
    pub async fn append_transition(
        &self,
        client_id: &ClientOrderId,
        status: OrderStatus,
        note: Option<String>,
    ) -> Result<OrderRecord, PersistenceError> {
        let mut record = self
            .get_by_client_id(client_id)
            .ok_or_else(|| PersistenceError::NotFound(client_id.clone()))?;
        record.transition(status, note);
        self.put(record.clone()).await?;
        Ok(record)
    }

    /// Recompact the on-disk log to one `Put` line per client order id, dropping superseded
    /// intermediate lines. Not required for correctness (the index already dedupes on replay) but
    /// bounds log growth the way WAL rotation bounds the WAL.
    pub async fn compact(&self) -> Result<(), PersistenceError> {
        let records: Vec<OrderRecord> = self.index.read().by_client_id.values().cloned().collect();
        let tmp_path = self.path.with_extension("compacting");
        let mut tmp = tokio::fs::File::create(&tmp_path).await?;
        for record in &records {
            let line = serde_json::to_string(&LogLine::Put(record.clone()))
                .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
            tmp.write_all(line.as_bytes()).await?;
            tmp.write_all(b"\n").await?;
        }
        tmp.flush().await?;
        drop(tmp);
        tokio::fs::rename(&tmp_path, &self.path).await?;

        let new_file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        *self.file.lock().await = new_file;
        Ok(())
    }
}

/// Streaming line reader used by the `replay` CLI subcommand when the caller wants records without
/// paying for the full in-memory index.
pub async fn read_all_records(path: impl AsRef<Path>) -> Result<Vec<OrderRecord>, PersistenceError> {
    let file = match tokio::fs::File::open(path.as_ref()).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut lines = tokio::io::BufReader::new(file).lines();
    let mut records = Vec::new();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let LogLine::Put(record) = serde_json::from_str(&line)
            .map_err(|e| PersistenceError::Corrupt(e.to_string()))?;
        records.push(record);
    }
    Ok(records)
}
