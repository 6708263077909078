//! Sled-backed raft log and vote storage

use openraft::storage::{LogFlushed, LogState, RaftLogStorage};
use openraft::{
    AnyError, Entry, ErrorSubject, ErrorVerb, LogId, RaftLogReader, StorageError, StorageIOError,
    Vote,
};
use std::fmt::Debug;
use std::ops::RangeBounds;
use std::path::Path;

use super::fsm::{NodeId, TypeConfig};

const KEY_VOTE: &str = "vote";
const KEY_LAST_PURGED: &str = "last_purged";

/// Persistent raft log over two sled trees: entries keyed by big-endian
/// index, and a small metadata tree for the vote and purge watermark.
#[derive(Clone)]
pub struct LogStore {
    logs: sled::Tree,
    meta: sled::Tree,
}

impl LogStore {
    pub fn open(path: &Path) -> Result<Self, sled::Error> {
        let db = sled::open(path)?;
        Ok(Self {
            logs: db.open_tree("raft-log")?,
            meta: db.open_tree("raft-meta")?,
        })
    }

    fn log_key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    fn last_purged(&self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        let Some(bytes) = self.meta.get(KEY_LAST_PURGED).map_err(read_err)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes).map(Some).map_err(read_err)
    }
}

fn read_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::new(ErrorSubject::Logs, ErrorVerb::Read, AnyError::new(&e)),
    }
}

fn write_err(e: impl std::error::Error + 'static) -> StorageError<NodeId> {
    StorageError::IO {
        source: StorageIOError::new(ErrorSubject::Logs, ErrorVerb::Write, AnyError::new(&e)),
    }
}

impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + Send>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>> {
        let start = match range.start_bound() {
            std::ops::Bound::Included(i) => *i,
            std::ops::Bound::Excluded(i) => i + 1,
            std::ops::Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            std::ops::Bound::Included(i) => i + 1,
            std::ops::Bound::Excluded(i) => *i,
            std::ops::Bound::Unbounded => u64::MAX,
        };

        let mut entries = Vec::new();
        for item in self
            .logs
            .range(Self::log_key(start)..Self::log_key(end))
        {
            let (_, value) = item.map_err(read_err)?;
            let entry: Entry<TypeConfig> = serde_json::from_slice(&value).map_err(read_err)?;
            entries.push(entry);
        }

        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for LogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged_log_id = self.last_purged()?;

        let last_log_id = match self.logs.last().map_err(read_err)? {
            Some((_, value)) => {
                let entry: Entry<TypeConfig> = serde_json::from_slice(&value).map_err(read_err)?;
                Some(entry.log_id)
            }
            None => last_purged_log_id,
        };

        Ok(LogState {
            last_purged_log_id,
            last_log_id,
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(vote).map_err(write_err)?;
        self.meta.insert(KEY_VOTE, bytes).map_err(write_err)?;
        self.meta.flush_async().await.map_err(write_err)?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        let Some(bytes) = self.meta.get(KEY_VOTE).map_err(read_err)? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes).map(Some).map_err(read_err)
    }

    async fn append<I>(
        &mut self,
        entries: I,
        callback: LogFlushed<TypeConfig>,
    ) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            let bytes = serde_json::to_vec(&entry).map_err(write_err)?;
            self.logs
                .insert(Self::log_key(entry.log_id.index), bytes)
                .map_err(write_err)?;
        }

        let result = self.logs.flush_async().await;
        callback.log_io_completed(result.map(|_| ()).map_err(std::io::Error::other));

        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let keys: Vec<_> = self
            .logs
            .range(Self::log_key(log_id.index)..)
            .filter_map(|item| item.ok().map(|(key, _)| key))
            .collect();

        for key in keys {
            self.logs.remove(key).map_err(write_err)?;
        }
        self.logs.flush_async().await.map_err(write_err)?;

        Ok(())
    }

    async fn purge(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(&log_id).map_err(write_err)?;
        self.meta.insert(KEY_LAST_PURGED, bytes).map_err(write_err)?;

        let keys: Vec<_> = self
            .logs
            .range(..=Self::log_key(log_id.index))
            .filter_map(|item| item.ok().map(|(key, _)| key))
            .collect();

        for key in keys {
            self.logs.remove(key).map_err(write_err)?;
        }

        Ok(())
    }
}
