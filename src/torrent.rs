// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Torrent Processing
//!
//! The `process_torrent` task: decodes an uploaded torrent and replaces the
//! file rows of its record. Decoding and persistence are collaborators
//! behind [`TorrentDecoder`] and [`TorrentStore`]; the rows are always
//! replaced as a whole so reprocessing the same torrent is idempotent.

use crate::{dispatcher::TaskHandler, errors::TaskError, state::TaskId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

/// Task name under which [`ProcessTorrent`] is registered.
pub const PROCESS_TORRENT: &str = "process_torrent";

/// Decoded torrent metainfo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metainfo {
    pub info: InfoDictionary,
}

/// The `info` dictionary of a torrent.
///
/// Single-file torrents carry `name` and `length`; multi-file torrents
/// carry `files`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoDictionary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<FileEntry>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: u64,
}

/// One file of a torrent record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRow {
    pub path: String,
    pub length: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentRecord {
    pub id: Uuid,
    pub name: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("malformed torrent `{0}`")]
    Malformed(String),

    #[error("torrent info has no `{0}`")]
    MissingField(&'static str),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store cannot be reached right now
    #[error("store unavailable `{0}`")]
    Unavailable(String),

    /// The store refused the data
    #[error("store rejected the rows `{0}`")]
    Rejected(String),
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => TaskError::Transient(err.to_string()),
            StoreError::Rejected(_) => TaskError::MalformedPayload(err.to_string()),
        }
    }
}

/// Turns raw torrent bytes into [`Metainfo`].
#[cfg_attr(test, mockall::automock)]
pub trait TorrentDecoder: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> Result<Metainfo, DecodeError>;
}

/// Persistence of torrent records and their file rows.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TorrentStore: Send + Sync {
    async fn get_record(&self, id: Uuid) -> Result<Option<TorrentRecord>, StoreError>;

    /// Deletes every row of `parent_id`, then inserts `rows`.
    async fn replace_child_rows(&self, parent_id: Uuid, rows: Vec<FileRow>)
        -> Result<(), StoreError>;
}

/// Reads [`Metainfo`] serialized as JSON.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonMetainfoDecoder;

impl TorrentDecoder for JsonMetainfoDecoder {
    fn decode(&self, bytes: &[u8]) -> Result<Metainfo, DecodeError> {
        serde_json::from_slice(bytes).map_err(|e| DecodeError::Malformed(e.to_string()))
    }
}

/// File rows of a torrent: one per `files` entry, or a single row built
/// from `name` and `length`.
///
/// Nested paths are flattened into one `/`-separated string.
pub fn file_rows(metainfo: &Metainfo) -> Result<Vec<FileRow>, DecodeError> {
    let info = &metainfo.info;

    match &info.files {
        Some(files) => Ok(files
            .iter()
            .map(|file| FileRow {
                path: file.path.join("/"),
                length: file.length,
            })
            .collect()),
        None => {
            let name = info.name.clone().ok_or(DecodeError::MissingField("name"))?;
            let length = info.length.ok_or(DecodeError::MissingField("length"))?;
            Ok(vec![FileRow {
                path: name,
                length,
            }])
        }
    }
}

pub fn total_size(rows: &[FileRow]) -> u64 {
    rows.iter().map(|row| row.length).sum()
}

/// Handler of the `process_torrent` task.
///
/// The task id is the UUID of the torrent record.
pub struct ProcessTorrent {
    decoder: Arc<dyn TorrentDecoder>,
    store: Arc<dyn TorrentStore>,
}

impl ProcessTorrent {
    pub fn new(decoder: Arc<dyn TorrentDecoder>, store: Arc<dyn TorrentStore>) -> Self {
        ProcessTorrent { decoder, store }
    }
}

#[async_trait]
impl TaskHandler for ProcessTorrent {
    async fn handle(&self, payload: &[u8], task_id: &TaskId) -> Result<(), TaskError> {
        let record_id = task_id.as_uuid().ok_or_else(|| {
            TaskError::MalformedPayload(format!("task id `{}` is not a record id", task_id))
        })?;

        let metainfo = self
            .decoder
            .decode(payload)
            .map_err(|e| TaskError::MalformedPayload(e.to_string()))?;
        let rows = file_rows(&metainfo).map_err(|e| TaskError::MalformedPayload(e.to_string()))?;

        let record = self
            .store
            .get_record(record_id)
            .await?
            .ok_or_else(|| TaskError::TargetNotFound(format!("torrent {}", record_id)))?;

        debug!(torrent = record.name, files = rows.len(), "replacing file rows");
        let (files, bytes) = (rows.len(), total_size(&rows));
        self.store.replace_child_rows(record.id, rows).await?;

        info!(torrent = %record.id, files, bytes, "torrent processed");
        Ok(())
    }
}

#[derive(Default)]
struct MemoryStoreState {
    records: HashMap<Uuid, TorrentRecord>,
    rows: HashMap<Uuid, Vec<FileRow>>,
    unavailable: u32,
    replacements: usize,
}

/// [`TorrentStore`] kept in memory, for tests and local runs.
#[derive(Clone, Default)]
pub struct MemoryTorrentStore {
    state: Arc<Mutex<MemoryStoreState>>,
}

impl MemoryTorrentStore {
    pub fn new() -> Self {
        MemoryTorrentStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryStoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert_record(&self, record: TorrentRecord) {
        self.lock().records.insert(record.id, record);
    }

    /// The next `count` store calls fail with [`StoreError::Unavailable`].
    pub fn fail_next_calls(&self, count: u32) {
        self.lock().unavailable = count;
    }

    pub fn rows(&self, parent_id: Uuid) -> Vec<FileRow> {
        self.lock().rows.get(&parent_id).cloned().unwrap_or_default()
    }

    /// Successful calls to `replace_child_rows`.
    pub fn replacements(&self) -> usize {
        self.lock().replacements
    }

    fn check_available(state: &mut MemoryStoreState) -> Result<(), StoreError> {
        if state.unavailable > 0 {
            state.unavailable -= 1;
            return Err(StoreError::Unavailable("connection refused".to_owned()));
        }
        Ok(())
    }
}

#[async_trait]
impl TorrentStore for MemoryTorrentStore {
    async fn get_record(&self, id: Uuid) -> Result<Option<TorrentRecord>, StoreError> {
        let mut state = self.lock();
        MemoryTorrentStore::check_available(&mut state)?;
        Ok(state.records.get(&id).cloned())
    }

    async fn replace_child_rows(
        &self,
        parent_id: Uuid,
        rows: Vec<FileRow>,
    ) -> Result<(), StoreError> {
        let mut state = self.lock();
        MemoryTorrentStore::check_available(&mut state)?;
        if !state.records.contains_key(&parent_id) {
            return Err(StoreError::Rejected(format!("no torrent {}", parent_id)));
        }
        state.rows.insert(parent_id, rows);
        state.replacements += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn single_file() -> Metainfo {
        Metainfo {
            info: InfoDictionary {
                name: Some("a.txt".to_owned()),
                length: Some(100),
                files: None,
            },
        }
    }

    #[test]
    fn single_file_torrent_has_one_row() {
        assert_eq!(
            file_rows(&single_file()).unwrap(),
            vec![FileRow {
                path: "a.txt".to_owned(),
                length: 100
            }]
        );
    }

    #[test]
    fn multi_file_rows_join_path_components() {
        let metainfo = JsonMetainfoDecoder
            .decode(
                br#"{"info": {"name": "album", "files": [
                    {"path": ["cd1", "01.flac"], "length": 10},
                    {"path": ["b"], "length": 20}
                ]}}"#,
            )
            .unwrap();

        let rows = file_rows(&metainfo).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].path, "cd1/01.flac");
        assert_eq!(total_size(&rows), 30);
    }

    #[test]
    fn multi_file_torrents_need_no_name() {
        let metainfo = JsonMetainfoDecoder
            .decode(br#"{"info": {"files": [{"path": ["a"], "length": 10}, {"path": ["b"], "length": 20}]}}"#)
            .unwrap();

        let rows = file_rows(&metainfo).unwrap();
        assert_eq!(
            rows,
            vec![
                FileRow {
                    path: "a".to_owned(),
                    length: 10
                },
                FileRow {
                    path: "b".to_owned(),
                    length: 20
                },
            ]
        );
        assert_eq!(total_size(&rows), 30);
    }

    #[test]
    fn single_file_without_length_or_name_is_malformed() {
        let mut metainfo = single_file();
        metainfo.info.length = None;
        assert_eq!(file_rows(&metainfo), Err(DecodeError::MissingField("length")));

        let mut metainfo = single_file();
        metainfo.info.name = None;
        assert_eq!(file_rows(&metainfo), Err(DecodeError::MissingField("name")));
    }

    #[tokio::test]
    async fn replaces_rows_of_the_record() {
        let id = Uuid::new_v4();
        let mut decoder = MockTorrentDecoder::new();
        decoder.expect_decode().returning(|_| Ok(single_file()));
        let mut store = MockTorrentStore::new();
        store
            .expect_get_record()
            .with(eq(id))
            .returning(|id| {
                Ok(Some(TorrentRecord {
                    id,
                    name: "a".to_owned(),
                }))
            });
        store
            .expect_replace_child_rows()
            .withf(move |parent, rows| *parent == id && rows.len() == 1)
            .times(1)
            .returning(|_, _| Ok(()));

        let handler = ProcessTorrent::new(Arc::new(decoder), Arc::new(store));
        handler.handle(b"d4:infoe", &TaskId::from(id)).await.unwrap();
    }

    #[tokio::test]
    async fn failures_are_classified() {
        let store = MemoryTorrentStore::new();
        let handler = ProcessTorrent::new(Arc::new(JsonMetainfoDecoder), Arc::new(store.clone()));
        let payload = serde_json::to_vec(&single_file()).unwrap();

        let err = handler
            .handle(b"not json", &TaskId::random())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::MalformedPayload(_)));

        let err = handler.handle(&payload, &TaskId::new("42")).await.unwrap_err();
        assert!(matches!(err, TaskError::MalformedPayload(_)));

        let err = handler.handle(&payload, &TaskId::random()).await.unwrap_err();
        assert!(matches!(err, TaskError::TargetNotFound(_)));
        assert!(err.is_permanent());

        store.fail_next_calls(1);
        let err = handler.handle(&payload, &TaskId::random()).await.unwrap_err();
        assert!(!err.is_permanent());
    }
}
