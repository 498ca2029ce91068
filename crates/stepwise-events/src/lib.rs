//! Event log / session store.
//!
//! One append-only JSONL file per session at `<root>/<session_id>/events.jsonl`.
//! `seq` is always derived from the last valid line on disk; a torn final
//! line is ignored by readers and truncated away by the next append.

mod scan;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use stepwise_protocol::{AgentEvent, EventKind, EventRecord, SeqNo, SessionId};
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, instrument, warn};

pub use scan::{LogScan, scan_log};

const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("corrupt event log for session {session_id} at line {line_index}: {reason}")]
    CorruptLine {
        session_id: String,
        line_index: usize,
        reason: String,
    },
    #[error("session {0} not found")]
    SessionNotFound(String),
    #[error("session {0} already exists")]
    SessionExists(String),
    #[error("event log io failed for {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed serializing event: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Allocate a fresh, empty log.
    async fn create_session(&self) -> StoreResult<SessionId>;

    /// Create an empty log under a caller-chosen id.
    async fn create_session_with_id(&self, session_id: &SessionId) -> StoreResult<()>;

    async fn session_exists(&self, session_id: &SessionId) -> StoreResult<bool>;

    /// Assign the next `seq`, durably write one line, and return the stored record.
    async fn append(&self, session_id: &SessionId, kind: EventKind) -> StoreResult<EventRecord>;

    async fn read_events(&self, session_id: &SessionId) -> StoreResult<Vec<EventRecord>>;

    /// `0` for an empty log.
    async fn latest_sequence(&self, session_id: &SessionId) -> StoreResult<SeqNo>;
}

#[derive(Debug, Clone, Copy)]
struct TailCache {
    file_len: u64,
    last_seq: SeqNo,
}

#[derive(Debug)]
pub struct FileEventStore {
    root: PathBuf,
    write_locks: Mutex<HashMap<SessionId, Arc<tokio::sync::Mutex<()>>>>,
    // Only trusted while the file length still matches what this instance last saw.
    tail_cache: Mutex<HashMap<SessionId, TailCache>>,
}

impl FileEventStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_locks: Mutex::new(HashMap::new()),
            tail_cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session_id: &SessionId) -> PathBuf {
        self.root.join(session_id.as_str())
    }

    pub fn file_path(&self, session_id: &SessionId) -> PathBuf {
        self.session_dir(session_id).join(EVENTS_FILE)
    }

    fn lock_for(&self, session_id: &SessionId) -> Arc<tokio::sync::Mutex<()>> {
        let mut guard = self.write_locks.lock();
        guard
            .entry(session_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    async fn read_bytes(&self, session_id: &SessionId) -> StoreResult<Vec<u8>> {
        let path = self.file_path(session_id);
        match fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::SessionNotFound(session_id.to_string()))
            }
            Err(err) => Err(StoreError::io(&path, err)),
        }
    }

    async fn scan(&self, session_id: &SessionId) -> StoreResult<LogScan> {
        let bytes = self.read_bytes(session_id).await?;
        scan_log(session_id.as_str(), &bytes)
    }

    async fn file_len(path: &Path) -> StoreResult<u64> {
        match fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) => Err(StoreError::io(path, err)),
        }
    }

    fn cached_tail(&self, session_id: &SessionId, file_len: u64) -> Option<SeqNo> {
        self.tail_cache
            .lock()
            .get(session_id)
            .filter(|cache| cache.file_len == file_len)
            .map(|cache| cache.last_seq)
    }

    fn update_tail(&self, session_id: &SessionId, file_len: u64, last_seq: SeqNo) {
        self.tail_cache
            .lock()
            .insert(session_id.clone(), TailCache { file_len, last_seq });
    }

    /// Resolve the last valid `seq`, truncating a torn tail first.
    async fn prepare_append(&self, session_id: &SessionId, path: &Path) -> StoreResult<SeqNo> {
        let len = Self::file_len(path).await?;
        if let Some(last_seq) = self.cached_tail(session_id, len) {
            return Ok(last_seq);
        }

        let scan = self.scan(session_id).await?;
        if scan.needs_repair() {
            warn!(
                valid_len = scan.valid_len,
                total_len = scan.total_len,
                "truncating torn tail of event log"
            );
            let file = OpenOptions::new()
                .write(true)
                .open(path)
                .await
                .map_err(|err| StoreError::io(path, err))?;
            file.set_len(scan.valid_len)
                .await
                .map_err(|err| StoreError::io(path, err))?;
            file.sync_data()
                .await
                .map_err(|err| StoreError::io(path, err))?;
        }
        self.update_tail(session_id, scan.valid_len, scan.last_seq);
        Ok(scan.last_seq)
    }
}

#[async_trait]
impl EventStore for FileEventStore {
    async fn create_session(&self) -> StoreResult<SessionId> {
        let session_id = SessionId::new_uuid();
        self.create_session_with_id(&session_id).await?;
        Ok(session_id)
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn create_session_with_id(&self, session_id: &SessionId) -> StoreResult<()> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|err| StoreError::io(&dir, err))?;
        let path = self.file_path(session_id);
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => {
                debug!("session log created");
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(StoreError::SessionExists(session_id.to_string()))
            }
            Err(err) => Err(StoreError::io(&path, err)),
        }
    }

    async fn session_exists(&self, session_id: &SessionId) -> StoreResult<bool> {
        let path = self.file_path(session_id);
        fs::try_exists(&path)
            .await
            .map_err(|err| StoreError::io(&path, err))
    }

    #[instrument(skip_all, fields(session_id = %session_id, event_type = kind.type_name()))]
    async fn append(&self, session_id: &SessionId, kind: EventKind) -> StoreResult<EventRecord> {
        let path = self.file_path(session_id);
        if !self.session_exists(session_id).await? {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }

        let lock = self.lock_for(session_id);
        let _guard = lock.lock().await;

        let last_seq = self.prepare_append(session_id, &path).await?;
        let record = EventRecord::new(last_seq + 1, kind);
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');

        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|err| StoreError::io(&path, err))?;
        file.write_all(&line)
            .await
            .map_err(|err| StoreError::io(&path, err))?;
        file.sync_data()
            .await
            .map_err(|err| StoreError::io(&path, err))?;

        let len = Self::file_len(&path).await?;
        self.update_tail(session_id, len, record.seq);
        debug!(seq = record.seq, "event appended to store");
        Ok(record)
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn read_events(&self, session_id: &SessionId) -> StoreResult<Vec<EventRecord>> {
        let scan = self.scan(session_id).await?;
        if scan.needs_repair() {
            debug!(
                ignored_bytes = scan.total_len - scan.valid_len,
                "ignoring torn tail"
            );
        }
        debug!(count = scan.events.len(), "events loaded from store");
        Ok(scan.events)
    }

    #[instrument(skip_all, fields(session_id = %session_id))]
    async fn latest_sequence(&self, session_id: &SessionId) -> StoreResult<SeqNo> {
        let path = self.file_path(session_id);
        if !self.session_exists(session_id).await? {
            return Err(StoreError::SessionNotFound(session_id.to_string()));
        }
        let len = Self::file_len(&path).await?;
        if let Some(latest) = self.cached_tail(session_id, len) {
            return Ok(latest);
        }
        let scan = self.scan(session_id).await?;
        if !scan.needs_repair() {
            self.update_tail(session_id, scan.total_len, scan.last_seq);
        }
        debug!(latest = scan.last_seq, "latest sequence resolved");
        Ok(scan.last_seq)
    }
}

/// A live notification tagged with its session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub session_id: SessionId,
    pub event: AgentEvent,
}

#[derive(Clone, Debug)]
pub struct EventStreamHub {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventStreamHub {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn publish(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<SessionEvent> {
        BroadcastStream::new(self.sender.subscribe())
    }
}

impl Default for EventStreamHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// A store plus a live hub: persisted events are published after the write,
/// deltas are published only.
#[derive(Clone)]
pub struct EventJournal {
    store: Arc<dyn EventStore>,
    stream: EventStreamHub,
}

impl EventJournal {
    pub fn new(store: Arc<dyn EventStore>, stream: EventStreamHub) -> Self {
        Self { store, stream }
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    #[instrument(skip_all, fields(session_id = %session_id, event_type = kind.type_name()))]
    pub async fn append_and_publish(
        &self,
        session_id: &SessionId,
        kind: EventKind,
    ) -> StoreResult<EventRecord> {
        let record = self.store.append(session_id, kind).await?;
        self.stream.publish(SessionEvent {
            session_id: session_id.clone(),
            event: AgentEvent::Persisted(record.clone()),
        });
        debug!(seq = record.seq, "event published to stream");
        Ok(record)
    }

    pub fn publish_delta(&self, session_id: &SessionId, text: impl Into<String>) {
        self.stream.publish(SessionEvent {
            session_id: session_id.clone(),
            event: AgentEvent::AssistantDelta { text: text.into() },
        });
    }

    pub async fn create_session(&self) -> StoreResult<SessionId> {
        self.store.create_session().await
    }

    pub async fn create_session_with_id(&self, session_id: &SessionId) -> StoreResult<()> {
        self.store.create_session_with_id(session_id).await
    }

    pub async fn session_exists(&self, session_id: &SessionId) -> StoreResult<bool> {
        self.store.session_exists(session_id).await
    }

    pub async fn read_events(&self, session_id: &SessionId) -> StoreResult<Vec<EventRecord>> {
        self.store.read_events(session_id).await
    }

    pub async fn latest_sequence(&self, session_id: &SessionId) -> StoreResult<SeqNo> {
        self.store.latest_sequence(session_id).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.stream.subscribe()
    }

    pub fn subscribe_stream(&self) -> BroadcastStream<SessionEvent> {
        self.stream.subscribe_stream()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{SystemTime, UNIX_EPOCH};

    use anyhow::Result;
    use stepwise_protocol::{AgentEvent, EventKind, SessionId};
    use tokio::fs;
    use tokio::io::AsyncWriteExt;

    use crate::{EventJournal, EventStore, EventStreamHub, FileEventStore, StoreError};

    fn unique_test_root(name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        std::env::temp_dir().join(format!("{name}-{nanos}"))
    }

    fn user(text: &str) -> EventKind {
        EventKind::UserMessage {
            text: text.to_owned(),
            synthetic: false,
        }
    }

    async fn append_raw(store: &FileEventStore, session_id: &SessionId, raw: &str) -> Result<()> {
        let mut file = fs::OpenOptions::new()
            .append(true)
            .open(store.file_path(session_id))
            .await?;
        file.write_all(raw.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    #[tokio::test]
    async fn file_event_store_appends_and_reads_in_sequence() -> Result<()> {
        let root = unique_test_root("stepwise-events");
        let store = FileEventStore::new(&root);
        let session_id = store.create_session().await?;

        let first = store.append(&session_id, user("one")).await?;
        let second = store.append(&session_id, user("two")).await?;
        assert_eq!(first.seq, 1);
        assert_eq!(second.seq, 2);

        let events = store.read_events(&session_id).await?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1], second);
        assert_eq!(store.latest_sequence(&session_id).await?, 2);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn sequence_survives_store_reinstantiation() -> Result<()> {
        let root = unique_test_root("stepwise-events-reopen");
        let session_id = {
            let store = FileEventStore::new(&root);
            let session_id = store.create_session().await?;
            store.append(&session_id, user("one")).await?;
            store.append(&session_id, user("two")).await?;
            session_id
        };

        let reopened = FileEventStore::new(&root);
        let third = reopened.append(&session_id, user("three")).await?;
        assert_eq!(third.seq, 3);

        let seqs: Vec<u64> = reopened
            .read_events(&session_id)
            .await?
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn two_instances_converge_on_next_seq() -> Result<()> {
        let root = unique_test_root("stepwise-events-converge");
        let a = FileEventStore::new(&root);
        let b = FileEventStore::new(&root);
        let session_id = a.create_session().await?;

        a.append(&session_id, user("from a")).await?;
        let from_b = b.append(&session_id, user("from b")).await?;
        let from_a = a.append(&session_id, user("from a again")).await?;
        assert_eq!(from_b.seq, 2);
        assert_eq!(from_a.seq, 3);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn truncated_final_line_is_ignored_then_repaired() -> Result<()> {
        let root = unique_test_root("stepwise-events-torn");
        let store = FileEventStore::new(&root);
        let session_id = store.create_session().await?;
        store.append(&session_id, user("kept")).await?;
        append_raw(&store, &session_id, r#"{"type":"user_message","seq":2,"ts":1.0,"te"#).await?;

        let events = store.read_events(&session_id).await?;
        assert_eq!(events.len(), 1);

        // A fresh instance has no cached tail and must repair from disk.
        let fresh = FileEventStore::new(&root);
        let repaired = fresh.append(&session_id, user("after crash")).await?;
        assert_eq!(repaired.seq, 2);

        let content = fs::read_to_string(store.file_path(&session_id)).await?;
        assert!(content.ends_with('\n'));
        assert_eq!(content.lines().count(), 2);
        assert!(!content.contains(r#""ts":1.0,"#));
        assert_eq!(fresh.read_events(&session_id).await?.len(), 2);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn torn_tail_written_behind_the_cache_is_repaired() -> Result<()> {
        let root = unique_test_root("stepwise-events-torn-cached");
        let store = FileEventStore::new(&root);
        let session_id = store.create_session().await?;
        store.append(&session_id, user("kept")).await?;
        append_raw(&store, &session_id, "{\"type\":").await?;

        let next = store.append(&session_id, user("next")).await?;
        assert_eq!(next.seq, 2);
        let events = store.read_events(&session_id).await?;
        assert_eq!(events.len(), 2);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn malformed_middle_line_fails_with_session_and_index() -> Result<()> {
        let root = unique_test_root("stepwise-events-corrupt");
        let store = FileEventStore::new(&root);
        let session_id = SessionId::from_string("corrupt-session");
        store.create_session_with_id(&session_id).await?;
        store.append(&session_id, user("one")).await?;
        append_raw(&store, &session_id, "this is not json\n").await?;
        append_raw(
            &store,
            &session_id,
            "{\"type\":\"user_message\",\"seq\":3,\"ts\":1.0,\"text\":\"three\"}\n",
        )
        .await?;

        let err = store.read_events(&session_id).await.unwrap_err();
        assert!(matches!(err, StoreError::CorruptLine { line_index: 1, .. }));
        let message = err.to_string();
        assert!(message.contains("corrupt-session"));
        assert!(message.contains("line 1"));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn unknown_event_types_roundtrip_through_the_store() -> Result<()> {
        let root = unique_test_root("stepwise-events-unknown");
        let store = FileEventStore::new(&root);
        let session_id = store.create_session().await?;
        append_raw(
            &store,
            &session_id,
            "{\"type\":\"future_thing\",\"seq\":1,\"ts\":1.5,\"payload\":{\"x\":1}}\n",
        )
        .await?;

        let events = store.read_events(&session_id).await?;
        assert_eq!(events[0].type_name(), "future_thing");
        let next = store.append(&session_id, user("after")).await?;
        assert_eq!(next.seq, 2);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn missing_session_is_reported() -> Result<()> {
        let root = unique_test_root("stepwise-events-missing");
        let store = FileEventStore::new(&root);
        let ghost = SessionId::from_string("ghost");

        assert!(!store.session_exists(&ghost).await?);
        let err = store.append(&ghost, user("x")).await.unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(_)));
        let err = store.read_events(&ghost).await.unwrap_err();
        assert!(matches!(err, StoreError::SessionNotFound(_)));

        store.create_session_with_id(&ghost).await?;
        let err = store.create_session_with_id(&ghost).await.unwrap_err();
        assert!(matches!(err, StoreError::SessionExists(_)));

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_sessions_get_independent_sequences() -> Result<()> {
        let root = unique_test_root("stepwise-events-concurrent");
        let store = Arc::new(FileEventStore::new(&root));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let session_id = store.create_session().await?;
                for i in 0..10 {
                    store.append(&session_id, user(&format!("m{i}"))).await?;
                }
                Ok::<_, StoreError>(session_id)
            }));
        }

        for handle in handles {
            let session_id = handle.await??;
            let seqs: Vec<u64> = store
                .read_events(&session_id)
                .await?
                .iter()
                .map(|e| e.seq)
                .collect();
            assert_eq!(seqs, (1..=10).collect::<Vec<u64>>());
        }

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }

    #[tokio::test]
    async fn journal_publishes_persisted_events_and_deltas() -> Result<()> {
        let root = unique_test_root("stepwise-events-journal");
        let journal = EventJournal::new(
            Arc::new(FileEventStore::new(&root)),
            EventStreamHub::new(16),
        );
        let mut rx = journal.subscribe();
        let session_id = journal.create_session().await?;

        journal.publish_delta(&session_id, "par");
        let record = journal.append_and_publish(&session_id, user("hi")).await?;

        let first = rx.recv().await?;
        assert_eq!(
            first.event,
            AgentEvent::AssistantDelta {
                text: "par".into()
            }
        );
        let second = rx.recv().await?;
        assert_eq!(second.session_id, session_id);
        assert_eq!(second.event, AgentEvent::Persisted(record));

        // Deltas never reach disk.
        let stored = journal.read_events(&session_id).await?;
        assert_eq!(stored.len(), 1);

        let _ = fs::remove_dir_all(root).await;
        Ok(())
    }
}
