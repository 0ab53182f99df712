use std::{
    collections::HashMap,
    fs::{File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use fs2::FileExt;
use tracing::{debug, info};

use super::{PositionKey, PositionStore, StoreError};

/// One record file per key under `root`, holding the raw offset token.
///
/// Every key owns a lock file that is opened once and shared by all savers.
/// A save takes the in-process mutex, then an exclusive `flock` on the lock
/// file, and replaces the record by writing a temporary file and renaming it
/// over the old one, so readers only ever see a complete value.
pub struct FileStore {
    root: PathBuf,
    handles: Mutex<HashMap<PositionKey, Arc<KeyHandle>>>,
}

struct KeyHandle {
    record: PathBuf,
    scratch: PathBuf,
    lock_file: Arc<File>,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        FileStore {
            root: root.into(),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `key@scope1@scope2`, with `%`, `@`, path separators and a leading
    /// `.` percent-escaped in every part so distinct keys never share a
    /// record and no record name clashes with the hidden lock and scratch
    /// files.
    fn file_name(key: &PositionKey) -> String {
        let mut name = Self::escape(key.key());
        for scope in key.scopes() {
            name.push('@');
            name.push_str(&Self::escape(scope));
        }
        name
    }

    fn escape(part: &str) -> String {
        if part.is_empty() {
            return "%".to_string();
        }
        let mut escaped = String::with_capacity(part.len());
        for (i, c) in part.chars().enumerate() {
            match c {
                '%' => escaped.push_str("%25"),
                '@' => escaped.push_str("%40"),
                '/' => escaped.push_str("%2F"),
                '\\' => escaped.push_str("%5C"),
                '\0' => escaped.push_str("%00"),
                '.' if i == 0 => escaped.push_str("%2E"),
                c => escaped.push(c),
            }
        }
        escaped
    }

    fn record_path(&self, key: &PositionKey) -> PathBuf {
        self.root.join(Self::file_name(key))
    }

    async fn handle(&self, key: &PositionKey) -> Result<Arc<KeyHandle>, StoreError> {
        if let Some(handle) = self.handles.lock().unwrap().get(key) {
            return Ok(handle.clone());
        }

        let root = self.root.clone();
        let name = Self::file_name(key);
        let lock_path = root.join(format!(".{name}.lock"));
        let opened = tokio::task::spawn_blocking(move || -> std::io::Result<File> {
            std::fs::create_dir_all(&root)?;
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&lock_path)
        })
        .await
        .map_err(std::io::Error::other)
        .and_then(|r| r)
        .map_err(|source| StoreError::StorageUnavailable {
            key: key.clone(),
            source,
        })?;

        let handle = Arc::new(KeyHandle {
            record: self.record_path(key),
            scratch: self.root.join(format!(".{name}.tmp")),
            lock_file: Arc::new(opened),
            write_lock: tokio::sync::Mutex::new(()),
        });

        info!(%key, path = ?handle.record, "opened position record");

        // another task may have raced us here, keep whichever landed first
        let mut handles = self.handles.lock().unwrap();
        Ok(handles.entry(key.clone()).or_insert(handle).clone())
    }

    fn replace_record(handle: &KeyHandle, value: &[u8]) -> std::io::Result<()> {
        let mut scratch = File::create(&handle.scratch)?;
        scratch.write_all(value)?;
        scratch.sync_all()?;
        std::fs::rename(&handle.scratch, &handle.record)
    }

    fn remove_record(handle: &KeyHandle) -> std::io::Result<()> {
        match std::fs::remove_file(&handle.record) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }

    async fn with_exclusive_lock<F>(
        &self,
        key: &PositionKey,
        op: F,
    ) -> Result<(), StoreError>
    where
        F: FnOnce(&KeyHandle) -> std::io::Result<()> + Send + 'static,
    {
        let handle = self.handle(key).await?;
        let _guard = handle.write_lock.lock().await;

        let blocking = handle.clone();
        let result = tokio::task::spawn_blocking(move || {
            FileExt::lock_exclusive(blocking.lock_file.as_ref()).map_err(LockedOp::Lock)?;
            let res = op(&blocking).map_err(LockedOp::Write);
            FileExt::unlock(blocking.lock_file.as_ref()).map_err(LockedOp::Lock)?;
            res
        })
        .await
        .map_err(|e| LockedOp::Write(std::io::Error::other(e)))
        .and_then(|r| r);

        match result {
            Ok(()) => Ok(()),
            Err(LockedOp::Lock(source)) => Err(StoreError::StorageUnavailable {
                key: key.clone(),
                source,
            }),
            Err(LockedOp::Write(source)) => Err(StoreError::Io {
                key: key.clone(),
                source,
            }),
        }
    }
}

enum LockedOp {
    Lock(std::io::Error),
    Write(std::io::Error),
}

#[async_trait]
impl PositionStore for FileStore {
    async fn get(&self, key: &PositionKey) -> Result<Option<Bytes>, StoreError> {
        match tokio::fs::read(self.record_path(key)).await {
            Ok(content) if content.iter().all(u8::is_ascii_whitespace) => Ok(None),
            Ok(content) => Ok(Some(Bytes::from(content))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::StorageUnavailable {
                key: key.clone(),
                source,
            }),
        }
    }

    async fn save(&self, key: &PositionKey, value: Bytes) -> Result<(), StoreError> {
        let len = value.len();
        self.with_exclusive_lock(key, move |handle| {
            FileStore::replace_record(handle, &value)
        })
        .await?;
        debug!(%key, bytes = len, "saved position");
        Ok(())
    }

    async fn reset(&self, key: &PositionKey) -> Result<(), StoreError> {
        self.with_exclusive_lock(key, FileStore::remove_record).await?;
        info!(%key, "position reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tempfile::tempdir;

    use super::*;

    #[tokio::test]
    async fn missing_record_is_none() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let key = PositionKey::new("binlog.pos");

        assert_eq!(store.get(&key).await.unwrap(), None);

        std::fs::write(dir.path().join("binlog.pos"), "").unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn save_replaces_previous_value() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let key = PositionKey::new("binlog.pos");

        store.save(&key, Bytes::from_static(b"g:10")).await.unwrap();
        store.save(&key, Bytes::from_static(b"g:9")).await.unwrap();
        store.save(&key, Bytes::from_static(b"g:11")).await.unwrap();

        assert_eq!(
            store.get(&key).await.unwrap(),
            Some(Bytes::from_static(b"g:11"))
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("binlog.pos")).unwrap(),
            "g:11"
        );

        // a fresh instance reads what the first one persisted
        let reopened = FileStore::new(dir.path());
        assert_eq!(
            reopened.get(&key).await.unwrap(),
            Some(Bytes::from_static(b"g:11"))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_savers_leave_one_legal_value() {
        let dir = tempdir().unwrap();
        let store = Arc::new(FileStore::new(dir.path()));
        let key = PositionKey::new("binlog.pos");

        let legal: HashSet<String> = (0..32).map(|i| format!("g:{}", 1000 + i)).collect();
        let mut tasks = Vec::new();
        for value in legal.iter().cloned() {
            let store = store.clone();
            let key = key.clone();
            tasks.push(tokio::spawn(async move {
                store.save(&key, Bytes::from(value)).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stored = store.get(&key).await.unwrap().unwrap();
        let stored = String::from_utf8(stored.to_vec()).unwrap();
        assert!(legal.contains(&stored), "unexpected value {stored}");
    }

    #[tokio::test]
    async fn scoped_keys_use_separate_records() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let plain = PositionKey::new("binlog.pos");
        let scoped = PositionKey::new("binlog.pos").with_scopes(["shop"]);

        store.save(&plain, Bytes::from_static(b"g:1")).await.unwrap();
        store.save(&scoped, Bytes::from_static(b"g:2")).await.unwrap();

        assert_eq!(store.get(&plain).await.unwrap(), Some(Bytes::from_static(b"g:1")));
        assert_eq!(store.get(&scoped).await.unwrap(), Some(Bytes::from_static(b"g:2")));
        assert!(dir.path().join("binlog.pos").exists());
        assert!(dir.path().join("binlog.pos@shop").exists());
    }

    #[tokio::test]
    async fn dotted_key_and_scoped_key_stay_apart() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let dotted = PositionKey::new("binlog.pos.shop");
        let scoped = PositionKey::new("binlog.pos").with_scopes(["shop"]);
        let tricky = PositionKey::new("binlog.pos@shop");

        store.save(&dotted, Bytes::from_static(b"g:1")).await.unwrap();
        store.save(&scoped, Bytes::from_static(b"g:2")).await.unwrap();
        store.save(&tricky, Bytes::from_static(b"g:3")).await.unwrap();

        assert_eq!(store.get(&dotted).await.unwrap(), Some(Bytes::from_static(b"g:1")));
        assert_eq!(store.get(&scoped).await.unwrap(), Some(Bytes::from_static(b"g:2")));
        assert_eq!(store.get(&tricky).await.unwrap(), Some(Bytes::from_static(b"g:3")));
    }

    #[test]
    fn record_names_are_escaped() {
        assert_eq!(FileStore::file_name(&PositionKey::new("binlog.pos")), "binlog.pos");
        assert_eq!(FileStore::file_name(&PositionKey::new("../pos")), "%2E.%2Fpos");
        assert_eq!(FileStore::file_name(&PositionKey::new("")), "%");
        assert_eq!(
            FileStore::file_name(&PositionKey::new("pos").with_scopes(["billing", "a@b"])),
            "pos@a%40b@billing"
        );
    }

    #[tokio::test]
    async fn reset_removes_record() {
        let dir = tempdir().unwrap();
        let store = FileStore::new(dir.path());
        let key = PositionKey::new("binlog.pos");

        store.reset(&key).await.unwrap();
        store.save(&key, Bytes::from_static(b"g:3")).await.unwrap();
        store.reset(&key).await.unwrap();
        assert_eq!(store.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn unusable_root_is_storage_unavailable() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "x").unwrap();

        let store = FileStore::new(blocker.join("positions"));
        let err = store
            .save(&PositionKey::new("binlog.pos"), Bytes::from_static(b"g:1"))
            .await
            .unwrap_err();
        assert!(err.is_fatal(), "unexpected error {err:?}");
    }

    #[test]
    fn file_names_stay_inside_root() {
        assert_eq!(FileStore::file_name(&PositionKey::new("a/b")), "a_b");
        assert_eq!(FileStore::file_name(&PositionKey::new("..")), "_..");
    }
}
