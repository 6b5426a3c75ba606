//! CRUD and type-scoped range scan over the keyed store.
//!
//! Backed by `sled`: an embedded, ordered, byte-key/byte-value store with
//! multi-reader MVCC snapshots, standing in for the out-of-scope "embedded
//! B+tree key-value file" the design assumes. Two trees live in one `Db`:
//! `obj` for records, `schema` for the persisted descriptor set.
//!
//! Writes are additionally serialized through `write_lock`, giving the
//! single-writer discipline the design calls for without reaching for
//! `sled`'s multi-key transactions (this process is the only writer, so a
//! plain async mutex around each write call is sufficient and keeps the
//! read/decode/mutate/encode/write sequence easy to reason about).

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{ObjectStoreError, Result};
use crate::key::{TypeId, TypeTag};
use crate::metadata::timestamp_cmp;
use crate::record::TypedObject;
use crate::registry::SchemaRegistry;
use crate::watch::{EventKind, WatchBus, WatchEvent};

/// The reserved key under which the persisted `FileDescriptorSet` lives.
pub const SCHEMA_DESCRIPTOR_SET_KEY: &[u8] = b"fds";

pub struct StorageEngine {
    db: sled::Db,
    obj: sled::Tree,
    schema: sled::Tree,
    registry: Arc<SchemaRegistry>,
    watch: WatchBus,
    write_lock: Mutex<()>,
}

impl StorageEngine {
    pub fn open(path: &std::path::Path, registry: Arc<SchemaRegistry>, watch: WatchBus) -> Result<Self> {
        let db = sled::open(path)?;
        let obj = db.open_tree(b"obj")?;
        let schema = db.open_tree(b"schema")?;
        Ok(StorageEngine {
            db,
            obj,
            schema,
            registry,
            watch,
            write_lock: Mutex::new(()),
        })
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Load a persisted descriptor set (if any) and fold it into the
    /// registry. A missing or unreadable persisted set falls back to the
    /// statically-linked set — not fatal, matching the design's startup
    /// contract.
    pub async fn load_persisted_schema(&self) -> Result<()> {
        let schema = self.schema.clone();
        let bytes = tokio::task::spawn_blocking(move || schema.get(SCHEMA_DESCRIPTOR_SET_KEY))
            .await
            .map_err(|e| ObjectStoreError::Internal(e.to_string()))??;
        let Some(bytes) = bytes else {
            tracing::info!("no persisted schema found, using statically-linked types only");
            return Ok(());
        };
        match prost::Message::decode(bytes.as_ref() as &[u8]) {
            Ok(fds) => {
                let added = self.registry.load_descriptor_set(fds)?;
                tracing::info!(added, "loaded persisted schema, augmenting static types");
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode persisted schema, falling back to static types");
            }
        }
        Ok(())
    }

    /// Persist the registry's current (static + dynamic) descriptor set.
    pub async fn store_schema(&self) -> Result<()> {
        let fds = self.registry.file_descriptor_set();
        let mut bytes = Vec::new();
        prost::Message::encode(&fds, &mut bytes)?;
        let schema = self.schema.clone();
        tokio::task::spawn_blocking(move || schema.insert(SCHEMA_DESCRIPTOR_SET_KEY, bytes))
            .await
            .map_err(|e| ObjectStoreError::Internal(e.to_string()))??;
        Ok(())
    }

    /// `put(records…)`: refresh `updated_at`, marshal, insert/overwrite by
    /// key. Emits one `Created` per input record, even on overwrite (the
    /// source's behavior, preserved deliberately — see design notes).
    pub async fn put(&self, mut records: Vec<Box<dyn TypedObject>>) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut writes = Vec::with_capacity(records.len());
        for record in &mut records {
            let mut meta = record.metadata();
            meta.touch_updated_at();
            record.set_metadata(meta);
            let tag = record.type_tag()?;
            let meta = record.metadata();
            let mut uuid = [0u8; 16];
            let len = meta.uuid.len().min(16);
            uuid[..len].copy_from_slice(&meta.uuid[..len]);
            let key = TypeId::new(tag, uuid);
            let value = record.encode()?;
            writes.push((key, value));
        }

        let obj = self.obj.clone();
        let writes_for_db = writes.clone();
        tokio::task::spawn_blocking(move || -> std::result::Result<(), sled::Error> {
            for (key, value) in &writes_for_db {
                obj.insert(key.as_bytes(), value.as_slice())?;
            }
            obj.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| ObjectStoreError::Internal(e.to_string()))??;

        for (record, (key, _)) in records.into_iter().zip(writes.into_iter()) {
            self.watch
                .publish(WatchEvent {
                    kind: EventKind::Created,
                    type_id: key,
                    object: record,
                    previous: None,
                })
                .await;
        }
        Ok(())
    }

    /// `get(tid)`: snapshot read; `NotFound` if absent.
    pub async fn get(&self, tid: TypeId) -> Result<Box<dyn TypedObject>> {
        let obj = self.obj.clone();
        let key = *tid.as_bytes();
        let value = tokio::task::spawn_blocking(move || obj.get(key))
            .await
            .map_err(|e| ObjectStoreError::Internal(e.to_string()))??;
        let value = value.ok_or_else(|| ObjectStoreError::NotFound(tid.to_string_key()))?;
        self.registry.unmarshal(tid.as_bytes(), &value)
    }

    /// `update(tid, mutator)`: read, decode, pass a defensive clone to the
    /// mutator, refresh `updated_at` on success, re-encode, write back.
    /// Nothing is written if the mutator fails. Emits `Updated` with
    /// before/after.
    pub async fn update<F>(&self, tid: TypeId, mutator: F) -> Result<Box<dyn TypedObject>>
    where
        F: FnOnce(Box<dyn TypedObject>) -> Result<Box<dyn TypedObject>>,
    {
        let _guard = self.write_lock.lock().await;

        let obj = self.obj.clone();
        let key = *tid.as_bytes();
        let old_bytes = tokio::task::spawn_blocking(move || obj.get(key))
            .await
            .map_err(|e| ObjectStoreError::Internal(e.to_string()))??
            .ok_or_else(|| ObjectStoreError::NotFound(tid.to_string_key()))?;

        let before = self.registry.unmarshal(tid.as_bytes(), &old_bytes)?;
        let before_for_event = before.clone_box();

        let mut after = mutator(before.clone_box())?;
        let mut meta = after.metadata();
        let before_meta = before.metadata();
        meta.created_at = before_meta.created_at;
        meta.touch_updated_at();
        after.set_metadata(meta);

        let new_bytes = after.encode()?;
        let obj = self.obj.clone();
        let key = *tid.as_bytes();
        let new_bytes_for_db = new_bytes.clone();
        tokio::task::spawn_blocking(move || -> std::result::Result<(), sled::Error> {
            obj.insert(key, new_bytes_for_db)?;
            obj.flush()?;
            Ok(())
        })
        .await
        .map_err(|e| ObjectStoreError::Internal(e.to_string()))??;

        let after_for_event = after.clone_box();
        self.watch
            .publish(WatchEvent {
                kind: EventKind::Updated,
                type_id: tid,
                object: after_for_event,
                previous: Some(before_for_event),
            })
            .await;

        Ok(after)
    }

    /// `delete(tid)`: read old value (for the event), then delete.
    /// Emits `Deleted` iff the write succeeded.
    pub async fn delete(&self, tid: TypeId) -> Result<Box<dyn TypedObject>> {
        let _guard = self.write_lock.lock().await;

        let obj = self.obj.clone();
        let key = *tid.as_bytes();
        let old_bytes = tokio::task::spawn_blocking(move || obj.remove(key))
            .await
            .map_err(|e| ObjectStoreError::Internal(e.to_string()))??
            .ok_or_else(|| ObjectStoreError::NotFound(tid.to_string_key()))?;

        let old = self.registry.unmarshal(tid.as_bytes(), &old_bytes)?;
        self.watch
            .publish(WatchEvent {
                kind: EventKind::Deleted,
                type_id: tid,
                object: old.clone_box(),
                previous: None,
            })
            .await;
        Ok(old)
    }

    /// `deleteAll(tag)`: scans the 4-byte prefix and removes every key.
    /// Emits one `Deleted` per removed record, on success — unlike the
    /// source, which only appended to the notification list on error (a
    /// bug this rewrite does not reproduce; see design notes).
    pub async fn delete_all(&self, tag: TypeTag) -> Result<usize> {
        let _guard = self.write_lock.lock().await;

        let obj = self.obj.clone();
        let prefix = tag.prefix();
        let removed: Vec<(Vec<u8>, Vec<u8>)> = tokio::task::spawn_blocking(move || {
            let mut removed = Vec::new();
            for kv in obj.scan_prefix(prefix) {
                let (k, v) = kv?;
                obj.remove(&k)?;
                removed.push((k.to_vec(), v.to_vec()));
            }
            obj.flush()?;
            Ok::<_, sled::Error>(removed)
        })
        .await
        .map_err(|e| ObjectStoreError::Internal(e.to_string()))??;

        let count = removed.len();
        for (k, v) in removed {
            let tid = TypeId::decode(&k)?;
            let old = self.registry.unmarshal(&k, &v)?;
            self.watch
                .publish(WatchEvent {
                    kind: EventKind::Deleted,
                    type_id: tid,
                    object: old,
                    previous: None,
                })
                .await;
        }
        Ok(count)
    }

    /// `getAllKV(tag)`: snapshot range scan of all `(key, value)` pairs
    /// whose key begins with `tag`, in the tree's byte order.
    pub async fn get_all_kv(&self, tag: TypeTag) -> Result<Vec<(TypeId, Vec<u8>)>> {
        let obj = self.obj.clone();
        let prefix = tag.prefix();
        let pairs = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for kv in obj.scan_prefix(prefix) {
                let (k, v) = kv?;
                out.push((k.to_vec(), v.to_vec()));
            }
            Ok::<_, sled::Error>(out)
        })
        .await
        .map_err(|e| ObjectStoreError::Internal(e.to_string()))??;

        pairs
            .into_iter()
            .map(|(k, v)| Ok((TypeId::decode(&k)?, v)))
            .collect()
    }

    /// A snapshot iterator over the whole `obj` namespace's keys, used by
    /// `SearchRef` (it never touches values).
    pub fn iter_all_keys(&self) -> impl Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>> {
        self.obj.iter()
    }

    /// A snapshot iterator scoped to one type tag's prefix, used by
    /// List/Query/Search session producers.
    pub fn iter_prefix(&self, tag: TypeTag) -> impl Iterator<Item = sled::Result<(sled::IVec, sled::IVec)>> {
        self.obj.scan_prefix(tag.prefix())
    }

    pub fn registry_arc(&self) -> Arc<SchemaRegistry> {
        self.registry.clone()
    }

    pub fn db(&self) -> &sled::Db {
        &self.db
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_fixtures::TestObject;
    use crate::registry::TypeSpec;
    use std::collections::HashMap;

    async fn fresh_engine() -> (tempfile::TempDir, StorageEngine) {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(SchemaRegistry::new());
        registry
            .register_static::<TestObject>(vec![], HashMap::new())
            .unwrap();
        let watch = WatchBus::spawn();
        let engine = StorageEngine::open(dir.path(), registry, watch).unwrap();
        (dir, engine)
    }

    #[tokio::test]
    async fn put_get_delete_round_trip() {
        let (_dir, engine) = fresh_engine().await;
        let obj = engine
            .registry()
            .create(&TypeSpec::FullName(TestObject::FULL_NAME.to_string()))
            .unwrap();
        let meta = obj.metadata();
        let tag = meta.type_tag().unwrap();
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&meta.uuid);
        let tid = TypeId::new(tag, uuid);

        engine.put(vec![obj.clone_box()]).await.unwrap();
        let fetched = engine.get(tid).await.unwrap();
        assert_eq!(fetched.metadata().uuid, meta.uuid);

        let deleted = engine.delete(tid).await.unwrap();
        assert_eq!(deleted.metadata().uuid, meta.uuid);
        assert!(matches!(engine.get(tid).await, Err(ObjectStoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn update_refreshes_timestamp_and_preserves_created_at() {
        let (_dir, engine) = fresh_engine().await;
        let obj = engine
            .registry()
            .create(&TypeSpec::FullName(TestObject::FULL_NAME.to_string()))
            .unwrap();
        let meta = obj.metadata();
        let tag = meta.type_tag().unwrap();
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&meta.uuid);
        let tid = TypeId::new(tag, uuid);
        let created_at = meta.created_at.clone().unwrap();

        engine.put(vec![obj]).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let updated = engine
            .update(tid, |r| Ok(r))
            .await
            .unwrap();
        let updated_meta = updated.metadata();
        assert_eq!(updated_meta.created_at.unwrap(), created_at);
        assert!(timestamp_cmp(updated_meta.updated_at.as_ref().unwrap(), &created_at) != std::cmp::Ordering::Less);
    }

    #[tokio::test]
    async fn delete_all_scans_prefix() {
        let (_dir, engine) = fresh_engine().await;
        let mut tag = TypeTag([0, 0, 0, 0]);
        for _ in 0..5 {
            let obj = engine
                .registry()
                .create(&TypeSpec::FullName(TestObject::FULL_NAME.to_string()))
                .unwrap();
            tag = obj.metadata().type_tag().unwrap();
            engine.put(vec![obj]).await.unwrap();
        }
        let removed = engine.delete_all(tag).await.unwrap();
        assert_eq!(removed, 5);
        assert!(engine.get_all_kv(tag).await.unwrap().is_empty());
    }
}
