//! End-to-end scenarios wiring the Schema Registry, Storage Engine, Watch
//! Bus and Query Engine together.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use odb::key::{TypeId, TypeTag};
use odb::metadata::Metadata;
use odb::query::QueryEngine;
use odb::record::{StaticObject, StaticRecord, TypedObject};
use odb::registry::{SchemaRegistry, TypeSpec};
use odb::storage::StorageEngine;
use odb::watch::{EventKind, WatchBus};

/// A small statically-linked record type standing in for whatever a real
/// caller links into the binary.
#[derive(Clone, PartialEq, Default, ::prost::Message)]
struct ScenarioObject {
    #[prost(message, tag = "1")]
    metadata: Option<Metadata>,
    #[prost(int64, tag = "2")]
    my_int: i64,
    #[prost(string, tag = "3")]
    note: String,
}

impl StaticRecord for ScenarioObject {
    const FULL_NAME: &'static str = "odb.v1.ScenarioObject";

    fn metadata(&self) -> &Metadata {
        self.metadata.as_ref().expect("metadata always populated before storage")
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        self.metadata.get_or_insert_with(Metadata::default)
    }
}

fn decode(object: &dyn TypedObject) -> ScenarioObject {
    let bytes = object.encode().unwrap();
    prost::Message::decode(bytes.as_slice()).unwrap()
}

fn make_object(registry: &SchemaRegistry, my_int: i64, note: &str) -> (TypeId, Box<dyn TypedObject>) {
    let fresh = registry
        .create(&TypeSpec::FullName(ScenarioObject::FULL_NAME.to_string()))
        .unwrap();
    let meta = fresh.metadata();
    let tag = meta.type_tag().unwrap();
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&meta.uuid);
    let tid = TypeId::new(tag, uuid);

    let record = ScenarioObject {
        metadata: Some(meta),
        my_int,
        note: note.to_string(),
    };
    (tid, Box::new(StaticObject::new(record)))
}

async fn fresh_store() -> (tempfile::TempDir, Arc<StorageEngine>, Arc<SchemaRegistry>) {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(SchemaRegistry::new());
    registry
        .register_static::<ScenarioObject>(vec![], HashMap::new())
        .unwrap();
    let watch = WatchBus::spawn();
    let storage = Arc::new(StorageEngine::open(dir.path(), registry.clone(), watch).unwrap());
    (dir, storage, registry)
}

#[tokio::test]
async fn s1_put_get_delete() {
    let (_dir, storage, registry) = fresh_store().await;
    let (tid, obj) = make_object(&registry, 0, "");
    let uuid_before = obj.metadata().uuid.clone();

    storage.put(vec![obj]).await.unwrap();
    let fetched = storage.get(tid).await.unwrap();
    assert_eq!(fetched.metadata().uuid, uuid_before);
    assert!(fetched.metadata().created_at.unwrap().seconds > 0);

    let deleted = storage.delete(tid).await.unwrap();
    assert_eq!(deleted.metadata().uuid, uuid_before);
    assert!(storage.get(tid).await.is_err());
}

#[tokio::test]
async fn s2_list_consistency() {
    let (_dir, storage, registry) = fresh_store().await;
    let mut tag = TypeTag([0, 0, 0, 0]);
    for i in 0..1000 {
        let (tid, obj) = make_object(&registry, i, "");
        tag = tid.tag();
        storage.put(vec![obj]).await.unwrap();
    }

    let qe = QueryEngine::new(storage.clone(), Duration::from_secs(60));

    let mut seen = 0;
    let mut token = String::new();
    loop {
        let (items, next) = qe.list(tag, 137, &token).await.unwrap();
        seen += items.len();
        if next.is_empty() {
            break;
        }
        token = next;
    }
    assert_eq!(seen, 1000);
}

#[tokio::test]
async fn s3_predicate_paging() {
    let (_dir, storage, registry) = fresh_store().await;
    let mut tag = TypeTag([0, 0, 0, 0]);
    for i in 0..100 {
        let (tid, obj) = make_object(&registry, i, "");
        tag = tid.tag();
        storage.put(vec![obj]).await.unwrap();
    }

    let qe = QueryEngine::new(storage.clone(), Duration::from_secs(60));
    let predicate: Arc<dyn Fn(&dyn TypedObject) -> odb::Result<bool> + Send + Sync> =
        Arc::new(|obj: &dyn TypedObject| Ok(decode(obj).my_int % 2 == 0));

    let mut seen = 0;
    let mut token = String::new();
    loop {
        let (items, next) = qe.query(tag, predicate.clone(), 10, &token).await.unwrap();
        seen += items.len();
        if next.is_empty() {
            break;
        }
        token = next;
    }
    assert_eq!(seen, 50);
}

#[tokio::test]
async fn s4_search_hits() {
    let (_dir, storage, registry) = fresh_store().await;
    let mut tag = TypeTag([0, 0, 0, 0]);
    for i in 0..50 {
        let (tid, obj) = make_object(&registry, i, "met with Staffan Olsson yesterday");
        tag = tid.tag();
        storage.put(vec![obj]).await.unwrap();
    }

    let qe = QueryEngine::new(storage.clone(), Duration::from_secs(60));
    let predicate: Arc<dyn Fn(&str) -> bool + Send + Sync> = Arc::new(|s: &str| s.contains("Staffan Olsson"));

    let mut seen = 0;
    let mut token = String::new();
    loop {
        let (hits, next) = qe.search(tag, predicate.clone(), 10, &token).await.unwrap();
        for hit in &hits {
            assert!(!hit.hits.is_empty());
        }
        seen += hits.len();
        if next.is_empty() {
            break;
        }
        token = next;
    }
    assert_eq!(seen, 50);
}

#[tokio::test]
async fn s4_search_hits_single_record() {
    let (_dir, storage, registry) = fresh_store().await;
    let (tid, obj) = make_object(&registry, 0, "met with Staffan Olsson yesterday");
    let tag = tid.tag();
    storage.put(vec![obj]).await.unwrap();

    let qe = QueryEngine::new(storage.clone(), Duration::from_secs(60));
    let predicate: Arc<dyn Fn(&str) -> bool + Send + Sync> = Arc::new(|s: &str| s.contains("Staffan Olsson"));
    let (hits, next) = qe.search(tag, predicate, 10, "").await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(next, "");
}

#[tokio::test]
async fn s5_watch_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Arc::new(SchemaRegistry::new());
    registry
        .register_static::<ScenarioObject>(vec![], HashMap::new())
        .unwrap();
    let bus = WatchBus::spawn();
    let storage = Arc::new(StorageEngine::open(dir.path(), registry.clone(), bus.clone()).unwrap());

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let mut tids = Vec::new();

    // Arm the watch before any writes, scoped to this record type's tag.
    let probe_tag = TypeTag::of_name(ScenarioObject::FULL_NAME);
    let subscriber_id = bus.watch(None, Some(tx), vec![probe_tag], vec![]).await;

    for i in 0..10 {
        let (tid, obj) = make_object(&registry, i, "");
        tids.push(tid);
        storage.put(vec![obj]).await.unwrap();
    }

    for i in 0..10 {
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Created);
        assert_eq!(decode(ev.object.as_ref()).my_int, i);
    }

    for tid in tids.iter().rev() {
        storage
            .update(*tid, |current| {
                let mut decoded = decode(current.as_ref());
                decoded.my_int += 1;
                Ok(Box::new(StaticObject::new(decoded)) as Box<dyn TypedObject>)
            })
            .await
            .unwrap();
    }

    for _ in 0..10 {
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Updated);
        let before = decode(ev.previous.as_ref().unwrap().as_ref()).my_int;
        let after = decode(ev.object.as_ref()).my_int;
        assert_eq!(after, before + 1);
    }

    for tid in &tids {
        storage.delete(*tid).await.unwrap();
    }
    let mut deleted_values: Vec<i64> = Vec::new();
    for _ in 0..10 {
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.kind, EventKind::Deleted);
        deleted_values.push(decode(ev.object.as_ref()).my_int);
    }
    deleted_values.sort_unstable();
    assert_eq!(deleted_values, (1..=10).collect::<Vec<_>>());

    bus.remove(subscriber_id).await;
}
