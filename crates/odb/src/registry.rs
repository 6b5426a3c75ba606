//! Runtime registry of message descriptors: derives `TypeTag`s, builds
//! fresh record instances for a given type, and dispatches `unmarshal`
//! to the right decoder — static `prost` struct or descriptor-bound
//! `DynamicMessage` — via one small table.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use prost::Message as _;
use prost_reflect::{DescriptorPool, DynamicMessage, FileDescriptorProto, MessageDescriptor};
use uuid::Uuid;

use crate::error::{ObjectStoreError, Result};
use crate::key::{TypeId, TypeTag};
use crate::metadata::Metadata;
use crate::record::{DynamicObject, StaticObject, StaticRecord, TypedObject};

/// A factory that yields a fresh, empty instance of one registered type.
type StaticFactory = Arc<dyn Fn() -> Box<dyn TypedObject> + Send + Sync>;
type StaticDecoder = Arc<dyn Fn(&[u8]) -> Result<Box<dyn TypedObject>> + Send + Sync>;

#[derive(Clone)]
enum Origin {
    /// Compiled into this binary.
    Static {
        factory: StaticFactory,
        decoder: StaticDecoder,
    },
    /// Known only through a loaded `FileDescriptorSet`.
    Dynamic { descriptor: MessageDescriptor },
}

/// One entry per registered type.
#[derive(Clone)]
pub struct MessageInfo {
    pub full_name: String,
    pub tag: TypeTag,
    pub aliases: Vec<String>,
    pub print_templates: HashMap<String, String>,
    origin: Origin,
}

impl MessageInfo {
    pub fn is_dynamic(&self) -> bool {
        matches!(self.origin, Origin::Dynamic { .. })
    }

    fn instantiate(&self) -> Box<dyn TypedObject> {
        match &self.origin {
            Origin::Static { factory, .. } => factory(),
            Origin::Dynamic { descriptor } => {
                Box::new(DynamicObject::new(DynamicMessage::new(descriptor.clone())))
            }
        }
    }

    fn decode(&self, bytes: &[u8]) -> Result<Box<dyn TypedObject>> {
        match &self.origin {
            Origin::Static { decoder, .. } => decoder(bytes),
            Origin::Dynamic { descriptor } => {
                let msg = DynamicMessage::decode(descriptor.clone(), bytes)?;
                Ok(Box::new(DynamicObject::new(msg)))
            }
        }
    }
}

/// What the caller hands to [`SchemaRegistry::create`] / lookups.
#[derive(Clone, Debug)]
pub enum TypeSpec {
    FullName(String),
    Tag(TypeTag),
    Alias(String),
}

struct Inner {
    by_name: HashMap<String, MessageInfo>,
    by_tag: HashMap<TypeTag, String>,
    alias_to_name: HashMap<String, String>,
    pool: Option<DescriptorPool>,
}

/// Thread-safe registry of every type the store knows how to instantiate.
///
/// Guarded by one coarse `RwLock`: registration happens at startup and on
/// the rare schema reload, while lookups (vastly more common) take only a
/// read lock.
pub struct SchemaRegistry {
    inner: RwLock<Inner>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        SchemaRegistry {
            inner: RwLock::new(Inner {
                by_name: HashMap::new(),
                by_tag: HashMap::new(),
                alias_to_name: HashMap::new(),
                pool: None,
            }),
        }
    }

    /// Register a statically-linked type. Panics if its name's hash
    /// collides with an already-registered type under a different name —
    /// the type tag space is assumed injective across the registered set,
    /// and a collision is a build-time modeling error, not a recoverable
    /// runtime condition.
    pub fn register_static<T: StaticRecord>(
        &self,
        aliases: Vec<String>,
        print_templates: HashMap<String, String>,
    ) -> Result<()> {
        let tag = TypeTag::of_name(T::FULL_NAME);
        let factory: StaticFactory = Arc::new(|| Box::new(StaticObject::new(T::default())));
        let decoder: StaticDecoder = Arc::new(|bytes: &[u8]| {
            let msg = T::decode(bytes).map_err(ObjectStoreError::Decode)?;
            Ok(Box::new(StaticObject::new(msg)) as Box<dyn TypedObject>)
        });
        let info = MessageInfo {
            full_name: T::FULL_NAME.to_string(),
            tag,
            aliases,
            print_templates,
            origin: Origin::Static { factory, decoder },
        };
        self.insert(info)
    }

    /// Register every message in a descriptor set that has a `metadata`
    /// field of type `Metadata` and is not already known statically.
    /// Returns the number of newly-registered dynamic types.
    pub fn load_descriptor_set(&self, fds: prost_types::FileDescriptorSet) -> Result<usize> {
        let mut pool = {
            let guard = self.inner.read().unwrap();
            guard.pool.clone().unwrap_or_default()
        };
        for file in &fds.file {
            let proto: FileDescriptorProto = file.clone();
            pool.add_file_descriptor_proto(proto)
                .map_err(|e| ObjectStoreError::InvalidType(format!("bad descriptor: {e}")))?;
        }

        let mut added = 0usize;
        for message in pool.all_messages() {
            if self.is_registered(&message.full_name()) {
                continue;
            }
            if message.get_field_by_name("metadata").is_none() {
                continue;
            }
            let tag = TypeTag::of_name(message.full_name());
            let info = MessageInfo {
                full_name: message.full_name().to_string(),
                tag,
                aliases: Vec::new(),
                print_templates: HashMap::new(),
                origin: Origin::Dynamic {
                    descriptor: message.clone(),
                },
            };
            self.insert(info)?;
            added += 1;
        }

        self.inner.write().unwrap().pool = Some(pool);
        Ok(added)
    }

    /// Serialize the accumulated descriptor set (static types are
    /// synthesized into it too, so the persisted set is always a superset
    /// of what's compiled in).
    pub fn file_descriptor_set(&self) -> prost_types::FileDescriptorSet {
        let guard = self.inner.read().unwrap();
        match &guard.pool {
            Some(pool) => prost_types::FileDescriptorSet {
                file: pool.file_descriptor_protos().cloned().collect(),
            },
            None => prost_types::FileDescriptorSet { file: Vec::new() },
        }
    }

    fn is_registered(&self, full_name: &str) -> bool {
        self.inner.read().unwrap().by_name.contains_key(full_name)
    }

    fn insert(&self, info: MessageInfo) -> Result<()> {
        let mut guard = self.inner.write().unwrap();
        if let Some(existing) = guard.by_tag.get(&info.tag) {
            if existing != &info.full_name {
                panic!(
                    "type tag collision at registration: '{}' and '{}' both hash to tag {}",
                    existing, info.full_name, info.tag
                );
            }
        }
        for alias in &info.aliases {
            if let Some(owner) = guard.alias_to_name.get(alias) {
                if owner != &info.full_name {
                    return Err(ObjectStoreError::InvalidType(format!(
                        "alias '{alias}' already used by '{owner}'"
                    )));
                }
            }
        }
        guard.by_tag.insert(info.tag, info.full_name.clone());
        for alias in &info.aliases {
            guard.alias_to_name.insert(alias.clone(), info.full_name.clone());
        }
        guard.by_name.insert(info.full_name.clone(), info);
        Ok(())
    }

    fn resolve(&self, spec: &TypeSpec) -> Result<MessageInfo> {
        let guard = self.inner.read().unwrap();
        let name = match spec {
            TypeSpec::FullName(n) => n.clone(),
            TypeSpec::Alias(a) => guard
                .alias_to_name
                .get(a)
                .cloned()
                .ok_or_else(|| ObjectStoreError::NotAnObject(format!("unknown alias '{a}'")))?,
            TypeSpec::Tag(tag) => guard
                .by_tag
                .get(tag)
                .cloned()
                .ok_or_else(|| ObjectStoreError::NotAnObject(format!("unregistered type tag {tag}")))?,
        };
        guard
            .by_name
            .get(&name)
            .cloned()
            .ok_or_else(|| ObjectStoreError::NotAnObject(format!("unregistered type '{name}'")))
    }

    /// `create(spec) → Record`: a fresh instance with `Metadata`
    /// pre-populated (`type`, a new `uuid`, `created_at`/`updated_at`,
    /// empty `labels`).
    pub fn create(&self, spec: &TypeSpec) -> Result<Box<dyn TypedObject>> {
        let info = self.resolve(spec)?;
        let mut obj = info.instantiate();
        let uuid = *Uuid::new_v4().as_bytes();
        obj.set_metadata(Metadata::new(info.tag, uuid));
        Ok(obj)
    }

    /// `unmarshal(key, value) → Record`: resolves the type from
    /// `key[0..4)`, instantiates, then decodes `value`.
    pub fn unmarshal(&self, key: &[u8], value: &[u8]) -> Result<Box<dyn TypedObject>> {
        let tid = TypeId::decode(key)?;
        let info = self.resolve(&TypeSpec::Tag(tid.tag()))?;
        info.decode(value)
    }

    pub fn get_type_names(&self) -> Vec<(String, Vec<String>)> {
        let guard = self.inner.read().unwrap();
        guard
            .by_name
            .values()
            .map(|info| (info.full_name.clone(), info.aliases.clone()))
            .collect()
    }

    pub fn lookup(&self, spec: &TypeSpec) -> Result<MessageInfo> {
        self.resolve(spec)
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_fixtures::TestObject;

    #[test]
    fn register_and_create_static_type() {
        let reg = SchemaRegistry::new();
        reg.register_static::<TestObject>(vec!["test".into()], HashMap::new())
            .unwrap();
        let obj = reg.create(&TypeSpec::FullName(TestObject::FULL_NAME.to_string())).unwrap();
        assert_eq!(obj.full_name(), TestObject::FULL_NAME);
        assert_eq!(obj.metadata().uuid.len(), 16);
    }

    #[test]
    fn reregistering_the_same_type_is_idempotent() {
        let reg = SchemaRegistry::new();
        reg.register_static::<TestObject>(vec![], HashMap::new()).unwrap();
        reg.register_static::<TestObject>(vec![], HashMap::new()).unwrap();
    }

    #[test]
    #[should_panic(expected = "type tag collision")]
    fn distinct_names_sharing_a_tag_panics_at_registration() {
        let reg = SchemaRegistry::new();
        let tag = TypeTag::of_name(TestObject::FULL_NAME);
        // Force a genuine collision: a second, distinct name inserted
        // directly under the first name's tag.
        let info = MessageInfo {
            full_name: "odb.v1.NotTestObject".to_string(),
            tag,
            aliases: Vec::new(),
            print_templates: HashMap::new(),
            origin: Origin::Static {
                factory: Arc::new(|| Box::new(StaticObject::new(TestObject::default()))),
                decoder: Arc::new(|bytes: &[u8]| {
                    TestObject::decode(bytes)
                        .map(|m| Box::new(StaticObject::new(m)) as Box<dyn TypedObject>)
                        .map_err(ObjectStoreError::Decode)
                }),
            },
        };
        reg.register_static::<TestObject>(vec![], HashMap::new()).unwrap();
        reg.insert(info).unwrap();
    }

    #[test]
    fn unregistered_type_is_not_an_object() {
        let reg = SchemaRegistry::new();
        let err = reg.create(&TypeSpec::FullName("nope".into())).unwrap_err();
        assert_eq!(err.code(), "NOT_AN_OBJECT");
    }
}
