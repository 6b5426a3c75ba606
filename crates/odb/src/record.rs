//! The `TypedObject` capability: a single interface shared by
//! statically-linked record types and purely descriptor-defined
//! (dynamic) ones.
//!
//! This replaces the source's pattern of wrapping a descriptor-only
//! record and reimplementing `getMetadata()` by walking its fields —
//! here that walk is one of two implementations behind one trait, not
//! a special case bolted onto the static path.

use prost::Message as _;
use prost_reflect::{DynamicMessage, ReflectMessage, Value as ReflectValue};

use crate::error::{ObjectStoreError, Result};
use crate::key::TypeTag;
use crate::metadata::{field_numbers, Metadata};

/// A record type that is compiled into this binary: a plain `prost`
/// message with a `metadata` sub-message field.
pub trait StaticRecord: prost::Message + Default + Clone + Send + Sync + 'static {
    /// Fully-qualified schema name, e.g. `"odb.v1.TestObject"`.
    const FULL_NAME: &'static str;

    fn metadata(&self) -> &Metadata;
    fn metadata_mut(&mut self) -> &mut Metadata;
}

/// Capability shared by every storable record, static or dynamic.
///
/// Object-safe so the registry and storage engine can hold
/// `Box<dyn TypedObject>` without knowing the concrete payload type.
pub trait TypedObject: Send + Sync {
    fn full_name(&self) -> &str;

    fn type_tag(&self) -> Result<TypeTag> {
        self.metadata()
            .type_tag()
            .ok_or_else(|| ObjectStoreError::InvalidType("metadata.type has wrong length".into()))
    }

    fn metadata(&self) -> Metadata;
    fn set_metadata(&mut self, metadata: Metadata);

    fn encode(&self) -> Result<Vec<u8>>;

    /// Canonical JSON projection, used by the Search operation's leaf walk.
    fn as_json(&self) -> Result<serde_json::Value>;

    fn clone_box(&self) -> Box<dyn TypedObject>;
}

impl Clone for Box<dyn TypedObject> {
    fn clone(&self) -> Self {
        self.clone_box()
    }
}

/// Wraps a statically-linked `prost` message.
#[derive(Clone)]
pub struct StaticObject<T: StaticRecord> {
    pub inner: T,
}

impl<T: StaticRecord> StaticObject<T> {
    pub fn new(inner: T) -> Self {
        StaticObject { inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: StaticRecord> TypedObject for StaticObject<T> {
    fn full_name(&self) -> &str {
        T::FULL_NAME
    }

    fn metadata(&self) -> Metadata {
        self.inner.metadata().clone()
    }

    fn set_metadata(&mut self, metadata: Metadata) {
        *self.inner.metadata_mut() = metadata;
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.inner.encoded_len());
        self.inner.encode(&mut buf)?;
        Ok(buf)
    }

    fn as_json(&self) -> Result<serde_json::Value> {
        // Static records round-trip through their own serde mirror when one
        // is registered; the default object-safe path re-encodes to proto
        // bytes and leaves projection to callers that know the concrete
        // type. Record types used with Search register a json fn instead
        // (see `registry::MessageInfo::to_json`).
        Err(ObjectStoreError::NotAnObject(format!(
            "{} has no JSON projection registered",
            T::FULL_NAME
        )))
    }

    fn clone_box(&self) -> Box<dyn TypedObject> {
        Box::new(self.clone())
    }
}

/// Wraps a `prost_reflect::DynamicMessage` for a type known only through a
/// runtime-loaded descriptor.
#[derive(Clone)]
pub struct DynamicObject {
    pub message: DynamicMessage,
}

impl DynamicObject {
    pub fn new(message: DynamicMessage) -> Self {
        DynamicObject { message }
    }

    /// Read the nested `metadata` field by walking it field-by-number,
    /// exactly as the source's descriptor-only wrapper does.
    fn read_metadata(&self) -> Option<Metadata> {
        let meta_field = self.message.get_field_by_name("metadata")?;
        let meta_msg = meta_field.as_message()?;

        let get_bytes = |num: u32| -> Vec<u8> {
            meta_msg
                .get_field_by_number(num)
                .and_then(|v| v.as_bytes().map(|b| b.to_vec()))
                .unwrap_or_default()
        };
        let get_string = |num: u32| -> String {
            meta_msg
                .get_field_by_number(num)
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_default()
        };
        let get_labels = || -> Vec<String> {
            meta_msg
                .get_field_by_number(field_numbers::LABELS)
                .map(|v| match v {
                    ReflectValue::List(items) => items
                        .iter()
                        .filter_map(|i| i.as_str().map(|s| s.to_string()))
                        .collect(),
                    _ => Vec::new(),
                })
                .unwrap_or_default()
        };
        let get_timestamp = |num: u32| {
            meta_msg.get_field_by_number(num).and_then(|v| {
                v.as_message().map(|m| prost_types::Timestamp {
                    seconds: m
                        .get_field_by_number(1)
                        .and_then(|v| v.as_i64())
                        .unwrap_or(0),
                    nanos: m
                        .get_field_by_number(2)
                        .and_then(|v| v.as_i32())
                        .unwrap_or(0),
                })
            })
        };

        Some(Metadata {
            r#type: get_bytes(field_numbers::TYPE),
            uuid: get_bytes(field_numbers::UUID),
            labels: get_labels(),
            description: get_string(field_numbers::DESCRIPTION),
            created_at: get_timestamp(field_numbers::CREATED_AT),
            updated_at: get_timestamp(field_numbers::UPDATED_AT),
        })
    }
}

impl TypedObject for DynamicObject {
    fn full_name(&self) -> &str {
        self.message.descriptor().full_name()
    }

    fn metadata(&self) -> Metadata {
        self.read_metadata().unwrap_or_default()
    }

    fn set_metadata(&mut self, metadata: Metadata) {
        let Some(meta_desc) = self
            .message
            .descriptor()
            .get_field_by_name("metadata")
            .and_then(|f| f.kind().as_message().cloned())
        else {
            return;
        };
        let mut meta_msg = DynamicMessage::new(meta_desc);
        meta_msg.set_field_by_number(field_numbers::TYPE, ReflectValue::Bytes(metadata.r#type.into()));
        meta_msg.set_field_by_number(field_numbers::UUID, ReflectValue::Bytes(metadata.uuid.into()));
        meta_msg.set_field_by_number(
            field_numbers::LABELS,
            ReflectValue::List(metadata.labels.into_iter().map(ReflectValue::String).collect()),
        );
        meta_msg.set_field_by_number(
            field_numbers::DESCRIPTION,
            ReflectValue::String(metadata.description),
        );
        // Timestamps are left to the caller's descriptor shape; most
        // dynamic schemas reuse `google.protobuf.Timestamp` verbatim, in
        // which case the sub-fields below line up by number.
        if let Some(ts) = metadata.created_at {
            if let Some(sub_desc) = meta_msg
                .descriptor()
                .get_field_by_number(field_numbers::CREATED_AT)
                .and_then(|f| f.kind().as_message().cloned())
            {
                let mut sub = DynamicMessage::new(sub_desc);
                sub.set_field_by_number(1, ReflectValue::I64(ts.seconds));
                sub.set_field_by_number(2, ReflectValue::I32(ts.nanos));
                meta_msg.set_field_by_number(field_numbers::CREATED_AT, ReflectValue::Message(sub));
            }
        }
        if let Some(ts) = metadata.updated_at {
            if let Some(sub_desc) = meta_msg
                .descriptor()
                .get_field_by_number(field_numbers::UPDATED_AT)
                .and_then(|f| f.kind().as_message().cloned())
            {
                let mut sub = DynamicMessage::new(sub_desc);
                sub.set_field_by_number(1, ReflectValue::I64(ts.seconds));
                sub.set_field_by_number(2, ReflectValue::I32(ts.nanos));
                meta_msg.set_field_by_number(field_numbers::UPDATED_AT, ReflectValue::Message(sub));
            }
        }
        self.message
            .set_field_by_name("metadata", ReflectValue::Message(meta_msg));
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.message.encode(&mut buf)?;
        Ok(buf)
    }

    fn as_json(&self) -> Result<serde_json::Value> {
        serde_json::to_value(&self.message).map_err(ObjectStoreError::Json)
    }

    fn clone_box(&self) -> Box<dyn TypedObject> {
        Box::new(self.clone())
    }
}

#[cfg(test)]
pub mod test_fixtures {
    //! A small statically-linked record type used by the crate's own
    //! tests, standing in for whatever a caller links in.
    use super::*;

    #[derive(Clone, PartialEq, Default, ::prost::Message)]
    pub struct TestObject {
        #[prost(message, tag = "1")]
        pub metadata: Option<Metadata>,
        #[prost(int64, tag = "2")]
        pub my_int: i64,
    }

    impl StaticRecord for TestObject {
        const FULL_NAME: &'static str = "odb.v1.TestObject";

        fn metadata(&self) -> &Metadata {
            self.metadata.as_ref().expect("metadata always populated by registry::create")
        }

        fn metadata_mut(&mut self) -> &mut Metadata {
            self.metadata.get_or_insert_with(Metadata::default)
        }
    }
}
