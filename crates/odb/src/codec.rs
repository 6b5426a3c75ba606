//! Translates between in-memory records and the `(key, value)` pairs the
//! Storage Engine persists. Each record self-identifies its key from its
//! own `Metadata`, so a single call can marshal a mixed-type batch.

use crate::error::Result;
use crate::key::TypeId;
use crate::registry::SchemaRegistry;
use crate::record::TypedObject;

/// `marshal(records...)`: uses each record's own `metadata.type` /
/// `metadata.uuid` to assemble its key; the value is the record's
/// canonical binary encoding. Empty input yields empty output.
pub fn marshal(records: &[Box<dyn TypedObject>]) -> Result<Vec<(TypeId, Vec<u8>)>> {
    records
        .iter()
        .map(|record| {
            let tag = record.type_tag()?;
            let meta = record.metadata();
            let mut uuid = [0u8; 16];
            let len = meta.uuid.len().min(16);
            uuid[..len].copy_from_slice(&meta.uuid[..len]);
            let key = TypeId::new(tag, uuid);
            let value = record.encode()?;
            Ok((key, value))
        })
        .collect()
}

/// `unmarshal(pairs...)`: the inverse, resolving each record's type from
/// its own key via the registry.
pub fn unmarshal(
    registry: &SchemaRegistry,
    pairs: &[(TypeId, Vec<u8>)],
) -> Result<Vec<Box<dyn TypedObject>>> {
    pairs
        .iter()
        .map(|(key, value)| registry.unmarshal(key.as_bytes(), value))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::test_fixtures::TestObject;
    use crate::registry::TypeSpec;
    use std::collections::HashMap;

    #[test]
    fn round_trip_is_proto_equal() {
        let reg = SchemaRegistry::new();
        reg.register_static::<TestObject>(vec![], HashMap::new()).unwrap();
        let mut obj = reg
            .create(&TypeSpec::FullName(TestObject::FULL_NAME.to_string()))
            .unwrap();
        obj.set_metadata({
            let mut m = obj.metadata();
            m.description = "hello".into();
            m
        });

        let pairs = marshal(std::slice::from_ref(&obj)).unwrap();
        assert_eq!(pairs.len(), 1);

        let back = unmarshal(&reg, &pairs).unwrap();
        assert_eq!(back[0].metadata().description, "hello");
        assert_eq!(back[0].encode().unwrap(), obj.encode().unwrap());
    }

    #[test]
    fn empty_batch_is_empty() {
        let reg = SchemaRegistry::new();
        assert!(marshal(&[]).unwrap().is_empty());
        assert!(unmarshal(&reg, &[]).unwrap().is_empty());
    }
}
