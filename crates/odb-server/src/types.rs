//! Statically-linked record types shipped with the server binary.
//!
//! A deployment with its own schema links its own types in instead (or
//! loads a `FileDescriptorSet` via `--schema-file`); `GenericRecord` exists
//! so a server started against an empty data directory can `Create`/`Get`/
//! `List` something without any schema of its own.

use odb::metadata::Metadata;
use odb::record::StaticRecord;

#[derive(Clone, PartialEq, Default, ::prost::Message)]
pub struct GenericRecord {
    #[prost(message, tag = "1")]
    pub metadata: Option<Metadata>,
    #[prost(bytes = "vec", tag = "2")]
    pub payload: Vec<u8>,
}

impl StaticRecord for GenericRecord {
    const FULL_NAME: &'static str = "odb.v1.GenericRecord";

    fn metadata(&self) -> &Metadata {
        self.metadata.as_ref().expect("metadata always populated by registry::create")
    }

    fn metadata_mut(&mut self) -> &mut Metadata {
        self.metadata.get_or_insert_with(Metadata::default)
    }
}
