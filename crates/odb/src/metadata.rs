//! The mandatory `Metadata` sub-message every stored record carries.
//!
//! Field numbers are fixed and must never be renumbered: the dynamic-object
//! path (`record::DynamicObject::metadata`) reads these fields off a
//! runtime descriptor by number, not by name.

use prost_types::Timestamp;

use crate::key::TypeTag;

/// `type` (1), `uuid` (2), `labels` (3), `description` (4), `created_at` (5),
/// `updated_at` (6).
#[derive(Clone, PartialEq, Default, ::prost::Message)]
pub struct Metadata {
    #[prost(bytes = "vec", tag = "1")]
    pub r#type: Vec<u8>,
    #[prost(bytes = "vec", tag = "2")]
    pub uuid: Vec<u8>,
    #[prost(string, repeated, tag = "3")]
    pub labels: Vec<String>,
    #[prost(string, tag = "4")]
    pub description: String,
    #[prost(message, tag = "5")]
    pub created_at: Option<Timestamp>,
    #[prost(message, tag = "6")]
    pub updated_at: Option<Timestamp>,
}

/// Field numbers used by the dynamic-object descriptor walk. Kept alongside
/// the static struct so the two paths can never drift out of sync.
pub mod field_numbers {
    pub const TYPE: u32 = 1;
    pub const UUID: u32 = 2;
    pub const LABELS: u32 = 3;
    pub const DESCRIPTION: u32 = 4;
    pub const CREATED_AT: u32 = 5;
    pub const UPDATED_AT: u32 = 6;
}

impl Metadata {
    pub fn new(type_tag: TypeTag, uuid: [u8; 16]) -> Self {
        let now = now_timestamp();
        Metadata {
            r#type: type_tag.as_bytes().to_vec(),
            uuid: uuid.to_vec(),
            labels: Vec::new(),
            description: String::new(),
            created_at: Some(now.clone()),
            updated_at: Some(now),
        }
    }

    pub fn type_tag(&self) -> Option<TypeTag> {
        if self.r#type.len() != TypeTag::LEN {
            return None;
        }
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.r#type);
        Some(TypeTag::from_bytes(b))
    }

    pub fn touch_updated_at(&mut self) {
        self.updated_at = Some(now_timestamp());
    }
}

/// Wall-clock timestamp, seconds + nanoseconds since the Unix epoch.
pub fn now_timestamp() -> Timestamp {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    Timestamp {
        seconds: now.as_secs() as i64,
        nanos: now.subsec_nanos() as i32,
    }
}

/// Ordering by (seconds, nanos); `prost_types::Timestamp` has no `Ord` impl.
pub fn timestamp_cmp(a: &Timestamp, b: &Timestamp) -> std::cmp::Ordering {
    (a.seconds, a.nanos).cmp(&(b.seconds, b.nanos))
}
