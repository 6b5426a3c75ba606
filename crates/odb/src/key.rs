//! Composite key layout and its string encodings.
//!
//! A `TypeId` is the 20-byte key under which every record lives in the
//! `obj` tree: a 4-byte [`TypeTag`] followed by a 16-byte id. The byte
//! layout is also the tree's sort order, so a type-scoped range scan is
//! just a prefix scan on the first 4 bytes.

use std::fmt;

use percent_encoding::{percent_decode_str, percent_encode, AsciiSet, CONTROLS};

use crate::error::{ObjectStoreError, Result};

/// Every byte outside unreserved ASCII is escaped, matching `url.QueryEscape`'s
/// behavior of encoding anything that isn't a safe query-string character.
const RAW_KEY_ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'\'')
    .add(b'+')
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'<')
    .add(b'=')
    .add(b'>')
    .add(b'?')
    .add(b'@')
    .add(b'[')
    .add(b']')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}')
    .add(b'~');

/// Stable 4-byte hash of a record type's fully-qualified name.
///
/// Derived by FNV-1a 32-bit over the UTF-8 bytes of the name, stored
/// big-endian. Two distinct names hashing to the same tag is a
/// registration-time error (see `registry::SchemaRegistry::register`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeTag(pub [u8; 4]);

impl TypeTag {
    pub const LEN: usize = 4;

    /// FNV-1a 32-bit hash, offset basis `0x811c9dc5`, prime `0x01000193`.
    pub fn of_name(full_name: &str) -> Self {
        let mut hash: u32 = 0x811c9dc5;
        for byte in full_name.as_bytes() {
            hash ^= *byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        TypeTag(hash.to_be_bytes())
    }

    pub fn from_bytes(b: [u8; 4]) -> Self {
        TypeTag(b)
    }

    pub fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// The 4-byte prefix used for type-scoped range scans.
    pub fn prefix(&self) -> [u8; 4] {
        self.0
    }
}

impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}{:02x}{:02x}{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

/// The 20-byte composite key: `TypeTag ‖ uuid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId {
    data: [u8; 20],
}

impl TypeId {
    pub const LEN: usize = 20;

    pub fn new(tag: TypeTag, id: [u8; 16]) -> Self {
        let mut data = [0u8; 20];
        data[..4].copy_from_slice(&tag.0);
        data[4..].copy_from_slice(&id);
        TypeId { data }
    }

    /// Encode `(tag, id)` into the raw 20-byte key. `id` must be exactly
    /// 16 bytes; this is enforced by the `[u8; 16]` parameter type, unlike
    /// the slice-based encoder this mirrors.
    pub fn encode(tag: TypeTag, id: [u8; 16]) -> [u8; 20] {
        Self::new(tag, id).data
    }

    /// Decode a raw key, failing with `InvalidType` unless it is exactly
    /// 20 bytes long.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::LEN {
            return Err(ObjectStoreError::InvalidType(format!(
                "key must be {} bytes, got {}",
                Self::LEN,
                bytes.len()
            )));
        }
        let mut data = [0u8; 20];
        data.copy_from_slice(bytes);
        Ok(TypeId { data })
    }

    pub fn tag(&self) -> TypeTag {
        let mut t = [0u8; 4];
        t.copy_from_slice(&self.data[..4]);
        TypeTag(t)
    }

    pub fn id(&self) -> [u8; 16] {
        let mut id = [0u8; 16];
        id.copy_from_slice(&self.data[4..]);
        id
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.data
    }

    /// Percent-encode the raw 20-byte key so it is safe inside a
    /// URL-style page token or `ObjRef` string form.
    pub fn to_string_key(&self) -> String {
        percent_encode(&self.data, RAW_KEY_ENCODE_SET).to_string()
    }

    /// Inverse of [`TypeId::to_string_key`].
    ///
    /// The decoded form is arbitrary binary, not text, so this collects raw
    /// bytes rather than validating UTF-8.
    pub fn from_string_key(s: &str) -> Result<Self> {
        let decoded: Vec<u8> = percent_decode_str(s).collect();
        Self::decode(&decoded)
    }
}

/// The wire-level `(type, uuid)` pair — a `TypeId` split into its two
/// parts, used by `ObjRef` on the RPC boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjRef {
    pub type_tag: TypeTag,
    pub uuid: [u8; 16],
}

impl ObjRef {
    pub fn from_type_id(tid: TypeId) -> Self {
        ObjRef {
            type_tag: tid.tag(),
            uuid: tid.id(),
        }
    }

    pub fn to_type_id(self) -> TypeId {
        TypeId::new(self.type_tag, self.uuid)
    }

    /// Marshal to the raw 20-byte wire form.
    pub fn marshal(&self) -> [u8; 20] {
        self.to_type_id().data
    }

    /// Unmarshal from the raw wire form; fails unless it is exactly 20 bytes.
    pub fn unmarshal(bytes: &[u8]) -> Result<Self> {
        TypeId::decode(bytes).map(ObjRef::from_type_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn string_key_round_trips_for_any_bytes(tag_bytes in prop::array::uniform4(any::<u8>()), id in prop::array::uniform16(any::<u8>())) {
            let tid = TypeId::new(TypeTag(tag_bytes), id);
            let s = tid.to_string_key();
            let back = TypeId::from_string_key(&s).unwrap();
            prop_assert_eq!(back, tid);
        }
    }

    #[test]
    fn type_tag_hash_is_stable() {
        let a = TypeTag::of_name("shdb.v1.TestObject");
        let b = TypeTag::of_name("shdb.v1.TestObject");
        assert_eq!(a, b);
    }

    #[test]
    fn key_round_trip_literal() {
        // tag = {22,23,24,25}, id = {1..16}
        let tag = TypeTag([22, 23, 24, 25]);
        let mut id = [0u8; 16];
        for (i, b) in id.iter_mut().enumerate() {
            *b = (i + 1) as u8;
        }
        let tid = TypeId::new(tag, id);
        let s = tid.to_string_key();
        assert_eq!(
            s,
            "%16%17%18%19%01%02%03%04%05%06%07%08%09%0A%0B%0C%0D%0E%0F%10"
        );
        let back = TypeId::from_string_key(&s).unwrap();
        assert_eq!(back, tid);
    }

    #[test]
    fn decode_rejects_wrong_length() {
        assert!(TypeId::decode(&[0u8; 19]).is_err());
        assert!(TypeId::decode(&[0u8; 21]).is_err());
        assert!(TypeId::decode(&[0u8; 20]).is_ok());
    }

    #[test]
    fn obj_ref_marshal_round_trip() {
        let r = ObjRef {
            type_tag: TypeTag([1, 2, 3, 4]),
            uuid: [9u8; 16],
        };
        let bytes = r.marshal();
        let back = ObjRef::unmarshal(&bytes).unwrap();
        assert_eq!(r, back);
        assert!(ObjRef::unmarshal(&bytes[..19]).is_err());
    }
}
