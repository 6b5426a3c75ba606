//! Wire protocol: `[4-byte length BE][MessagePack payload]` framing
//! carrying a tagged request/response enum, one variant per RPC Facade
//! operation — the same framing style as the storage server's own
//! `bin/rfdb_server.rs`, generalized to an async `tokio` socket instead
//! of a blocking `std` one.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Requests larger than this are rejected before the payload is even read.
const MAX_MESSAGE_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "camelCase")]
pub enum Request {
    List {
        #[serde(rename = "type")]
        type_tag: Vec<u8>,
        page_size: i32,
        #[serde(default)]
        page_token: String,
    },
    Get {
        #[serde(rename = "ref")]
        reference: WireObjRef,
    },
    Create {
        #[serde(rename = "type")]
        type_tag: Vec<u8>,
    },
    Update {
        object: WireObject,
    },
    Delete {
        #[serde(rename = "ref")]
        reference: WireObjRef,
    },
    GetSchema,
    GetTypeNames,
    StreamRefs {
        #[serde(rename = "type", default)]
        type_tag: Option<Vec<u8>>,
        page_size: i32,
        #[serde(default)]
        page_token: String,
    },
    /// Negotiate protocol version, in the style of the storage server's
    /// own `Hello` handshake.
    Hello {
        #[serde(rename = "protocolVersion", default)]
        protocol_version: Option<u32>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum Response {
    Ok { object: WireObject },
    List { objects: Vec<WireObject>, next_page_token: String },
    Schema { descriptor_set: Vec<u8> },
    TypeNames { types: Vec<WireTypeName> },
    Refs { refs: Vec<WireObjRef>, next_page_token: String },
    Hello { protocol_version: u32 },
    Error { code: String, message: String },
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WireObject {
    /// Raw 20-byte `TypeId`.
    pub key: Vec<u8>,
    /// Canonical binary encoding of the record.
    pub value: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WireObjRef {
    #[serde(rename = "type")]
    pub type_tag: Vec<u8>,
    pub uuid: Vec<u8>,
}

#[derive(Debug, Serialize)]
pub struct WireTypeName {
    pub full_name: String,
    pub aliases: Vec<String>,
}

pub async fn read_message<R: tokio::io::AsyncRead + Unpin>(stream: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("message too large: {len} bytes"),
        ));
    }
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(Some(buf))
}

pub async fn write_message<W: tokio::io::AsyncWrite + Unpin>(stream: &mut W, data: &[u8]) -> std::io::Result<()> {
    stream.write_all(&(data.len() as u32).to_be_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await
}
