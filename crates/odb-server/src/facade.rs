//! RPC Facade: translates wire requests onto the Schema Registry,
//! Storage Engine and Query Engine. Every unary method maps `NotFound`
//! through to the wire unchanged and collapses everything else to
//! `INTERNAL_ERROR` with a descriptive message — the one exception
//! being `SESSION_INVALID`, also preserved, for the streaming call.

use std::sync::Arc;
use std::time::Instant;

use odb::key::{ObjRef, TypeId, TypeTag};
use odb::metrics::Metrics;
use odb::query::QueryEngine;
use odb::registry::{SchemaRegistry, TypeSpec};
use odb::storage::StorageEngine;
use odb::{ObjectStoreError, Result as ObjResult};

use crate::wire::{Request, Response, WireObjRef, WireObject, WireTypeName};

/// Everything one connection needs to answer a request. Constructed once
/// in `main` and shared (via `Arc`) across every connection — no
/// process-wide globals.
pub struct AppState {
    pub storage: Arc<StorageEngine>,
    pub query: Arc<QueryEngine>,
    pub registry: Arc<SchemaRegistry>,
    pub metrics: Arc<Metrics>,
}

fn to_wire_object(tid: TypeId, object: &dyn odb::TypedObject) -> ObjResult<WireObject> {
    Ok(WireObject {
        key: tid.as_bytes().to_vec(),
        value: object.encode()?,
    })
}

fn type_tag_from_bytes(bytes: &[u8]) -> ObjResult<TypeTag> {
    if bytes.len() != TypeTag::LEN {
        return Err(ObjectStoreError::InvalidType(format!(
            "type tag must be {} bytes, got {}",
            TypeTag::LEN,
            bytes.len()
        )));
    }
    let mut b = [0u8; 4];
    b.copy_from_slice(bytes);
    Ok(TypeTag::from_bytes(b))
}

fn error_response(err: ObjectStoreError) -> Response {
    let code = if err.is_preserved_at_boundary() {
        err.code().to_string()
    } else {
        "INTERNAL_ERROR".to_string()
    };
    Response::Error {
        code,
        message: err.to_string(),
    }
}

/// Dispatches one unary request. Server-streaming (`StreamRefs`) is
/// handled separately by the connection loop, which drives repeated
/// calls into the Query Engine and writes one frame per page.
pub async fn handle_unary(state: &AppState, request: Request) -> Response {
    let op_name = operation_name(&request);
    let start = Instant::now();
    let result = dispatch_unary(state, request).await;
    let is_error = result.is_err();
    state.metrics.record_call(op_name, start.elapsed(), is_error);
    match result {
        Ok(resp) => resp,
        Err(e) => error_response(e),
    }
}

fn operation_name(request: &Request) -> &'static str {
    match request {
        Request::List { .. } => "list",
        Request::Get { .. } => "get",
        Request::Create { .. } => "create",
        Request::Update { .. } => "update",
        Request::Delete { .. } => "delete",
        Request::GetSchema => "getSchema",
        Request::GetTypeNames => "getTypeNames",
        Request::StreamRefs { .. } => "streamRefs",
        Request::Hello { .. } => "hello",
    }
}

async fn dispatch_unary(state: &AppState, request: Request) -> ObjResult<Response> {
    match request {
        Request::Hello { .. } => Ok(Response::Hello { protocol_version: 1 }),

        Request::List {
            type_tag,
            page_size,
            page_token,
        } => {
            let tag = type_tag_from_bytes(&type_tag)?;
            let (items, next) = state.query.list(tag, page_size.max(0) as usize, &page_token).await?;
            let objects = items
                .into_iter()
                .map(|item| to_wire_object(item.type_id, item.object.as_ref()))
                .collect::<ObjResult<Vec<_>>>()?;
            Ok(Response::List {
                objects,
                next_page_token: next,
            })
        }

        Request::Get { reference } => {
            let tid = wire_ref_to_type_id(&reference)?;
            let object = state.storage.get(tid).await?;
            Ok(Response::Ok {
                object: to_wire_object(tid, object.as_ref())?,
            })
        }

        Request::Create { type_tag } => {
            let tag = type_tag_from_bytes(&type_tag)?;
            let object = state.registry.create(&TypeSpec::Tag(tag))?;
            let meta = object.metadata();
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(&meta.uuid[..16.min(meta.uuid.len())]);
            let tid = TypeId::new(tag, uuid);
            let wire = to_wire_object(tid, object.as_ref())?;
            state.storage.put(vec![object]).await?;
            Ok(Response::Ok { object: wire })
        }

        Request::Update { object } => {
            let tid = TypeId::decode(&object.key)?;
            let new_value = object.value;
            let registry = state.registry.clone();
            let updated = state
                .storage
                .update(tid, move |_current| registry.unmarshal(tid.as_bytes(), &new_value))
                .await?;
            Ok(Response::Ok {
                object: to_wire_object(tid, updated.as_ref())?,
            })
        }

        Request::Delete { reference } => {
            let tid = wire_ref_to_type_id(&reference)?;
            let object = state.storage.delete(tid).await?;
            Ok(Response::Ok {
                object: to_wire_object(tid, object.as_ref())?,
            })
        }

        Request::GetSchema => {
            let fds = state.registry.file_descriptor_set();
            let mut bytes = Vec::new();
            prost::Message::encode(&fds, &mut bytes)?;
            Ok(Response::Schema { descriptor_set: bytes })
        }

        Request::GetTypeNames => {
            let types = state
                .registry
                .get_type_names()
                .into_iter()
                .map(|(full_name, aliases)| WireTypeName { full_name, aliases })
                .collect();
            Ok(Response::TypeNames { types })
        }

        Request::StreamRefs { .. } => Err(ObjectStoreError::Internal(
            "StreamRefs must be driven by the streaming connection loop".into(),
        )),
    }
}

fn wire_ref_to_type_id(reference: &WireObjRef) -> ObjResult<TypeId> {
    let tag = type_tag_from_bytes(&reference.type_tag)?;
    if reference.uuid.len() != 16 {
        return Err(ObjectStoreError::InvalidType(format!(
            "ref uuid must be 16 bytes, got {}",
            reference.uuid.len()
        )));
    }
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&reference.uuid);
    Ok(TypeId::new(tag, uuid))
}

/// Drives one `StreamRefs` call to completion, writing one `Response::Refs`
/// frame per page by repeatedly paging the Query Engine's `SearchRef`
/// session until it drains.
pub async fn stream_refs_page(
    state: &AppState,
    type_tag: Option<Vec<u8>>,
    page_size: i32,
    page_token: &str,
) -> ObjResult<(Vec<ObjRef>, String)> {
    let selector: Arc<dyn Fn(&ObjRef) -> bool + Send + Sync> = match type_tag {
        Some(bytes) => {
            let tag = type_tag_from_bytes(&bytes)?;
            Arc::new(move |r: &ObjRef| r.type_tag == tag)
        }
        None => Arc::new(|_: &ObjRef| true),
    };
    state
        .query
        .search_ref(selector, page_size.max(0) as usize, page_token)
        .await
}
