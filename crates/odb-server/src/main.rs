//! odb-server: binds the RPC Facade to a length-prefixed MessagePack
//! socket protocol.
//!
//! Usage:
//!   odb-server [--address host:port] [--data-dir PATH] [--config FILE]
//!
//! Protocol:
//!   Request:  [4-byte length BE] [MessagePack payload]
//!   Response: [4-byte length BE] [MessagePack payload], possibly several
//!             frames in a row for `streamRefs`, terminated by an empty
//!             `Refs` frame (`nextPageToken == ""`).

mod facade;
mod types;
mod wire;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing_subscriber::EnvFilter;

use odb::config::Config;
use odb::query::QueryEngine;
use odb::registry::SchemaRegistry;
use odb::storage::StorageEngine;
use odb::metrics::Metrics;
use odb::watch::WatchBus;

use facade::AppState;
use wire::{read_message, write_message, Request, Response};

#[derive(Parser, Debug)]
#[command(name = "odb-server", version)]
struct Args {
    #[arg(long)]
    address: Option<std::net::SocketAddr>,

    #[arg(long)]
    unix_socket: Option<PathBuf>,

    #[arg(long)]
    data_dir: Option<PathBuf>,

    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    session_idle_timeout_secs: Option<u64>,

    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    schema_file: Option<PathBuf>,
}

fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)?;
            Config::from_yaml(&contents)?
        }
        None => Config::default(),
    };
    if let Some(address) = args.address {
        config.address = address;
    }
    if let Some(path) = &args.unix_socket {
        config.unix_socket = Some(path.clone());
    }
    if let Some(data_dir) = &args.data_dir {
        config.data_dir = data_dir.clone();
    }
    if let Some(secs) = args.session_idle_timeout_secs {
        config.session_idle_timeout_secs = secs;
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    if let Some(path) = &args.schema_file {
        config.schema_file = Some(path.clone());
    }
    Ok(config)
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    std::fs::create_dir_all(&config.data_dir)?;

    let registry = Arc::new(SchemaRegistry::new());
    registry.register_static::<types::GenericRecord>(vec![], HashMap::new())?;
    if let Some(path) = &config.schema_file {
        let bytes = std::fs::read(path)?;
        let fds: prost_types::FileDescriptorSet = prost::Message::decode(bytes.as_slice())?;
        let added = registry.load_descriptor_set(fds)?;
        tracing::info!(path = %path.display(), added, "loaded schema file");
    }

    let watch = WatchBus::spawn();
    let storage = Arc::new(StorageEngine::open(&config.data_dir, registry.clone(), watch)?);
    storage.load_persisted_schema().await?;

    let query = Arc::new(QueryEngine::new(storage.clone(), config.session_idle_timeout()));
    let metrics = Arc::new(Metrics::new());

    let state = Arc::new(AppState {
        storage,
        query,
        registry,
        metrics,
    });

    if let Some(path) = &config.unix_socket {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path)?;
        tracing::info!(path = %path.display(), "odb-server listening on unix socket");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => spawn_connection(stream, "unix".to_string(), &state),
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown_signal() => {
                    tracing::info!("shutdown signal received");
                    state.storage.store_schema().await.ok();
                    break;
                }
            }
        }
    } else {
        let listener = TcpListener::bind(config.address).await?;
        tracing::info!(address = %config.address, "odb-server listening");
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => spawn_connection(stream, peer.to_string(), &state),
                        Err(e) => tracing::warn!(error = %e, "accept failed"),
                    }
                }
                _ = shutdown_signal() => {
                    tracing::info!("shutdown signal received");
                    state.storage.store_schema().await.ok();
                    break;
                }
            }
        }
    }

    Ok(())
}

fn spawn_connection<S>(stream: S, peer: String, state: &Arc<AppState>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let state = state.clone();
    tokio::spawn(async move {
        tracing::info!(%peer, "client connected");
        if let Err(e) = handle_connection(stream, state).await {
            tracing::warn!(%peer, error = %e, "connection closed with error");
        }
    });
}

/// Races `Ctrl+C` against `SIGTERM` (Unix only); either triggers shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn handle_connection<S: AsyncRead + AsyncWrite + Unpin>(mut stream: S, state: Arc<AppState>) -> anyhow::Result<()> {
    let mut open_list_token: Option<String> = None;

    loop {
        let Some(msg) = read_message(&mut stream).await? else {
            break;
        };

        let request: Request = match rmp_serde::from_slice(&msg) {
            Ok(req) => req,
            Err(e) => {
                let resp = Response::Error {
                    code: "INVALID_TYPE".to_string(),
                    message: format!("invalid request: {e}"),
                };
                write_message(&mut stream, &rmp_serde::to_vec_named(&resp)?).await?;
                continue;
            }
        };

        if let Request::StreamRefs {
            type_tag,
            page_size,
            page_token,
        } = request
        {
            stream_refs_to_completion(&mut stream, &state, type_tag, page_size, page_token).await?;
            continue;
        }

        let is_list = matches!(request, Request::List { .. });
        let response = facade::handle_unary(&state, request).await;
        if is_list {
            open_list_token = match &response {
                Response::List { next_page_token, .. } if !next_page_token.is_empty() => {
                    Some(next_page_token.clone())
                }
                _ => None,
            };
        }
        write_message(&mut stream, &rmp_serde::to_vec_named(&response)?).await?;
    }

    // The client is gone; abandon any List session it never paged to
    // completion rather than waiting out the idle-timeout sweep.
    if let Some(token) = open_list_token {
        state.query.cancel_list(&token).await.ok();
    }
    Ok(())
}

/// Drives a `StreamRefs` call by repeatedly paging the underlying
/// `SearchRef` session and writing one frame per page, until the session
/// drains (empty `nextPageToken`). If the client disconnects mid-stream,
/// the still-open session is cancelled immediately rather than left for
/// the idle-timeout sweep.
async fn stream_refs_to_completion<S: AsyncRead + AsyncWrite + Unpin>(
    stream: &mut S,
    state: &Arc<AppState>,
    type_tag: Option<Vec<u8>>,
    page_size: i32,
    mut page_token: String,
) -> anyhow::Result<()> {
    loop {
        let result = facade::stream_refs_page(state, type_tag.clone(), page_size, &page_token).await;
        let (refs, next) = match result {
            Ok(pair) => pair,
            Err(e) => {
                let resp = Response::Error {
                    code: e.code().to_string(),
                    message: e.to_string(),
                };
                write_message(stream, &rmp_serde::to_vec_named(&resp)?).await?;
                return Ok(());
            }
        };

        let wire_refs = refs
            .into_iter()
            .map(|r| wire::WireObjRef {
                type_tag: r.type_tag.as_bytes().to_vec(),
                uuid: r.uuid.to_vec(),
            })
            .collect();
        let done = next.is_empty();
        let resp = Response::Refs {
            refs: wire_refs,
            next_page_token: next.clone(),
        };

        if let Err(e) = write_message(stream, &rmp_serde::to_vec_named(&resp)?).await {
            if !done {
                state.query.cancel_search_ref(&next).await.ok();
            }
            return Err(e.into());
        }

        if done {
            return Ok(());
        }
        page_token = next;
    }
}
