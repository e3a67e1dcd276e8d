//! Local HTTP endpoint that feeds the timeshift buffer to the player.
//!
//! mpv is directed to `GET /live?gen=N&offset=M` on a loopback port.  The
//! handler opens a `LiveBufferSource` at the requested byte offset and
//! streams from it; a zero-length read (reader caught up, timeout elapsed)
//! keeps the response open and retries while the session generation is
//! still current, so the player never sees a premature end-of-stream at
//! the live edge.  Stale generations — mpv reconnecting against a
//! torn-down session — get 410 Gone.

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use rewind_proto::config::BufferConfig;

use crate::buffer::{Frontier, LiveBufferSource};

/// The buffer session currently visible to the proxy.  Replaced on every
/// station switch, cleared on stop; the generation ties requests to one
/// recorder lifetime.
#[derive(Clone)]
pub struct LiveSession {
    pub generation: u64,
    pub path: PathBuf,
    pub frontier: Frontier,
    pub content_type: Arc<std::sync::Mutex<Option<String>>>,
}

pub type SharedLiveSession = Arc<RwLock<Option<LiveSession>>>;

#[derive(Clone)]
struct ProxyState {
    session: SharedLiveSession,
    buffer_config: BufferConfig,
}

#[derive(Deserialize)]
struct LiveParams {
    gen: u64,
    offset: Option<u64>,
}

async fn stream_live(
    Query(params): Query<LiveParams>,
    State(state): State<ProxyState>,
) -> impl IntoResponse {
    let session = {
        let guard = state.session.read().await;
        match guard.as_ref() {
            Some(s) if s.generation == params.gen => s.clone(),
            Some(s) => {
                warn!(
                    "proxy: stale generation {} (current {})",
                    params.gen, s.generation
                );
                return status_response(StatusCode::GONE);
            }
            None => return status_response(StatusCode::NOT_FOUND),
        }
    };

    // Absent offset means at-live: start at the current frontier.
    let offset = params.offset.unwrap_or_else(|| session.frontier.get());
    let source = match LiveBufferSource::open(
        &session.path,
        offset,
        session.frontier.clone(),
        &state.buffer_config,
    ) {
        Ok(s) => s,
        Err(e) => {
            warn!("proxy: failed to open buffer at {}: {}", offset, e);
            return status_response(StatusCode::NOT_FOUND);
        }
    };

    info!(
        "proxy: serving gen={} from offset {} (frontier {})",
        params.gen,
        offset,
        session.frontier.get()
    );

    let content_type = session
        .content_type
        .lock()
        .ok()
        .and_then(|g| g.clone())
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let shared = state.session.clone();
    let generation = params.gen;
    let body_stream = futures_util::stream::unfold(source, move |mut src| {
        let shared = shared.clone();
        async move {
            loop {
                let mut chunk = vec![0u8; 8 * 1024];
                match src.read(&mut chunk).await {
                    Ok(0) => {
                        // No data within the block timeout — end the
                        // response only if the session is gone, otherwise
                        // keep waiting at the live edge.
                        let still_live = {
                            let guard = shared.read().await;
                            matches!(guard.as_ref(), Some(s) if s.generation == generation)
                        };
                        if !still_live {
                            return None;
                        }
                    }
                    Ok(n) => {
                        chunk.truncate(n);
                        return Some((Ok::<_, std::io::Error>(chunk), src));
                    }
                    Err(e) => {
                        warn!("proxy: buffer read failed: {}", e);
                        return Some((Err(e), src));
                    }
                }
            }
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(body_stream))
        .unwrap_or_else(|_| status_response(StatusCode::INTERNAL_SERVER_ERROR))
}

fn status_response(status: StatusCode) -> Response {
    Response::builder()
        .status(status)
        .body(Body::empty())
        .expect("static response")
}

pub fn start_server(
    bind_address: String,
    port: u16,
    session: SharedLiveSession,
    buffer_config: BufferConfig,
) -> tokio::task::JoinHandle<()> {
    let state = ProxyState {
        session,
        buffer_config,
    };
    let app = Router::new().route("/live", get(stream_live)).with_state(state);

    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);
        let listener = match tokio::net::TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!("proxy: failed to bind {}: {}", addr, e);
                return;
            }
        };
        info!("buffer proxy listening on http://{}", addr);
        if let Err(e) = axum::serve(listener, app).await {
            warn!("proxy: server error: {}", e);
        }
    })
}

/// Local URL the player is pointed at for a given session generation and
/// byte offset.
pub fn live_url(port: u16, generation: u64, offset: u64) -> String {
    format!(
        "http://127.0.0.1:{}/live?gen={}&offset={}",
        port, generation, offset
    )
}
