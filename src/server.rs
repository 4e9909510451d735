//! HTTP front end.
//!
//! `POST /call` carries the browser's encoded offer and returns the encoded
//! answer. Everything else is the demo page under the static directory.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Body;
use hyper::header::{HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;

use crate::peer::SessionNegotiator;
use crate::shutdown::ShutdownSignal;

/// Largest accepted `/call` body
pub const MAX_CALL_BODY: usize = 1 << 20;

/// Startup failures of the HTTP server
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("Server I/O error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Deserialize)]
struct CallRequest {
    offer: String,
}

#[derive(Serialize)]
struct CallResponse {
    answer: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: String,
}

struct ServerState {
    negotiator: Arc<SessionNegotiator>,
    static_dir: PathBuf,
}

/// Bound HTTP listener, ready to serve
pub struct CallServer {
    listener: TcpListener,
    state: Arc<ServerState>,
}

impl CallServer {
    pub async fn bind(
        addr: SocketAddr,
        static_dir: PathBuf,
        negotiator: Arc<SessionNegotiator>,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            state: Arc::new(ServerState {
                negotiator,
                static_dir,
            }),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` fires. In-flight requests are left
    /// to finish on their own tasks.
    pub async fn serve(self, shutdown: ShutdownSignal) {
        if let Ok(addr) = self.listener.local_addr() {
            info!("Listening on http://{}", addr);
        }

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            debug!("Connection from {}", peer);
                            let io = TokioIo::new(stream);
                            let state = self.state.clone();

                            tokio::spawn(async move {
                                let service = service_fn(move |req| {
                                    let state = state.clone();
                                    async move { Ok::<_, Infallible>(handle_request(req, &state).await) }
                                });

                                if let Err(e) = http1::Builder::new()
                                    .serve_connection(io, service)
                                    .await
                                {
                                    debug!("HTTP connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.triggered() => {
                    break;
                }
            }
        }
        info!("HTTP server stopped");
    }
}

async fn handle_request<B>(req: Request<B>, state: &ServerState) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::POST, "/call") => handle_call(req, state).await,
        (_, "/call") => error_response(StatusCode::METHOD_NOT_ALLOWED, "method not allowed"),
        (&Method::GET, "/") => serve_file(&state.static_dir, "index.html").await,
        (&Method::GET, p) if p.starts_with("/static/") => {
            serve_file(&state.static_dir, &p["/static/".len()..]).await
        }
        _ => not_found(),
    }
}

async fn handle_call<B>(req: Request<B>, state: &ServerState) -> Response<Full<Bytes>>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    let body = match Limited::new(req.into_body(), MAX_CALL_BODY).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            warn!("Rejected /call body larger than {} bytes", MAX_CALL_BODY);
            return error_response(StatusCode::PAYLOAD_TOO_LARGE, &e.to_string());
        }
        Err(e) => {
            error!("Failed to read /call body: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    let call: CallRequest = match serde_json::from_slice(&body) {
        Ok(call) => call,
        Err(e) => {
            error!("Invalid /call body: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string());
        }
    };

    match state.negotiator.negotiate(&call.offer).await {
        Ok(answer) => json_response(StatusCode::OK, &CallResponse { answer }),
        Err(e) => {
            error!("Call failed: {}", e);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

/// Map a request path below the static directory to a file, refusing anything
/// that is not a plain relative path.
fn resolve_static(static_dir: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    if relative.as_os_str().is_empty() {
        return None;
    }
    if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(static_dir.join(relative))
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("js") => "text/javascript; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

async fn serve_file(static_dir: &Path, relative: &str) -> Response<Full<Bytes>> {
    let Some(path) = resolve_static(static_dir, relative) else {
        return not_found();
    };

    match tokio::fs::read(&path).await {
        Ok(contents) => response(StatusCode::OK, content_type(&path), contents),
        Err(e) => {
            debug!("Static file {} unavailable: {}", path.display(), e);
            not_found()
        }
    }
}

fn response(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(body).unwrap_or_default();
    let mut response = response(status, "application/json", body);
    response
        .headers_mut()
        .insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    response
}

fn error_response(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
    json_response(
        status,
        &ErrorResponse {
            success: false,
            error: message.to_string(),
        },
    )
}

fn not_found() -> Response<Full<Bytes>> {
    response(StatusCode::NOT_FOUND, "text/plain; charset=utf-8", "Not Found")
}
