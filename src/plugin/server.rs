//! HTTP/1.1 server for the plugin protocol on a unix socket

use std::convert::Infallible;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::net::UnixListener;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::protocol::{self, ErrResponse};
use super::PluginHandlers;
use crate::error::Result;

type HttpResponse = Response<Full<Bytes>>;

/// Plugin endpoint bound to a unix socket
pub struct PluginServer {
    socket: PathBuf,
    listener: UnixListener,
    handlers: Arc<PluginHandlers>,
}

impl PluginServer {
    /// Bind the socket, replacing a stale one left by a previous run
    pub fn bind(socket: impl Into<PathBuf>, handlers: PluginHandlers) -> Result<Self> {
        let socket = socket.into();

        if let Some(parent) = socket.parent() {
            std::fs::create_dir_all(parent)?;
        }
        match std::fs::remove_file(&socket) {
            Ok(()) => debug!(socket = ?socket, "removed stale socket"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&socket)?;
        info!(socket = ?socket, "plugin listening");

        Ok(Self {
            socket,
            listener,
            handlers: Arc::new(handlers),
        })
    }

    pub fn socket(&self) -> &Path {
        &self.socket
    }

    /// Accept connections until `shutdown` is notified
    pub async fn serve(self, shutdown: Arc<Notify>) -> Result<()> {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let handlers = Arc::clone(&self.handlers);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle(Arc::clone(&handlers), req));
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await
                            {
                                debug!(error = %e, "plugin connection closed with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "plugin accept error"),
                },
                _ = shutdown.notified() => break,
            }
        }

        info!(socket = ?self.socket, "plugin server stopped");
        if let Err(e) = std::fs::remove_file(&self.socket) {
            warn!(socket = ?self.socket, error = %e, "failed to remove socket");
        }
        Ok(())
    }
}

async fn handle(
    handlers: Arc<PluginHandlers>,
    req: Request<Incoming>,
) -> std::result::Result<HttpResponse, Infallible> {
    let path = req.uri().path().to_string();

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            return Ok(error_response(
                StatusCode::BAD_REQUEST,
                format!("read request body: {}", e),
            ))
        }
    };

    debug!(endpoint = %path, "plugin request");
    Ok(dispatch(&handlers, &path, &body)
        .await
        .unwrap_or_else(|response| response))
}

async fn dispatch(
    handlers: &PluginHandlers,
    path: &str,
    body: &[u8],
) -> std::result::Result<HttpResponse, HttpResponse> {
    let response = match path {
        "/Plugin.Activate" => json_response(StatusCode::OK, &handlers.activate()),
        "/VolumeDriver.Create" => reply(path, handlers.create(decode(body)?).await),
        "/VolumeDriver.Remove" => reply(path, handlers.remove(decode(body)?).await),
        "/VolumeDriver.Mount" => reply(path, handlers.mount(decode(body)?).await),
        "/VolumeDriver.Path" => reply(path, handlers.path(decode(body)?)),
        "/VolumeDriver.Unmount" => reply(path, handlers.unmount(decode(body)?).await),
        "/VolumeDriver.Get" => reply(path, handlers.get(decode(body)?)),
        "/VolumeDriver.List" => reply(path, handlers.list()),
        "/VolumeDriver.Capabilities" => json_response(StatusCode::OK, &handlers.capabilities()),
        _ => {
            return Err(error_response(
                StatusCode::NOT_FOUND,
                format!("unknown endpoint {}", path),
            ))
        }
    };
    Ok(response)
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> std::result::Result<T, HttpResponse> {
    serde_json::from_slice(body).map_err(|e| {
        error_response(StatusCode::BAD_REQUEST, format!("malformed request: {}", e))
    })
}

fn reply<T: Serialize>(endpoint: &str, result: Result<T>) -> HttpResponse {
    match result {
        Ok(body) => json_response(StatusCode::OK, &body),
        Err(e) => {
            warn!(endpoint = %endpoint, error = %e, "plugin request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn error_response(status: StatusCode, err: String) -> HttpResponse {
    json_response(status, &ErrResponse { err })
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> HttpResponse {
    let (status, bytes) = match serde_json::to_vec(body) {
        Ok(bytes) => (status, bytes),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!(r#"{{"Err":"encode response: {}"}}"#, e).into_bytes(),
        ),
    };

    let mut response = Response::new(Full::new(Bytes::from(bytes)));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(protocol::CONTENT_TYPE));
    response
}
