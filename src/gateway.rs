//! Client Gateway Module
//!
//! The proxy's client-facing HTTP surface. Intercepted clients send one
//! `FsRequest` per file operation to `POST /v1/fs`; every operation is
//! answered with HTTP 200 and an `FsReply`, whose error arm carries the
//! errno the client library hands back to the application.

use crate::cache_types::{FileHandle, OpenMode, OpenOptions, SeekOrigin};
use crate::session::FileProxy;
use crate::shutdown::ShutdownSignal;
use crate::transport::{json_response, not_found, read_json, serve, HealthReport, JsonClient};
use crate::wire::{FsOp, FsReply, FsRequest, FsResult, FS_PATH, HEALTH_PATH, STATS_PATH};
use crate::{ProxyError, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpListener;
use tracing::{debug, warn};

/// Serve the gateway for `proxy` on `listener` until `shutdown` fires
pub async fn serve_gateway(listener: TcpListener, proxy: Arc<FileProxy>, shutdown: ShutdownSignal) -> Result<()> {
    let started = SystemTime::now();
    serve(
        listener,
        "file-proxy gateway",
        move |req| handle_request(proxy.clone(), started, req),
        shutdown,
    )
    .await
}

async fn handle_request(proxy: Arc<FileProxy>, started: SystemTime, req: Request<Incoming>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match (&method, path.as_str()) {
        (&Method::POST, FS_PATH) => match read_json::<FsRequest>(req).await {
            Ok(request) => {
                let reply = FsReply::from(execute(&proxy, request).await);
                json_response(StatusCode::OK, &reply)
            }
            Err(e) => {
                warn!("Rejected gateway request: {}", e);
                json_response(StatusCode::BAD_REQUEST, &FsReply::from(Err(e)))
            }
        },
        (&Method::GET, HEALTH_PATH) => json_response(StatusCode::OK, &HealthReport::new("file-proxy", started)),
        (&Method::GET, STATS_PATH) => json_response(StatusCode::OK, &proxy.stats()),
        _ => not_found(&method, &path),
    }
}

/// Run one client operation against `proxy`
pub async fn execute(proxy: &Arc<FileProxy>, request: FsRequest) -> Result<FsResult> {
    let FsRequest { client_id, op } = request;
    debug!("Client {}: {:?}", client_id, op);

    if let FsOp::Done = op {
        let handles = proxy.client_done(&client_id).await;
        return Ok(FsResult::Closed {
            handles: handles as u64,
        });
    }

    let session = proxy.session(&client_id);
    match op {
        FsOp::Open {
            path,
            mode,
            allow_stale,
        } => {
            let handle = session.open(&path, OpenOptions { mode, allow_stale }).await?;
            Ok(FsResult::Handle { handle })
        }
        FsOp::Read { handle, len, offset } => {
            let data = match offset {
                Some(offset) => session.read(handle, offset..offset.saturating_add(len)).await?,
                None => {
                    let len = usize::try_from(len).unwrap_or(usize::MAX);
                    session.read_next(handle, len).await?
                }
            };
            Ok(FsResult::Data { data })
        }
        FsOp::Write { handle, data } => {
            let count = session.write(handle, &data).await?;
            Ok(FsResult::Written { count: count as u64 })
        }
        FsOp::Seek { handle, origin } => {
            let offset = session.seek(handle, origin).await?;
            Ok(FsResult::Offset { offset })
        }
        FsOp::Close { handle } => {
            session.close(handle).await?;
            Ok(FsResult::Ok)
        }
        FsOp::Discard { handle } => {
            session.discard(handle).await?;
            Ok(FsResult::Ok)
        }
        FsOp::Unlink { path } => {
            session.unlink(&path).await?;
            Ok(FsResult::Ok)
        }
        FsOp::Done => Err(ProxyError::InternalError("done handled above".to_string())),
    }
}

/// Client of a proxy gateway, acting as one client id
#[derive(Clone)]
pub struct GatewayClient {
    http: JsonClient,
    client_id: String,
}

impl GatewayClient {
    pub fn new(endpoint: &str, client_id: &str, timeout: Duration) -> Self {
        Self {
            http: JsonClient::new(endpoint, timeout),
            client_id: client_id.to_string(),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Send one operation and unwrap the reply
    pub async fn call(&self, op: FsOp) -> Result<FsResult> {
        let request = FsRequest {
            client_id: self.client_id.clone(),
            op,
        };
        let reply: FsReply = self.http.post(FS_PATH, &request).await?;
        reply.into()
    }

    pub async fn open(&self, path: &str, mode: OpenMode) -> Result<FileHandle> {
        match self
            .call(FsOp::Open {
                path: path.to_string(),
                mode,
                allow_stale: false,
            })
            .await?
        {
            FsResult::Handle { handle } => Ok(handle),
            other => Err(unexpected("open", other)),
        }
    }

    /// Read up to `len` bytes at the handle's cursor
    pub async fn read(&self, handle: FileHandle, len: u64) -> Result<Bytes> {
        match self
            .call(FsOp::Read {
                handle,
                len,
                offset: None,
            })
            .await?
        {
            FsResult::Data { data } => Ok(data),
            other => Err(unexpected("read", other)),
        }
    }

    /// Read the rest of the file in `chunk`-sized requests
    pub async fn read_to_end(&self, handle: FileHandle, chunk: u64) -> Result<Vec<u8>> {
        let mut content = Vec::new();
        loop {
            let data = self.read(handle, chunk).await?;
            if data.is_empty() {
                return Ok(content);
            }
            content.extend_from_slice(&data);
        }
    }

    pub async fn write(&self, handle: FileHandle, data: Bytes) -> Result<u64> {
        match self.call(FsOp::Write { handle, data }).await? {
            FsResult::Written { count } => Ok(count),
            other => Err(unexpected("write", other)),
        }
    }

    pub async fn seek(&self, handle: FileHandle, origin: SeekOrigin) -> Result<u64> {
        match self.call(FsOp::Seek { handle, origin }).await? {
            FsResult::Offset { offset } => Ok(offset),
            other => Err(unexpected("seek", other)),
        }
    }

    pub async fn close(&self, handle: FileHandle) -> Result<()> {
        self.call(FsOp::Close { handle }).await.map(|_| ())
    }

    pub async fn discard(&self, handle: FileHandle) -> Result<()> {
        self.call(FsOp::Discard { handle }).await.map(|_| ())
    }

    pub async fn unlink(&self, path: &str) -> Result<()> {
        self.call(FsOp::Unlink {
            path: path.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn done(&self) -> Result<u64> {
        match self.call(FsOp::Done).await? {
            FsResult::Closed { handles } => Ok(handles),
            other => Err(unexpected("done", other)),
        }
    }

    pub async fn health(&self) -> Result<HealthReport> {
        self.http.get(HEALTH_PATH).await
    }

    pub async fn stats(&self) -> Result<serde_json::Value> {
        self.http.get(STATS_PATH).await
    }
}

fn unexpected(op: &str, result: FsResult) -> ProxyError {
    ProxyError::InternalError(format!("unexpected reply to {}: {:?}", op, result))
}
