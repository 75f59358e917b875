//! HTTP Remote Store Module
//!
//! Carries the `RemoteStore` operations over `POST /v1/rpc`.
//!
//! `HttpRemoteStore` is the proxy side. Idempotent calls are retried on
//! transport failures; commits and removals are sent once. Invalidations
//! arrive through a background long-poll task that acknowledges each batch
//! on its next poll.
//!
//! `RemoteStoreService` is the file server side, dispatching each call to a
//! shared `FileServer`.

use crate::cache_types::{LeaseGrant, LeaseMode, ProxyId, RemoteFile, Version};
use crate::config::RemoteConfig;
use crate::file_server::FileServer;
use crate::remote_store::{InvalidationListener, RemoteStore};
use crate::retry::{is_transport_failure, retry_if, RetryConfig};
use crate::shutdown::ShutdownSignal;
use crate::transport::{json_response, not_found, read_json, serve, HealthReport, JsonClient};
use crate::wire::{RpcCall, RpcReply, RpcRequest, RpcValue, HEALTH_PATH, RPC_PATH, STATS_PATH};
use crate::{ProxyError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, SystemTime};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Longest long-poll the server will park a request for
const MAX_POLL_WAIT: Duration = Duration::from_secs(120);

/// `RemoteStore` backed by a file server reached over HTTP
pub struct HttpRemoteStore {
    proxy_id: ProxyId,
    http: JsonClient,
    retry: RetryConfig,
    poll_wait: Duration,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl HttpRemoteStore {
    pub fn new(proxy_id: impl Into<ProxyId>, config: &RemoteConfig) -> Self {
        Self {
            proxy_id: proxy_id.into(),
            http: JsonClient::new(&config.endpoint, config.request_timeout),
            retry: config.retry.clone(),
            poll_wait: config.poll_wait,
            poller: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.http.base_url()
    }

    async fn call(&self, call: RpcCall) -> Result<RpcValue> {
        let request = RpcRequest {
            proxy_id: self.proxy_id.clone(),
            call,
        };
        if request.call.is_idempotent() {
            let what = format!("{} to {}", rpc_name(&request.call), self.http.base_url());
            retry_if(&self.retry, &what, is_transport_failure, || {
                send_rpc(&self.http, &request, self.http.timeout())
            })
            .await
        } else {
            send_rpc(&self.http, &request, self.http.timeout()).await
        }
    }

    /// Drop this proxy's leases and mailbox on the server
    pub async fn disconnect(&self) -> Result<()> {
        self.stop_poller();
        self.call(RpcCall::Disconnect).await.map(|_| ())
    }

    fn stop_poller(&self) {
        let handle = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

impl Drop for HttpRemoteStore {
    fn drop(&mut self) {
        self.stop_poller();
    }
}

async fn send_rpc(http: &JsonClient, request: &RpcRequest, timeout: Duration) -> Result<RpcValue> {
    let reply: RpcReply = http.post_with_timeout(RPC_PATH, request, timeout).await?;
    reply
}

fn rpc_name(call: &RpcCall) -> &'static str {
    match call {
        RpcCall::Fetch { .. } => "fetch",
        RpcCall::Stat { .. } => "stat",
        RpcCall::Commit { .. } => "commit",
        RpcCall::RequestLease { .. } => "request_lease",
        RpcCall::ReleaseLease { .. } => "release_lease",
        RpcCall::Remove { .. } => "remove",
        RpcCall::Register => "register",
        RpcCall::PollInvalidations { .. } => "poll_invalidations",
        RpcCall::Disconnect => "disconnect",
    }
}

fn unexpected(call: &str, value: RpcValue) -> ProxyError {
    ProxyError::InternalError(format!("unexpected reply to {}: {:?}", call, value))
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    fn proxy_id(&self) -> &str {
        &self.proxy_id
    }

    async fn fetch(&self, name: &str) -> Result<RemoteFile> {
        match self.call(RpcCall::Fetch { name: name.to_string() }).await? {
            RpcValue::File(file) => Ok(file),
            other => Err(unexpected("fetch", other)),
        }
    }

    async fn stat(&self, name: &str) -> Result<Option<Version>> {
        match self.call(RpcCall::Stat { name: name.to_string() }).await? {
            RpcValue::Version(version) => Ok(version),
            other => Err(unexpected("stat", other)),
        }
    }

    async fn commit(&self, name: &str, content: Bytes, expected: Version) -> Result<Version> {
        let call = RpcCall::Commit {
            name: name.to_string(),
            content,
            expected,
        };
        match self.call(call).await? {
            RpcValue::Committed(version) => Ok(version),
            other => Err(unexpected("commit", other)),
        }
    }

    async fn request_lease(&self, name: &str, mode: LeaseMode) -> Result<LeaseGrant> {
        let call = RpcCall::RequestLease {
            name: name.to_string(),
            mode,
        };
        match self.call(call).await? {
            RpcValue::Lease(grant) => Ok(grant),
            other => Err(unexpected("request_lease", other)),
        }
    }

    async fn release_lease(&self, name: &str) -> Result<()> {
        self.call(RpcCall::ReleaseLease { name: name.to_string() })
            .await
            .map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.call(RpcCall::Remove { name: name.to_string() })
            .await
            .map(|_| ())
    }

    async fn subscribe(&self, listener: Arc<dyn InvalidationListener>) -> Result<()> {
        self.call(RpcCall::Register).await?;

        let poller = InvalidationPoller {
            proxy_id: self.proxy_id.clone(),
            http: self.http.clone(),
            retry: self.retry.clone(),
            wait: self.poll_wait.min(MAX_POLL_WAIT),
            listener: Arc::downgrade(&listener),
        };
        drop(listener);
        let handle = tokio::spawn(poller.run());

        let previous = self
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        info!("Proxy {} subscribed to invalidations from {}", self.proxy_id, self.http.base_url());
        Ok(())
    }
}

/// Long-polls the server for invalidations until the listener goes away
struct InvalidationPoller {
    proxy_id: ProxyId,
    http: JsonClient,
    retry: RetryConfig,
    wait: Duration,
    listener: Weak<dyn InvalidationListener>,
}

impl InvalidationPoller {
    async fn run(self) {
        let mut acks: Vec<u64> = Vec::new();
        let mut failures: u32 = 0;
        let timeout = self.wait + self.http.timeout();

        while self.listener.strong_count() > 0 {
            let request = RpcRequest {
                proxy_id: self.proxy_id.clone(),
                call: RpcCall::PollInvalidations {
                    acks: acks.clone(),
                    wait_ms: self.wait.as_millis() as u64,
                },
            };

            match send_rpc(&self.http, &request, timeout).await {
                Ok(RpcValue::Invalidations(batch)) => {
                    failures = 0;
                    let Some(listener) = self.listener.upgrade() else {
                        break;
                    };
                    for invalidation in &batch {
                        listener.invalidate(&invalidation.name);
                    }
                    acks = batch.iter().map(|i| i.seq).collect();
                    if !batch.is_empty() {
                        debug!("Applied {} invalidations", batch.len());
                    }
                }
                Ok(other) => {
                    warn!("Unexpected reply to invalidation poll: {:?}", other);
                }
                Err(ProxyError::InvalidRequest(e)) => {
                    // Server lost the mailbox (restart or disconnect)
                    warn!("Invalidation poll rejected ({}), registering again", e);
                    acks.clear();
                    let register = RpcRequest {
                        proxy_id: self.proxy_id.clone(),
                        call: RpcCall::Register,
                    };
                    if let Err(e) = send_rpc(&self.http, &register, self.http.timeout()).await {
                        failures += 1;
                        warn!("Re-registration failed: {}", e);
                        tokio::time::sleep(self.retry.calculate_backoff(failures.min(16))).await;
                    }
                }
                Err(e) => {
                    failures += 1;
                    let backoff = self.retry.calculate_backoff(failures.min(16));
                    warn!(
                        "Invalidation poll failed ({} in a row): {}; retrying in {:?}",
                        failures, e, backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
        debug!("Invalidation poller for {} stopped", self.proxy_id);
    }
}

/// File server side of the RPC surface
#[derive(Clone)]
pub struct RemoteStoreService {
    server: Arc<FileServer>,
    started: SystemTime,
}

impl RemoteStoreService {
    pub fn new(server: Arc<FileServer>) -> Self {
        Self {
            server,
            started: SystemTime::now(),
        }
    }

    pub fn server(&self) -> &Arc<FileServer> {
        &self.server
    }

    /// Serve on `listener` until `shutdown` fires
    pub async fn serve(self, listener: TcpListener, shutdown: ShutdownSignal) -> Result<()> {
        serve(
            listener,
            "file-server",
            move |req| {
                let service = self.clone();
                async move { service.handle_request(req).await }
            },
            shutdown,
        )
        .await
    }

    async fn handle_request(&self, req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match (&method, path.as_str()) {
            (&Method::POST, RPC_PATH) => match read_json::<RpcRequest>(req).await {
                Ok(request) => json_response(StatusCode::OK, &self.dispatch(request).await),
                Err(e) => {
                    warn!("Rejected RPC request: {}", e);
                    let reply: RpcReply = Err(e);
                    json_response(StatusCode::BAD_REQUEST, &reply)
                }
            },
            (&Method::GET, HEALTH_PATH) => {
                json_response(StatusCode::OK, &HealthReport::new("file-server", self.started))
            }
            (&Method::GET, STATS_PATH) => json_response(StatusCode::OK, &self.server.stats()),
            _ => not_found(&method, &path),
        }
    }

    /// Run one RPC against the file server
    pub async fn dispatch(&self, request: RpcRequest) -> RpcReply {
        let server = &self.server;
        let proxy = request.proxy_id.as_str();
        if proxy.is_empty() {
            return Err(ProxyError::InvalidRequest("missing proxy_id".to_string()));
        }

        match request.call {
            RpcCall::Fetch { name } => server.fetch(&name).map(RpcValue::File),
            RpcCall::Stat { name } => Ok(RpcValue::Version(server.stat(&name))),
            RpcCall::Commit {
                name,
                content,
                expected,
            } => server
                .commit(proxy, &name, content, expected)
                .await
                .map(RpcValue::Committed),
            RpcCall::RequestLease { name, mode } => server
                .request_lease(proxy, &name, mode)
                .await
                .map(RpcValue::Lease),
            RpcCall::ReleaseLease { name } => {
                server.release_lease(proxy, &name);
                Ok(RpcValue::Done)
            }
            RpcCall::Remove { name } => server.remove(proxy, &name).await.map(|_| RpcValue::Done),
            RpcCall::Register => {
                server.register_queued(proxy);
                Ok(RpcValue::Done)
            }
            RpcCall::PollInvalidations { acks, wait_ms } => {
                let wait = Duration::from_millis(wait_ms).min(MAX_POLL_WAIT);
                server
                    .poll_invalidations(proxy, &acks, wait)
                    .await
                    .map(RpcValue::Invalidations)
            }
            RpcCall::Disconnect => {
                server.disconnect(proxy);
                Ok(RpcValue::Done)
            }
        }
    }
}
