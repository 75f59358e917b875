//! HTTP Transport Module
//!
//! Shared plumbing for the JSON-over-HTTP surfaces: the accept loop used by
//! both servers, response helpers, a health report, and a small JSON client
//! built on the hyper-util connection pool.

use crate::retry::unavailable;
use crate::shutdown::ShutdownSignal;
use crate::{ProxyError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::future::Future;
use std::time::{Duration, SystemTime};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// Largest request body either server accepts
pub const MAX_BODY_BYTES: usize = 256 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
}

/// Body of `GET /health`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub component: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl HealthReport {
    pub fn new(component: &str, started: SystemTime) -> Self {
        let uptime_seconds = SystemTime::now()
            .duration_since(started)
            .unwrap_or_default()
            .as_secs();
        Self {
            status: HealthStatus::Healthy,
            component: component.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds,
            timestamp: Utc::now(),
            message: None,
        }
    }

    pub fn degraded(mut self, message: impl Into<String>) -> Self {
        self.status = HealthStatus::Degraded;
        self.message = Some(message.into());
        self
    }
}

/// Serialize `body` as a JSON response
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(body) {
        Ok(json) => Response::builder()
            .status(status)
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(json)))
            .unwrap_or_else(|e| plain_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())),
        Err(e) => {
            error!("Failed to serialize response body: {}", e);
            plain_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn plain_response(status: StatusCode, message: String) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from(message)));
    *response.status_mut() = status;
    response
}

pub fn not_found(method: &Method, path: &str) -> Response<Full<Bytes>> {
    plain_response(StatusCode::NOT_FOUND, format!("No route for {} {}", method, path))
}

/// Collect and decode a JSON request body
pub async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T> {
    if let Some(length) = req
        .headers()
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
    {
        if length > MAX_BODY_BYTES {
            return Err(ProxyError::InvalidRequest(format!(
                "Request body of {} bytes exceeds the {} byte limit",
                length, MAX_BODY_BYTES
            )));
        }
    }
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| ProxyError::HttpError(format!("Failed to read request body: {}", e)))?
        .to_bytes();
    serde_json::from_slice(&body)
        .map_err(|e| ProxyError::InvalidRequest(format!("Malformed request body: {}", e)))
}

/// Accept HTTP/1 connections on `listener` until `shutdown` fires. Each
/// connection is served on its own task; `handler` maps a request to a response.
pub async fn serve<H, Fut>(
    listener: TcpListener,
    component: &'static str,
    handler: H,
    mut shutdown: ShutdownSignal,
) -> Result<()>
where
    H: Fn(Request<Incoming>) -> Fut + Clone + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    let local_addr = listener.local_addr()?;
    info!("{} listening on http://{}", component, local_addr);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                let (stream, peer) = match accept_result {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("{} failed to accept connection: {}", component, e);
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let handler = handler.clone();

                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let handler = handler.clone();
                        async move { Ok::<_, Infallible>(handler(req).await) }
                    });

                    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("{} connection from {} ended with error: {}", component, peer, e);
                    }
                });
            }
            _ = shutdown.wait_for_shutdown() => {
                info!("{} received shutdown signal, no longer accepting connections", component);
                break;
            }
        }
    }

    Ok(())
}

/// JSON client for one server, reusing pooled connections
#[derive(Clone)]
pub struct JsonClient {
    client: Client<HttpConnector, Full<Bytes>>,
    base_url: String,
    timeout: Duration,
}

impl JsonClient {
    /// `endpoint` is `host:port` or a full `http://` URL
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        let endpoint = endpoint.trim_end_matches('/');
        let base_url = if endpoint.starts_with("http://") {
            endpoint.to_string()
        } else {
            format!("http://{}", endpoint)
        };
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build_http();
        Self {
            client,
            base_url,
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn post<Req, Resp>(&self, path: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        self.post_with_timeout(path, body, self.timeout).await
    }

    pub async fn post_with_timeout<Req, Resp>(&self, path: &str, body: &Req, timeout: Duration) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let json = serde_json::to_vec(body)?;
        let request = Request::builder()
            .method(Method::POST)
            .uri(format!("{}{}", self.base_url, path))
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(json)))
            .map_err(|e| ProxyError::HttpError(format!("Failed to build request: {}", e)))?;
        self.send(request, timeout).await
    }

    pub async fn get<Resp: DeserializeOwned>(&self, path: &str) -> Result<Resp> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(format!("{}{}", self.base_url, path))
            .body(Full::new(Bytes::new()))
            .map_err(|e| ProxyError::HttpError(format!("Failed to build request: {}", e)))?;
        self.send(request, self.timeout).await
    }

    async fn send<Resp: DeserializeOwned>(&self, request: Request<Full<Bytes>>, timeout: Duration) -> Result<Resp> {
        let uri = request.uri().to_string();
        let response = match tokio::time::timeout(timeout, self.client.request(request)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(unavailable(&uri, e)),
            Err(_) => {
                return Err(ProxyError::TimeoutError(format!(
                    "{} did not answer within {:?}",
                    uri, timeout
                )))
            }
        };

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| unavailable(&uri, e))?
            .to_bytes();

        serde_json::from_slice(&body).map_err(|e| {
            if status.is_success() {
                ProxyError::SerializationError(format!("Unexpected reply from {}: {}", uri, e))
            } else {
                ProxyError::HttpError(format!(
                    "{} answered {}: {}",
                    uri,
                    status,
                    String::from_utf8_lossy(&body)
                ))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::ShutdownCoordinator;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Echo {
        text: String,
    }

    async fn echo(req: Request<Incoming>) -> Response<Full<Bytes>> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();
        match (&method, path.as_str()) {
            (&Method::POST, "/echo") => match read_json::<Echo>(req).await {
                Ok(body) => json_response(StatusCode::OK, &body),
                Err(e) => json_response(StatusCode::BAD_REQUEST, &e),
            },
            _ => not_found(&method, &path),
        }
    }

    #[tokio::test]
    async fn test_serve_round_trip_and_shutdown() -> Result<()> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(1));
        let server = tokio::spawn(serve(
            listener,
            "echo",
            echo,
            ShutdownSignal::new(coordinator.subscribe()),
        ));

        let client = JsonClient::new(&addr.to_string(), Duration::from_secs(5));
        let reply: Echo = client
            .post("/echo", &Echo { text: "hello".to_string() })
            .await?;
        assert_eq!(reply.text, "hello");

        let missing: Result<Echo> = client.get("/nowhere").await;
        assert!(matches!(missing, Err(ProxyError::HttpError(_))));

        coordinator.initiate_shutdown().await?;
        server.await.map_err(|e| ProxyError::InternalError(e.to_string()))??;
        Ok(())
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_remote_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = JsonClient::new(&addr.to_string(), Duration::from_secs(2));
        let result: Result<Echo> = client.get("/health").await;
        assert!(matches!(result, Err(ProxyError::RemoteUnavailable(_))));
    }

    #[test]
    fn test_health_report_degraded() {
        let report = HealthReport::new("file-proxy", SystemTime::now()).degraded("remote down");
        assert_eq!(report.status, HealthStatus::Degraded);
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"degraded\""));

        let parsed: HealthReport = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.timestamp, report.timestamp);
        assert!(parsed.timestamp <= Utc::now());
    }
}
