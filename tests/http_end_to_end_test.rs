//! Full stack over loopback HTTP: file server RPC, two proxies with
//! long-polled invalidations, and clients talking to each proxy's gateway.

use bytes::Bytes;
use file_proxy::cache_types::{OpenMode, SeekOrigin};
use file_proxy::config::{Config, LeaseConfig, ServerConfig};
use file_proxy::file_server::FileServer;
use file_proxy::gateway::{serve_gateway, GatewayClient};
use file_proxy::remote_http::{HttpRemoteStore, RemoteStoreService};
use file_proxy::retry::RetryConfig;
use file_proxy::session::FileProxy;
use file_proxy::shutdown::{ShutdownCoordinator, ShutdownSignal};
use file_proxy::transport::HealthStatus;
use file_proxy::{ProxyError, Result};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;

struct Stack {
    server: Arc<FileServer>,
    gateways: Vec<String>,
    coordinator: ShutdownCoordinator,
    _root: TempDir,
}

async fn start_stack(proxies: usize) -> Result<Stack> {
    let root = TempDir::new()?;
    std::fs::write(root.path().join("seeded.txt"), b"from disk")?;

    let server_config = ServerConfig {
        root_dir: Some(root.path().to_path_buf()),
        leases: LeaseConfig {
            lease_wait_timeout: Duration::from_secs(5),
            ..Default::default()
        },
        ..Default::default()
    };
    let server = Arc::new(FileServer::open(&server_config)?);
    let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));

    let rpc_listener = TcpListener::bind("127.0.0.1:0").await?;
    let rpc_endpoint = rpc_listener.local_addr()?.to_string();
    tokio::spawn(
        RemoteStoreService::new(server.clone())
            .serve(rpc_listener, ShutdownSignal::new(coordinator.subscribe())),
    );

    let mut gateways = Vec::new();
    for i in 0..proxies {
        let mut config = Config::default();
        config.proxy.proxy_id = format!("proxy-{}", i);
        config.remote.endpoint = rpc_endpoint.clone();
        config.remote.poll_wait = Duration::from_millis(500);
        config.remote.request_timeout = Duration::from_secs(10);
        config.remote.retry = RetryConfig::new(2, Duration::from_millis(10), Duration::from_millis(100), 0.0);

        let remote = Arc::new(HttpRemoteStore::new(config.proxy.proxy_id.clone(), &config.remote));
        let proxy = FileProxy::start(remote, &config).await?;

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        gateways.push(listener.local_addr()?.to_string());
        tokio::spawn(serve_gateway(
            listener,
            proxy,
            ShutdownSignal::new(coordinator.subscribe()),
        ));
    }

    Ok(Stack {
        server,
        gateways,
        coordinator,
        _root: root,
    })
}

fn client(stack: &Stack, proxy: usize, client_id: &str) -> GatewayClient {
    GatewayClient::new(&stack.gateways[proxy], client_id, Duration::from_secs(20))
}

async fn read_all(client: &GatewayClient, name: &str) -> Result<Vec<u8>> {
    let fd = client.open(name, OpenMode::Read).await?;
    let content = client.read_to_end(fd, 4).await?;
    client.close(fd).await?;
    Ok(content)
}

async fn write_all(client: &GatewayClient, name: &str, content: &str) -> Result<()> {
    let fd = client.open(name, OpenMode::Create).await?;
    client.write(fd, Bytes::from(content.to_string())).await?;
    client.close(fd).await
}

#[tokio::test]
async fn test_seeded_file_reads_through_proxy() -> Result<()> {
    let stack = start_stack(1).await?;
    let c1 = client(&stack, 0, "c1");

    assert_eq!(read_all(&c1, "seeded.txt").await?, b"from disk".to_vec());
    assert_eq!(c1.health().await?.status, HealthStatus::Healthy);
    Ok(())
}

#[tokio::test]
async fn test_write_on_one_proxy_is_read_on_the_other() -> Result<()> {
    let stack = start_stack(2).await?;
    let c1 = client(&stack, 0, "c1");
    let c2 = client(&stack, 1, "c2");

    write_all(&c2, "F", "version one").await?;
    assert_eq!(read_all(&c1, "F").await?, b"version one".to_vec());

    // c1's proxy holds a read lease on F; the write waits for its acknowledgement
    write_all(&c2, "F", "version two").await?;
    assert_eq!(read_all(&c1, "F").await?, b"version two".to_vec());

    let stats = c1.stats().await?;
    assert!(stats["consistency"]["invalidations_received"].as_u64().unwrap_or(0) >= 1);
    assert_eq!(stack.server.fetch("F")?.content, Bytes::from("version two"));
    Ok(())
}

#[tokio::test]
async fn test_errno_and_handle_semantics_over_http() -> Result<()> {
    let stack = start_stack(1).await?;
    let c1 = client(&stack, 0, "c1");

    let result = c1.open("nope", OpenMode::Read).await;
    assert!(matches!(result, Err(ProxyError::NotFound(_))));

    let fd = c1.open("E", OpenMode::CreateNew).await?;
    assert_eq!(fd, 0);
    c1.write(fd, Bytes::from("abcdef")).await?;
    assert_eq!(c1.seek(fd, SeekOrigin::Start(2)).await?, 2);
    c1.write(fd, Bytes::from("XY")).await?;
    c1.close(fd).await?;

    let again = c1.open("E", OpenMode::CreateNew).await;
    assert!(matches!(again, Err(ProxyError::AlreadyExists(_))));
    assert_eq!(read_all(&c1, "E").await?, b"abXYef".to_vec());

    c1.unlink("E").await?;
    assert_eq!(stack.server.stat("E"), None);
    Ok(())
}

#[tokio::test]
async fn test_done_commits_open_writes() -> Result<()> {
    let stack = start_stack(1).await?;
    let c1 = client(&stack, 0, "c1");

    let fd = c1.open("journal", OpenMode::Create).await?;
    c1.write(fd, Bytes::from("unclosed")).await?;
    assert_eq!(c1.done().await?, 1);
    assert_eq!(stack.server.fetch("journal")?.content, Bytes::from("unclosed"));

    stack.coordinator.initiate_shutdown().await?;
    Ok(())
}
