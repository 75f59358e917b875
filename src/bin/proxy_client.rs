//! Test driver that plays an intercepted client against a running proxy.
//!
//! `read` prints the file to stdout and `write` writes stdin (or `--data`)
//! over the start of the file, creating it if needed. `unlink` removes it.
//! `--delay-ms` keeps the file open that long before the transfer, which is
//! how the slow-reader and slow-writer scenarios hold a version pinned while
//! other clients work.

use bytes::Bytes;
use clap::{value_parser, Arg, ArgMatches, Command};
use file_proxy::{
    cache_types::OpenMode,
    gateway::GatewayClient,
    retry::{retry_recoverable, RetryConfig},
    ProxyError, Result,
};
use std::io::{Read, Write};
use std::time::Duration;

const READ_CHUNK: u64 = 64 * 1024;

fn build_cli() -> Command {
    let file_arg = || Arg::new("file").required(true).help("File name relative to the store root");

    Command::new("proxy-client")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Drive read, write and unlink operations through a file proxy")
        .subcommand_required(true)
        .arg(
            Arg::new("host")
                .long("host")
                .default_value("127.0.0.1")
                .global(true)
                .help("Proxy host"),
        )
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .value_parser(value_parser!(u16))
                .global(true)
                .help("Proxy gateway port (default: $PROXY_PORT, then 4041)"),
        )
        .arg(
            Arg::new("client-id")
                .long("client-id")
                .global(true)
                .help("Client id presented to the proxy (default: $PROXY_CLIENT_ID, then proxy-client-<pid>)"),
        )
        .arg(
            Arg::new("delay-ms")
                .long("delay-ms")
                .default_value("0")
                .value_parser(value_parser!(u64))
                .global(true)
                .help("Hold the file open this long before reading or writing"),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .default_value("120")
                .value_parser(value_parser!(u64))
                .global(true)
                .help("Per-request timeout in seconds"),
        )
        .subcommand(Command::new("read").about("Print a file").arg(file_arg()))
        .subcommand(
            Command::new("write")
                .about("Write stdin into a file")
                .arg(file_arg())
                .arg(Arg::new("data").long("data").help("Write this text instead of stdin")),
        )
        .subcommand(Command::new("unlink").about("Remove a file").arg(file_arg()))
}

#[tokio::main]
async fn main() {
    let matches = build_cli().get_matches();
    if let Err(e) = run(&matches).await {
        eprintln!("proxy-client: {} (errno {})", e, e.errno());
        std::process::exit(1);
    }
}

async fn run(matches: &ArgMatches) -> Result<()> {
    let host = matches
        .get_one::<String>("host")
        .cloned()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = match matches.get_one::<u16>("port") {
        Some(port) => *port,
        None => match std::env::var("PROXY_PORT") {
            Ok(value) => value
                .parse()
                .map_err(|e| ProxyError::ConfigError(format!("Invalid PROXY_PORT '{}': {}", value, e)))?,
            Err(_) => 4041,
        },
    };
    let client_id = matches
        .get_one::<String>("client-id")
        .cloned()
        .or_else(|| std::env::var("PROXY_CLIENT_ID").ok())
        .unwrap_or_else(|| format!("proxy-client-{}", std::process::id()));
    let delay = Duration::from_millis(matches.get_one::<u64>("delay-ms").copied().unwrap_or(0));
    let timeout = Duration::from_secs(matches.get_one::<u64>("timeout").copied().unwrap_or(120));

    let client = GatewayClient::new(&format!("{}:{}", host, port), &client_id, timeout);
    let retry = RetryConfig::default();

    let result = match matches.subcommand() {
        Some(("read", sub)) => read_file(&client, &retry, file_name(sub)?, delay).await,
        Some(("write", sub)) => {
            let data = match sub.get_one::<String>("data") {
                Some(text) => Bytes::from(text.clone()),
                None => {
                    let mut buffer = Vec::new();
                    std::io::stdin().read_to_end(&mut buffer)?;
                    Bytes::from(buffer)
                }
            };
            write_file(&client, &retry, file_name(sub)?, data, delay).await
        }
        Some(("unlink", sub)) => {
            let name = file_name(sub)?;
            retry_recoverable(&retry, "unlink", || client.unlink(name)).await
        }
        _ => Err(ProxyError::InvalidRequest("unknown command".to_string())),
    };

    // Release anything a failed operation left open
    if let Err(e) = client.done().await {
        if result.is_ok() {
            return Err(e);
        }
    }
    result
}

fn file_name(matches: &ArgMatches) -> Result<&str> {
    matches
        .get_one::<String>("file")
        .map(String::as_str)
        .ok_or_else(|| ProxyError::InvalidRequest("missing file argument".to_string()))
}

async fn read_file(client: &GatewayClient, retry: &RetryConfig, name: &str, delay: Duration) -> Result<()> {
    let handle = retry_recoverable(retry, "open for read", || client.open(name, OpenMode::Read)).await?;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    let content = client.read_to_end(handle, READ_CHUNK).await?;
    client.close(handle).await?;

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&content)?;
    stdout.flush()?;
    Ok(())
}

async fn write_file(
    client: &GatewayClient,
    retry: &RetryConfig,
    name: &str,
    data: Bytes,
    delay: Duration,
) -> Result<()> {
    let handle = retry_recoverable(retry, "open for write", || client.open(name, OpenMode::Create)).await?;
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
    client.write(handle, data).await?;
    // Commit failures leave the handle open; retry the close before giving up
    retry_recoverable(retry, "close", || client.close(handle)).await
}
