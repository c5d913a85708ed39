//! teto CLI - Ribbon bot 命令行入口

use anyhow::{bail, Result};
use bot_logic::BotService;
use clap::Parser;
use ribbon_client::{
    names, ClientConfig, Endpoint, ReconnectPolicy, TlsConfig, DEFAULT_API_URL, DEFAULT_WS_URL,
};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_GREETING: &str = "Hello there! Enjoy the game, but please keep it under 1.25 pps!";

/// teto Ribbon bot
#[derive(Parser, Debug)]
#[command(name = "teto")]
#[command(version, about = "Ribbon bot client that joins a room and relays chat")]
struct Args {
    /// Bot account token
    #[arg(short, long, env = "RIBBON_TOKEN", hide_env_values = true)]
    token: String,

    /// Room ID to join (prompted if omitted)
    #[arg(short, long)]
    room: Option<String>,

    /// Message sent when a player joins the room
    #[arg(long, default_value = DEFAULT_GREETING)]
    greeting: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// HTTP API base URL
    #[arg(long, env = "RIBBON_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Websocket base URL
    #[arg(long, env = "RIBBON_WS_URL", default_value = DEFAULT_WS_URL)]
    ws_url: String,

    /// Ribbon endpoint path, skips bootstrap discovery when set
    #[arg(long)]
    endpoint: Option<String>,

    /// Keepalive interval in milliseconds
    #[arg(long, default_value = "2000")]
    ping_interval_ms: u64,

    /// Reconnect attempts after a dropped connection (0 = exit on drop)
    #[arg(long, default_value = "5")]
    max_retries: u32,

    /// Extra trusted root certificate (PEM or DER), repeatable
    #[arg(long = "ca-cert", env = "RIBBON_CA_CERT")]
    ca_certs: Vec<PathBuf>,

    /// Skip TLS certificate verification (local servers only)
    #[arg(long, default_value = "false")]
    insecure: bool,
}

/// 从标准输入读取房间 ID
async fn prompt_room() -> Result<String> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"Enter room ID to join: ").await?;
    stdout.flush().await?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
    Ok(line.trim().to_string())
}

fn str_field<'a>(data: &'a Value, pointer: &str) -> &'a str {
    data.pointer(pointer).and_then(Value::as_str).unwrap_or("?")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let room = match args.room {
        Some(room) => room,
        None => prompt_room().await?,
    };
    if room.is_empty() {
        bail!("Room ID is required");
    }

    info!("Starting teto...");

    let config = ClientConfig {
        api_url: args.api_url,
        ws_url: args.ws_url,
        ping_interval: Duration::from_millis(args.ping_interval_ms),
        reconnect: ReconnectPolicy {
            max_retries: args.max_retries,
            ..ReconnectPolicy::default()
        },
        tls: TlsConfig {
            extra_roots: args.ca_certs,
            accept_invalid_certs: args.insecure,
        },
        ..ClientConfig::default()
    };

    let service = BotService::new(&args.token, config)?;
    let client = service.client();

    client.subscribe(names::ROOM_CHAT_RECEIVED, |data: &Value| {
        info!(
            "[Chat] {}: {}",
            str_field(data, "/user/username"),
            str_field(data, "/content")
        );
    });
    client.subscribe(names::SOCIAL_DM_RECEIVED, |data: &Value| {
        info!("[DM] {}: {}", str_field(data, "/user"), str_field(data, "/content"));
    });
    client.subscribe(names::SOCIAL_INVITE_RECEIVED, |data: &Value| {
        info!("[Invite] {}", data);
    });
    service.join_on_ready(&room);
    service.greet_on_join(&args.greeting);

    // 启动服务
    service.start(args.endpoint.map(Endpoint::new)).await?;
    info!("teto running in room {}. Press Ctrl+C to stop.", room.to_uppercase());

    // 等待 Ctrl+C 或连接终止
    tokio::select! {
        result = signal::ctrl_c() => {
            result?;
            info!("Received Ctrl+C, shutting down...");
        }
        result = service.run() => {
            if let Err(e) = result {
                error!("{:#}", e);
                return Err(e);
            }
            info!("Connection closed");
            return Ok(());
        }
    }

    if tokio::time::timeout(Duration::from_secs(5), service.stop())
        .await
        .is_err()
    {
        error!("Shutdown timed out");
    }

    info!("teto stopped");
    Ok(())
}
