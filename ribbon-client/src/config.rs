//! 客户端配置

use crate::session::Handling;
use std::path::PathBuf;
use std::time::Duration;

/// 默认 HTTP API 地址
pub const DEFAULT_API_URL: &str = "https://tetr.io/api";
/// 默认 websocket 地址
pub const DEFAULT_WS_URL: &str = "wss://tetr.io";
/// 默认心跳间隔
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(2);

/// TLS 设置
///
/// 默认只用系统信任库；自建或测试服务器可追加根证书。
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// 额外信任的根证书（PEM 或 DER）
    pub extra_roots: Vec<PathBuf>,
    /// 跳过证书校验，仅限本地调试
    pub accept_invalid_certs: bool,
}

impl TlsConfig {
    /// 从 `RIBBON_CA_CERT` 读取额外根证书
    pub fn from_env() -> Self {
        Self {
            extra_roots: std::env::var_os("RIBBON_CA_CERT")
                .map(PathBuf::from)
                .into_iter()
                .collect(),
            accept_invalid_certs: false,
        }
    }

    /// 没有任何定制时使用 tungstenite 默认连接器
    pub fn is_default(&self) -> bool {
        self.extra_roots.is_empty() && !self.accept_invalid_certs
    }
}

/// Bot 信息，用于拼接 User-Agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotInfo {
    pub name: String,
    pub version: String,
    pub site_url: String,
}

impl Default for BotInfo {
    fn default() -> Self {
        Self {
            name: "twitchlink".to_string(),
            version: "1.0.0".to_string(),
            site_url: "https://ch.tetr.io/u/twitchlink".to_string(),
        }
    }
}

impl BotInfo {
    pub fn user_agent(&self) -> String {
        format!(
            "Mozilla/5.0 AppleWebKit/537.36 (KHTML, like Gecko; compatible; {}/{}; +{}) tetrio-botclient/129.0.0.0 Safari/537.36",
            self.name, self.version, self.site_url
        )
    }
}

/// 断线重连策略（指数退避）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// 最大重试次数，0 表示断线即终止
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// 第 `attempt` 次重试前的等待时间（从 0 开始）
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Ribbon 客户端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// HTTP API 地址（bootstrap 用）
    pub api_url: String,
    /// websocket 基础地址，端点路径拼在其后
    pub ws_url: String,
    pub bot: BotInfo,
    pub handling: Handling,
    /// 心跳间隔
    pub ping_interval: Duration,
    pub tls: TlsConfig,
    pub reconnect: ReconnectPolicy,
    /// close() 等待后台任务退出的时间
    pub shutdown_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        // 从环境变量读取配置
        let api_url = std::env::var("RIBBON_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let ws_url = std::env::var("RIBBON_WS_URL").unwrap_or_else(|_| DEFAULT_WS_URL.to_string());
        let ping_interval = std::env::var("RIBBON_PING_INTERVAL_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_PING_INTERVAL);

        Self {
            api_url,
            ws_url,
            bot: BotInfo::default(),
            handling: Handling::default(),
            ping_interval,
            tls: TlsConfig::from_env(),
            reconnect: ReconnectPolicy::default(),
            shutdown_timeout: Duration::from_secs(1),
        }
    }
}
