//! Bootstrap 服务发现
//!
//! 连接前通过 HTTP API 获取环境签名、账号身份和 Ribbon 端点

use crate::config::ClientConfig;
use crate::error::{Result, RibbonError};
use crate::session::{Endpoint, Environment, Identity};
use crate::transport::build_tls_connector;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, USER_AGENT};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

/// Bootstrap 结果
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapInfo {
    pub environment: Environment,
    pub identity: Identity,
    pub endpoint: Endpoint,
}

/// 服务发现接口
#[async_trait]
pub trait Discovery: Send + Sync {
    async fn environment(&self) -> Result<Environment>;
    async fn identity(&self) -> Result<Identity>;
    async fn endpoint(&self) -> Result<Endpoint>;
}

/// 依次执行三个 bootstrap 请求，非 bot 账号直接失败
pub async fn bootstrap(discovery: &dyn Discovery) -> Result<BootstrapInfo> {
    let environment = discovery.environment().await?;

    let identity = discovery.identity().await?;
    identity.ensure_bot()?;
    info!(
        "[Bootstrap] Logged in as {} ({})",
        identity.username, identity.id
    );

    let endpoint = discovery.endpoint().await?;
    debug!("[Bootstrap] Ribbon endpoint: {}", endpoint.path);

    Ok(BootstrapInfo {
        environment,
        identity,
        endpoint,
    })
}

// ==================== HTTP 实现 ====================

#[derive(Deserialize)]
struct EnvironmentResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    signature: Map<String, Value>,
}

#[derive(Deserialize)]
struct UserResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    user: Option<Identity>,
}

pub struct HttpDiscovery {
    http: reqwest::Client,
    api_url: String,
}

impl HttpDiscovery {
    pub fn new(token: &str, config: &ClientConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| RibbonError::Bootstrap(format!("Invalid token header: {}", e)))?,
        );
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.bot.user_agent())
                .map_err(|e| RibbonError::Bootstrap(format!("Invalid user agent: {}", e)))?,
        );

        // 与 websocket 共用同一套信任根
        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(tls) = build_tls_connector(&config.tls)? {
            builder = builder.use_preconfigured_tls(tls);
        }
        let http = builder
            .build()
            .map_err(|e| RibbonError::Bootstrap(e.to_string()))?;

        Ok(Self {
            http,
            api_url: config.api_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.api_url, path);
        debug!("[Bootstrap] GET {}", url);
        self.http
            .get(&url)
            .send()
            .await
            .map_err(|e| RibbonError::Bootstrap(format!("GET {} failed: {}", path, e)))?
            .json::<T>()
            .await
            .map_err(|e| RibbonError::Bootstrap(format!("Invalid response from {}: {}", path, e)))
    }
}

#[async_trait]
impl Discovery for HttpDiscovery {
    async fn environment(&self) -> Result<Environment> {
        let resp: EnvironmentResponse = self.get("/server/environment").await?;
        if !resp.success {
            return Err(RibbonError::Bootstrap(
                "Failed to get server environment".to_string(),
            ));
        }
        Ok(Environment {
            signature: resp.signature,
        })
    }

    async fn identity(&self) -> Result<Identity> {
        let resp: UserResponse = self.get("/users/me").await?;
        if !resp.success {
            return Err(RibbonError::Bootstrap("Failed to get user data".to_string()));
        }
        resp.user
            .ok_or_else(|| RibbonError::Bootstrap("No user data received".to_string()))
    }

    async fn endpoint(&self) -> Result<Endpoint> {
        self.get("/server/ribbon").await
    }
}

/// 固定返回值的发现实现，用于已知端点或测试
#[derive(Debug, Clone)]
pub struct StaticDiscovery {
    pub info: BootstrapInfo,
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn environment(&self) -> Result<Environment> {
        Ok(self.info.environment.clone())
    }

    async fn identity(&self) -> Result<Identity> {
        Ok(self.info.identity.clone())
    }

    async fn endpoint(&self) -> Result<Endpoint> {
        Ok(self.info.endpoint.clone())
    }
}
