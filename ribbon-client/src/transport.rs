//! 传输层
//!
//! 一个 [`Transport`] 对应一条到单个端点的双向文本帧连接；
//! [`Connector`] 负责按 URL 打开新连接（迁移时会用到）。

use crate::config::{ClientConfig, TlsConfig};
use crate::error::{Result, RibbonError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use native_tls::{Certificate, TlsConnector};
use std::fs;
use std::path::Path;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION, USER_AGENT};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

/// 双向文本帧连接
#[async_trait]
pub trait Transport: Send {
    /// 发送一个完整的文本帧
    async fn send(&mut self, text: String) -> Result<()>;

    /// 接收下一个文本帧，连接关闭时返回 `None`
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn close(&mut self) -> Result<()>;
}

/// 按 URL 打开 [`Transport`]
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>>;
}

// ==================== WebSocket 实现 ====================

pub struct WebSocketTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| RibbonError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String>> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => return Some(Ok(text.as_str().to_owned())),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => warn!("[Transport] Dropping non UTF-8 binary frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!("[Transport] Close frame received: {:?}", frame);
                    return None;
                }
                // Ping/Pong 由 tungstenite 在读写时自动应答
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Some(Err(RibbonError::Transport(e.to_string()))),
                None => return None,
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed) | Err(tungstenite::Error::AlreadyClosed) => {
                Ok(())
            }
            Err(e) => Err(RibbonError::Transport(e.to_string())),
        }
    }
}

/// WebSocket 连接器，升级请求带 Bearer token 和 User-Agent
pub struct WebSocketConnector {
    authorization: HeaderValue,
    user_agent: HeaderValue,
    tls: Option<TlsConnector>,
}

impl WebSocketConnector {
    pub fn new(token: &str, config: &ClientConfig) -> Result<Self> {
        let authorization = HeaderValue::from_str(&format!("Bearer {}", token))
            .map_err(|e| RibbonError::ConnectionFailed(format!("Invalid token header: {}", e)))?;
        let user_agent = HeaderValue::from_str(&config.bot.user_agent())
            .map_err(|e| RibbonError::ConnectionFailed(format!("Invalid user agent: {}", e)))?;

        Ok(Self {
            authorization,
            user_agent,
            tls: build_tls_connector(&config.tls)?,
        })
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn Transport>> {
        info!("[Transport] Connecting to {}", url);

        let mut request = url
            .into_client_request()
            .map_err(|e| RibbonError::InvalidUrl(format!("{}: {}", url, e)))?;
        let headers = request.headers_mut();
        headers.insert(AUTHORIZATION, self.authorization.clone());
        headers.insert(USER_AGENT, self.user_agent.clone());

        let connector = self.tls.clone().map(tokio_tungstenite::Connector::NativeTls);
        let (stream, _) =
            tokio_tungstenite::connect_async_tls_with_config(request, None, false, connector)
                .await
                .map_err(|e| RibbonError::ConnectionFailed(e.to_string()))?;

        info!("[Transport] Connected to {}", url);
        Ok(Box::new(WebSocketTransport { stream }))
    }
}

/// 按 [`TlsConfig`] 构建 native-tls 连接器，无定制时返回 None
pub fn build_tls_connector(tls: &TlsConfig) -> Result<Option<TlsConnector>> {
    if tls.is_default() {
        return Ok(None);
    }

    let mut builder = TlsConnector::builder();
    for path in &tls.extra_roots {
        builder.add_root_certificate(load_root(path)?);
        debug!("[Transport] Trusting extra root {}", path.display());
    }
    if tls.accept_invalid_certs {
        warn!("[Transport] Certificate verification disabled, do not use against tetr.io");
        builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map(Some)
        .map_err(|e| RibbonError::TlsError(format!("Failed to build TLS connector: {}", e)))
}

fn load_root(path: &Path) -> Result<Certificate> {
    let bytes = fs::read(path)
        .map_err(|e| RibbonError::TlsError(format!("Cannot read {}: {}", path.display(), e)))?;
    Certificate::from_pem(&bytes)
        .or_else(|_| Certificate::from_der(&bytes))
        .map_err(|e| RibbonError::TlsError(format!("Invalid certificate {}: {}", path.display(), e)))
}
