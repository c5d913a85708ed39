//! 会话状态与数据模型
//!
//! 会话标识、最后收到的消息 ID、连接端点以及 bootstrap 得到的环境/身份信息

use crate::error::{Result, RibbonError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

// ==================== 连接状态 ====================

/// 连接状态机
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingSession,
    Authorizing,
    Ready,
    Migrating,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingSession => "awaiting_session",
            ConnectionState::Authorizing => "authorizing",
            ConnectionState::Ready => "ready",
            ConnectionState::Migrating => "migrating",
            ConnectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ==================== 会话 ====================

/// 会话快照（只读）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub ribbon_id: String,
    pub token_id: String,
    pub last_received: Option<String>,
    /// 服务端是否已接受过 server.authorize
    pub authorized: bool,
}

/// 会话状态
///
/// `ribbon_id` / `token_id` 每个逻辑会话只写入一次；
/// `last_received` 只由接收循环写入、由心跳任务读取。
/// 只有授权成功过的会话才能用 `session` 恢复。
pub(crate) struct SessionState {
    ids: RwLock<(String, String)>,
    authorized: AtomicBool,
    last_received: watch::Sender<Option<String>>,
}

impl SessionState {
    pub(crate) fn new() -> Self {
        let (last_received, _) = watch::channel(None);
        Self {
            ids: RwLock::new((String::new(), String::new())),
            authorized: AtomicBool::new(false),
            last_received,
        }
    }

    /// 尚未拿到 token 的新会话
    pub(crate) fn is_fresh(&self) -> bool {
        self.ids.read().1.is_empty()
    }

    /// 写入服务端分配的会话标识，已有 token 时不覆盖
    pub(crate) fn assign(&self, ribbon_id: &str, token_id: &str) -> bool {
        let mut ids = self.ids.write();
        if !ids.1.is_empty() {
            return false;
        }
        *ids = (ribbon_id.to_string(), token_id.to_string());
        true
    }

    pub(crate) fn mark_authorized(&self) {
        self.authorized.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_authorized(&self) -> bool {
        self.authorized.load(Ordering::SeqCst)
    }

    /// 已授权且持有 token，可在新连接上用 `session` 恢复
    pub(crate) fn is_resumable(&self) -> bool {
        self.is_authorized() && !self.is_fresh()
    }

    /// 丢弃未完成授权的会话标识，下次握手重新发 `new`
    pub(crate) fn reset(&self) {
        *self.ids.write() = (String::new(), String::new());
        self.authorized.store(false, Ordering::SeqCst);
    }

    pub(crate) fn ids(&self) -> (String, String) {
        self.ids.read().clone()
    }

    pub(crate) fn record_received(&self, id: String) {
        self.last_received.send_replace(Some(id));
    }

    pub(crate) fn last_received(&self) -> Option<String> {
        self.last_received.borrow().clone()
    }

    pub(crate) fn watch_last_received(&self) -> watch::Receiver<Option<String>> {
        self.last_received.subscribe()
    }

    pub(crate) fn snapshot(&self) -> Session {
        let (ribbon_id, token_id) = self.ids();
        Session {
            ribbon_id,
            token_id,
            last_received: self.last_received(),
            authorized: self.is_authorized(),
        }
    }
}

// ==================== 端点 ====================

/// 备用主机（spool），共享同一个访问 token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spool {
    pub name: String,
    pub host: String,
    pub flag: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpoolData {
    pub token: String,
    #[serde(default)]
    pub spools: Vec<Spool>,
}

/// Ribbon 连接端点
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "endpoint")]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spools: Option<SpoolData>,
}

impl Endpoint {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            spools: None,
        }
    }

    /// 拼接 websocket 地址，已是完整 ws(s):// 地址时原样返回
    pub fn url(&self, ws_base: &str) -> Result<String> {
        if self.path.starts_with("ws://") || self.path.starts_with("wss://") {
            return Ok(self.path.clone());
        }
        if !self.path.starts_with('/') {
            return Err(RibbonError::InvalidUrl(self.path.clone()));
        }
        Ok(format!("{}{}", ws_base.trim_end_matches('/'), self.path))
    }
}

// ==================== Bootstrap 数据 ====================

/// 服务端环境签名，原样放入 authorize 请求
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub signature: Map<String, Value>,
}

/// 当前账号身份
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub role: String,
    #[serde(rename = "_id", default)]
    pub id: String,
}

impl Identity {
    pub const BOT_ROLE: &'static str = "bot";

    /// 只允许 bot 账号
    pub fn ensure_bot(&self) -> Result<()> {
        if self.role.to_lowercase() != Self::BOT_ROLE {
            return Err(RibbonError::NotBot {
                role: self.role.to_lowercase(),
            });
        }
        Ok(())
    }
}

/// 操作手感参数，authorize 时发送一次
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handling {
    pub arr: u32,
    pub cancel: bool,
    pub das: u32,
    pub dcd: u32,
    pub safelock: bool,
    pub may20g: bool,
    pub sdf: u32,
}

impl Default for Handling {
    fn default() -> Self {
        Self {
            arr: 0,
            cancel: false,
            das: 5,
            dcd: 0,
            safelock: false,
            may20g: true,
            sdf: 41,
        }
    }
}

/// 服务端迁移指令
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Migration {
    pub endpoint: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub flag: String,
}

impl Migration {
    pub fn into_endpoint(self) -> Endpoint {
        Endpoint::new(self.endpoint)
    }
}
