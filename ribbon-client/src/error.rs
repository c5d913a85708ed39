//! Ribbon 错误定义

use crate::session::ConnectionState;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RibbonError {
    #[error("Bootstrap failed: {0}")]
    Bootstrap(String),

    #[error("This client can only be used with bot accounts, got role: {role}")]
    NotBot { role: String },

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Kicked from server: {reason}")]
    Kicked { reason: String },

    /// 未进入 Ready 前由功能模块发起的发送
    #[error("Cannot send `{command}` while {state}")]
    NotReady {
        command: String,
        state: ConnectionState,
    },

    #[error("Client is closed")]
    Closed,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("TLS error: {0}")]
    TlsError(String),
}

impl RibbonError {
    /// 是否为终止性错误（连接无法继续使用）
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RibbonError::Protocol(_) | RibbonError::NotReady { .. } | RibbonError::Serialization(_)
        )
    }
}

impl From<serde_json::Error> for RibbonError {
    fn from(e: serde_json::Error) -> Self {
        RibbonError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RibbonError>;
