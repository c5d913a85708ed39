//! Ribbon 协议客户端
//!
//! 基于 tokio-tungstenite 的长连接客户端：会话握手与授权、心跳、
//! 服务端迁移、批量包拆分以及命令 / 事件分发。

mod bootstrap;
mod client;
mod codec;
mod config;
mod error;
mod events;
mod keepalive;
mod registry;
mod session;
mod transport;

pub use bootstrap::{bootstrap, BootstrapInfo, Discovery, HttpDiscovery, StaticDiscovery};
pub use client::{ClientBuilder, Feature, RibbonClient};
pub use codec::{decode, encode, Frame};
pub use config::{
    BotInfo, ClientConfig, ReconnectPolicy, TlsConfig, DEFAULT_API_URL, DEFAULT_PING_INTERVAL,
    DEFAULT_WS_URL,
};
pub use error::{Result, RibbonError};
pub use events::{
    names,
    // 事件 / 命令
    Command,
    // 上行数据
    AuthorizeData, ChatSendData, DirectMessageData, PingData, PresenceData, SessionData,
    // 下行数据
    ChatMessage, ChatUser, KickData,
};
pub use keepalive::Keepalive;
pub use registry::{CommandHandler, EventBus, EventCallback, HandlerRegistry, SubscriptionId};
pub use session::{
    ConnectionState, Endpoint, Environment, Handling, Identity, Migration, Session, Spool,
    SpoolData,
};
pub use transport::{build_tls_connector, Connector, Transport, WebSocketConnector, WebSocketTransport};
