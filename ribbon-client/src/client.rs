//! Ribbon 客户端（连接管理器）
//!
//! 一个客户端实例对应一个逻辑会话：
//! connect → new/session 握手 → server.authorize → Ready，
//! 服务端下发 server.migrate 时关闭旧连接、在新端点上用 `session` 恢复。
//!
//! 所有传输读写都在同一个后台连接任务里完成：
//! 出站帧经无界队列串行写入，入站帧按到达顺序同步分发。

use crate::bootstrap::{bootstrap, BootstrapInfo, Discovery, HttpDiscovery};
use crate::codec::{self, Frame};
use crate::config::ClientConfig;
use crate::error::{Result, RibbonError};
use crate::events::{names, AuthorizeData, Command, KickData, PresenceData, SessionData};
use crate::keepalive::Keepalive;
use crate::registry::{EventBus, HandlerRegistry, SubscriptionId};
use crate::session::{
    ConnectionState, Endpoint, Environment, Identity, Migration, Session, SessionState,
};
use crate::transport::{Connector, Transport, WebSocketConnector};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 功能模块（房间、社交等）
///
/// 每次授权成功进入 Ready 时调用 `install`，在其中注册命令处理器。
pub trait Feature: Send + Sync {
    fn name(&self) -> &str;

    fn install(self: Arc<Self>, client: &RibbonClient);
}

/// 单个入站命令处理后的去向
enum Flow {
    Continue,
    Migrate(Endpoint),
    Fatal(RibbonError),
}

/// 一条物理连接结束的原因
enum Exit {
    Shutdown,
    Fatal(RibbonError),
    Migrate(Endpoint),
    Dropped(String),
}

enum Reopen {
    Opened(Box<dyn Transport>),
    Shutdown,
    Failed(RibbonError),
}

/// 出站帧，只能写入入队时那一代物理连接
struct Outbound {
    generation: u64,
    text: String,
}

/// 运行中的连接任务
struct Connection {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

// ==================== 构建 ====================

/// 客户端构建器，可替换连接器与服务发现实现
pub struct ClientBuilder {
    token: String,
    config: ClientConfig,
    connector: Option<Arc<dyn Connector>>,
    discovery: Option<Arc<dyn Discovery>>,
}

impl ClientBuilder {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            config: ClientConfig::default(),
            connector: None,
            discovery: None,
        }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn discovery(mut self, discovery: Arc<dyn Discovery>) -> Self {
        self.discovery = Some(discovery);
        self
    }

    pub fn build(self) -> Result<RibbonClient> {
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(WebSocketConnector::new(&self.token, &self.config)?),
        };
        let discovery: Arc<dyn Discovery> = match self.discovery {
            Some(discovery) => discovery,
            None => Arc::new(HttpDiscovery::new(&self.token, &self.config)?),
        };

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);

        Ok(RibbonClient {
            inner: Arc::new(Inner {
                keepalive: Keepalive::new(self.config.ping_interval),
                config: self.config,
                token: self.token,
                connector,
                discovery,
                features: RwLock::new(Vec::new()),
                state,
                session: SessionState::new(),
                environment: RwLock::new(None),
                identity: RwLock::new(None),
                endpoint: RwLock::new(None),
                handlers: HandlerRegistry::new(),
                events: EventBus::new(),
                outbound,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                generation: AtomicU64::new(0),
                connection: Mutex::new(None),
                terminal: Mutex::new(None),
                finished: AtomicBool::new(false),
            }),
        })
    }
}

// ==================== 客户端 ====================

/// Ribbon 客户端句柄，可廉价克隆并在功能模块间共享
#[derive(Clone)]
pub struct RibbonClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ClientConfig,
    token: String,
    connector: Arc<dyn Connector>,
    discovery: Arc<dyn Discovery>,
    features: RwLock<Vec<Arc<dyn Feature>>>,

    state: watch::Sender<ConnectionState>,
    session: SessionState,
    environment: RwLock<Option<Environment>>,
    identity: RwLock<Option<Identity>>,
    endpoint: RwLock<Option<Endpoint>>,

    handlers: HandlerRegistry,
    events: EventBus,
    keepalive: Keepalive,

    /// 出站队列，接收端归连接任务所有
    outbound: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    /// 物理连接代次，离开一条连接时加一
    generation: AtomicU64,
    connection: Mutex<Option<Connection>>,

    /// 终止错误，由 wait_closed() 取走
    terminal: Mutex<Option<RibbonError>>,
    finished: AtomicBool,
}

impl RibbonClient {
    /// 使用默认 WebSocket 连接器和 HTTP 服务发现创建客户端
    pub fn new(token: impl Into<String>, config: ClientConfig) -> Result<Self> {
        ClientBuilder::new(token).config(config).build()
    }

    pub fn builder(token: impl Into<String>) -> ClientBuilder {
        ClientBuilder::new(token)
    }

    /// 执行 bootstrap：获取环境签名、校验 bot 身份、获取端点
    pub async fn initialize(&self) -> Result<BootstrapInfo> {
        let info = bootstrap(self.inner.discovery.as_ref()).await?;
        *self.inner.environment.write() = Some(info.environment.clone());
        *self.inner.identity.write() = Some(info.identity.clone());
        *self.inner.endpoint.write() = Some(info.endpoint.clone());
        Ok(info)
    }

    /// 建立连接并发送握手帧
    ///
    /// 未指定端点且尚无已知端点时先执行 bootstrap。首次连接失败不重试，
    /// 客户端直接进入 Closed，错误由本方法返回。
    pub async fn connect(&self, endpoint: Option<Endpoint>) -> Result<()> {
        let inner = &self.inner;

        let mut current = ConnectionState::Disconnected;
        let claimed = inner.state.send_if_modified(|state| {
            current = *state;
            if *state == ConnectionState::Disconnected {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(match current {
                ConnectionState::Closed => RibbonError::Closed,
                _ => RibbonError::AlreadyConnected,
            });
        }
        debug!("[RibbonClient] State: disconnected -> connecting");

        let transport = match self.establish(endpoint).await {
            Ok(transport) => transport,
            Err(e) => {
                error!("[RibbonClient] Connect failed: {}", e);
                inner.finish(None);
                return Err(e);
            }
        };

        let Some(outbound) = inner.outbound_rx.lock().take() else {
            inner.finish(None);
            return Err(RibbonError::Closed);
        };

        // 与 finish() 在同一把锁下判断，close() 并发执行时不会遗留连接任务
        let (shutdown, shutdown_rx) = oneshot::channel();
        let rejected = {
            let mut connection = inner.connection.lock();
            if inner.is_finished() {
                Some(transport)
            } else {
                let task = tokio::spawn(inner.clone().run(transport, outbound, shutdown_rx));
                *connection = Some(Connection { shutdown, task });
                None
            }
        };

        if let Some(mut transport) = rejected {
            Inner::close_transport(transport.as_mut()).await;
            return Err(RibbonError::Closed);
        }
        Ok(())
    }

    async fn establish(&self, endpoint: Option<Endpoint>) -> Result<Box<dyn Transport>> {
        let known = endpoint.or_else(|| self.inner.endpoint.read().clone());
        let endpoint = match known {
            Some(endpoint) => endpoint,
            None => self.initialize().await?.endpoint,
        };
        *self.inner.endpoint.write() = Some(endpoint.clone());

        self.inner.open(&endpoint).await
    }

    /// 发送命令，仅允许在 Ready 状态下调用
    pub fn send(&self, command: impl Into<Command>, data: Option<Value>) -> Result<()> {
        let command = command.into();
        // 先取代次再检查状态：离开连接时先改状态再加代次
        let generation = self.inner.generation();
        match self.state() {
            ConnectionState::Ready => self.inner.enqueue_for(generation, &command, data.as_ref()),
            ConnectionState::Closed => Err(RibbonError::Closed),
            state => Err(RibbonError::NotReady {
                command: command.to_string(),
                state,
            }),
        }
    }

    /// 注册命令处理器，同名命令后注册者覆盖先注册者
    pub fn register_handler<F>(&self, command: impl Into<Command>, handler: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.handlers.register(command.into(), Arc::new(handler));
    }

    pub fn unregister_handler(&self, command: impl Into<Command>) -> bool {
        self.inner.handlers.unregister(&command.into())
    }

    pub fn has_handler(&self, command: impl Into<Command>) -> bool {
        self.inner.handlers.contains(&command.into())
    }

    pub fn subscribe<F>(&self, event: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        self.inner.events.subscribe(event, Arc::new(callback))
    }

    pub fn unsubscribe(&self, event: &str, id: SubscriptionId) -> bool {
        self.inner.events.unsubscribe(event, id)
    }

    /// 发布应用层事件，返回调用的订阅者数量
    pub fn emit(&self, event: &str, data: &Value) -> usize {
        self.inner.events.emit(event, data)
    }

    /// 添加功能模块，下次进入 Ready 时安装
    pub fn add_feature(&self, feature: Arc<dyn Feature>) {
        info!("[RibbonClient] Feature added: {}", feature.name());
        self.inner.features.write().push(feature);
    }

    /// 关闭连接
    ///
    /// 通知连接任务退出并等待 `shutdown_timeout`，超时则强制中止。可重复调用。
    pub async fn close(&self) {
        let connection = self.inner.connection.lock().take();

        if let Some(Connection {
            shutdown,
            task: mut handle,
        }) = connection
        {
            let _ = shutdown.send(());
            match tokio::time::timeout(self.inner.config.shutdown_timeout, &mut handle).await {
                Ok(Ok(())) => debug!("[RibbonClient] Connection task stopped"),
                Ok(Err(e)) => warn!("[RibbonClient] Connection task failed: {}", e),
                Err(_) => {
                    warn!("[RibbonClient] Connection task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }

        self.inner.finish(None);
    }

    /// 等待进入 Ready；客户端先关闭时返回 Closed
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        let state = *rx
            .wait_for(|s| matches!(s, ConnectionState::Ready | ConnectionState::Closed))
            .await
            .map_err(|_| RibbonError::Closed)?;
        match state {
            ConnectionState::Ready => Ok(()),
            _ => Err(RibbonError::Closed),
        }
    }

    /// 等待连接终止，终止错误只返回一次
    pub async fn wait_closed(&self) -> Result<()> {
        let mut rx = self.inner.state.subscribe();
        rx.wait_for(|s| *s == ConnectionState::Closed)
            .await
            .map_err(|_| RibbonError::Closed)?;
        match self.inner.terminal.lock().take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // ==================== 只读访问 ====================

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    pub fn session(&self) -> Session {
        self.inner.session.snapshot()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.inner.identity.read().clone()
    }

    pub fn environment(&self) -> Option<Environment> {
        self.inner.environment.read().clone()
    }

    pub fn endpoint(&self) -> Option<Endpoint> {
        self.inner.endpoint.read().clone()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn keepalive_running(&self) -> bool {
        self.inner.keepalive.is_running()
    }

    /// 心跳累计启动次数（每次进入 Ready 加一）
    pub fn keepalive_starts(&self) -> u64 {
        self.inner.keepalive.start_count()
    }

    pub fn last_ping_at(&self) -> Option<DateTime<Utc>> {
        self.inner.keepalive.last_ping_at()
    }
}

// ==================== 连接任务 ====================

impl Inner {
    async fn run(
        self: Arc<Self>,
        mut transport: Box<dyn Transport>,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
        mut shutdown: oneshot::Receiver<()>,
    ) {
        let policy = self.config.reconnect;
        let mut failures = 0u32;
        let mut ready_seen = self.keepalive.start_count();

        let error = loop {
            let exit = self
                .pump(transport.as_mut(), &mut outbound, &mut shutdown)
                .await;
            self.keepalive.stop();

            // 重新进入过 Ready 则重置重试计数
            if self.keepalive.start_count() != ready_seen {
                ready_seen = self.keepalive.start_count();
                failures = 0;
            }

            let (endpoint, delay) = match exit {
                Exit::Shutdown => {
                    info!("[RibbonClient] Closing connection");
                    // 先发出已排队的帧（如 room.leave）
                    while let Ok(frame) = outbound.try_recv() {
                        if !self.is_current(&frame) {
                            continue;
                        }
                        if transport.send(frame.text).await.is_err() {
                            break;
                        }
                    }
                    Self::close_transport(transport.as_mut()).await;
                    break None;
                }
                Exit::Fatal(e) => {
                    Self::close_transport(transport.as_mut()).await;
                    break Some(e);
                }
                Exit::Migrate(endpoint) => {
                    self.retire_connection(ConnectionState::Migrating);
                    Self::close_transport(transport.as_mut()).await;
                    *self.endpoint.write() = Some(endpoint.clone());
                    (endpoint, None)
                }
                Exit::Dropped(reason) => {
                    warn!("[RibbonClient] Connection lost: {}", reason);
                    self.retire_connection(ConnectionState::Connecting);
                    Self::close_transport(transport.as_mut()).await;

                    if failures >= policy.max_retries {
                        break Some(RibbonError::Transport(reason));
                    }
                    let Some(endpoint) = self.endpoint.read().clone() else {
                        break Some(RibbonError::Transport(reason));
                    };
                    let delay = policy.delay(failures);
                    failures += 1;
                    (endpoint, Some(delay))
                }
            };

            match self
                .reopen(&endpoint, &mut shutdown, &mut failures, delay)
                .await
            {
                Reopen::Opened(next) => transport = next,
                Reopen::Shutdown => break None,
                Reopen::Failed(e) => break Some(e),
            }
        };

        self.finish(error);
    }

    /// 驱动一条物理连接直到其结束
    async fn pump(
        self: &Arc<Self>,
        transport: &mut dyn Transport,
        outbound: &mut mpsc::UnboundedReceiver<Outbound>,
        shutdown: &mut oneshot::Receiver<()>,
    ) -> Exit {
        loop {
            tokio::select! {
                biased;

                _ = &mut *shutdown => return Exit::Shutdown,

                Some(frame) = outbound.recv() => {
                    if !self.is_current(&frame) {
                        continue;
                    }
                    if let Err(e) = transport.send(frame.text).await {
                        return Exit::Dropped(e.to_string());
                    }
                }

                incoming = transport.recv() => match incoming {
                    Some(Ok(text)) => match self.handle_text(&text) {
                        Flow::Continue => {}
                        Flow::Migrate(endpoint) => return Exit::Migrate(endpoint),
                        Flow::Fatal(e) => return Exit::Fatal(e),
                    },
                    Some(Err(e)) => return Exit::Dropped(e.to_string()),
                    None => return Exit::Dropped("connection closed by server".to_string()),
                },
            }
        }
    }

    /// 打开新连接（迁移或断线重连），失败时按重连策略退避重试
    async fn reopen(
        &self,
        endpoint: &Endpoint,
        shutdown: &mut oneshot::Receiver<()>,
        failures: &mut u32,
        mut delay: Option<Duration>,
    ) -> Reopen {
        let policy = self.config.reconnect;
        loop {
            if let Some(delay) = delay.take() {
                info!(
                    "[RibbonClient] Reconnecting in {:?} (attempt {}/{})",
                    delay, failures, policy.max_retries
                );
                tokio::select! {
                    biased;
                    _ = &mut *shutdown => return Reopen::Shutdown,
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.set_state(ConnectionState::Connecting);
            match self.open(endpoint).await {
                Ok(transport) => return Reopen::Opened(transport),
                Err(e) if *failures < policy.max_retries => {
                    warn!("[RibbonClient] Failed to open {}: {}", endpoint.path, e);
                    delay = Some(policy.delay(*failures));
                    *failures += 1;
                }
                Err(e) => return Reopen::Failed(e),
            }
        }
    }

    /// 打开传输并发送握手帧
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn Transport>> {
        let url = endpoint.url(&self.config.ws_url)?;
        let mut transport = self.connector.connect(&url).await?;
        if let Err(e) = self.handshake(transport.as_mut()).await {
            Self::close_transport(transport.as_mut()).await;
            return Err(e);
        }
        Ok(transport)
    }

    /// 新会话发 `new`，已授权的会话（迁移/重连）发 `session` 恢复
    async fn handshake(&self, transport: &mut dyn Transport) -> Result<()> {
        let frame = if !self.session.is_resumable() {
            if !self.session.is_fresh() {
                warn!("[RibbonClient] Session was never authorized, starting a new one");
                self.session.reset();
            }
            debug!("[RibbonClient] Sending new");
            codec::encode(&Command::New, None)?
        } else {
            let (ribbon_id, token_id) = self.session.ids();
            info!("[RibbonClient] Resuming session {}", ribbon_id);
            let data = serde_json::to_value(SessionData {
                ribbon_id,
                token_id,
            })?;
            codec::encode(&Command::Session, Some(&data))?
        };
        transport.send(frame).await?;
        self.set_state(ConnectionState::AwaitingSession);
        Ok(())
    }

    async fn close_transport(transport: &mut dyn Transport) {
        if let Err(e) = transport.close().await {
            debug!("[RibbonClient] Error closing transport: {}", e);
        }
    }

    // ==================== 入站分发 ====================

    fn handle_text(self: &Arc<Self>, text: &str) -> Flow {
        let frames = match codec::decode(text) {
            Ok(frames) => frames,
            Err(e) => {
                warn!("[RibbonClient] Dropping frame: {}", e);
                return Flow::Continue;
            }
        };

        for frame in frames {
            match self.dispatch(frame) {
                Flow::Continue => {}
                other => return other,
            }
        }
        Flow::Continue
    }

    fn dispatch(self: &Arc<Self>, frame: Frame) -> Flow {
        if let Some(id) = frame.id {
            self.session.record_received(id);
        }

        let Some(command) = frame.command else {
            return Flow::Continue;
        };
        if command == Command::Ping {
            return Flow::Continue;
        }
        debug!("[RibbonClient] Handling command: {}", command);

        let reaction = match &command {
            Command::Kick => Err(RibbonError::Kicked {
                reason: kick_reason(&frame.data),
            }),
            Command::Session => self.on_session(&frame.data),
            Command::Authorize => self.on_authorized(&frame.data),
            Command::Migrate if self.state() != ConnectionState::Ready => Err(
                RibbonError::Protocol(format!("Unexpected migration while {}", self.state())),
            ),
            Command::Migrate => {
                return match serde_json::from_value::<Migration>(frame.data) {
                    Ok(migration) => {
                        info!(
                            "[RibbonClient] Migrating to server {} ({})",
                            migration.name, migration.flag
                        );
                        Flow::Migrate(migration.into_endpoint())
                    }
                    Err(e) => {
                        warn!("[RibbonClient] Dropping invalid migration: {}", e);
                        Flow::Continue
                    }
                };
            }
            Command::Migrated => {
                info!("[RibbonClient] Migration completed successfully");
                self.events.emit(names::MIGRATED, &frame.data);
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(e) = reaction {
            if e.is_fatal() {
                return Flow::Fatal(e);
            }
            warn!("[RibbonClient] Dropping {}: {}", command, e);
            return Flow::Continue;
        }

        self.handlers.dispatch(&command, &frame.data);
        Flow::Continue
    }

    fn on_session(&self, data: &Value) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::AwaitingSession {
            return Err(RibbonError::Protocol(format!(
                "Unexpected session reply while {}",
                state
            )));
        }

        if self.session.is_resumable() {
            info!("[RibbonClient] Session resumed");
            self.set_state(ConnectionState::Ready);
            self.start_keepalive();
            return Ok(());
        }

        let reply: SessionData = serde_json::from_value(data.clone())
            .map_err(|e| RibbonError::Protocol(format!("Invalid session reply: {}", e)))?;
        if reply.token_id.is_empty() {
            return Err(RibbonError::Protocol("Session reply without tokenid".into()));
        }

        info!("[RibbonClient] New session, starting authorization flow");
        self.session.assign(&reply.ribbon_id, &reply.token_id);
        self.set_state(ConnectionState::Authorizing);

        let environment = self.environment.read().clone().unwrap_or_default();
        let data = serde_json::to_value(AuthorizeData {
            token: &self.token,
            handling: self.config.handling,
            signature: &environment.signature,
        })?;
        self.enqueue(&Command::Authorize, Some(&data))
    }

    fn on_authorized(self: &Arc<Self>, data: &Value) -> Result<()> {
        let state = self.state();
        if state != ConnectionState::Authorizing {
            return Err(RibbonError::Protocol(format!(
                "Unexpected authorize reply while {}",
                state
            )));
        }
        if data.get("success").and_then(Value::as_bool) == Some(false) {
            return Err(RibbonError::ConnectionFailed(
                "Authorization rejected by server".to_string(),
            ));
        }

        info!("[RibbonClient] Connected and authorized successfully");
        self.session.mark_authorized();
        self.set_state(ConnectionState::Ready);

        let client = RibbonClient {
            inner: self.clone(),
        };
        let features = self.features.read().clone();
        for feature in features {
            debug!("[RibbonClient] Installing feature {}", feature.name());
            feature.install(&client);
        }

        self.start_keepalive();
        self.events.emit(names::READY, &Value::Null);

        let presence = serde_json::to_value(PresenceData::default())?;
        self.enqueue(&Command::SocialPresence, Some(&presence))
    }

    // ==================== 内部工具 ====================

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// 切换状态；Closed 是终态，之后的切换被忽略
    fn set_state(&self, next: ConnectionState) {
        let mut previous = next;
        let changed = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == ConnectionState::Closed || *state == next {
                return false;
            }
            *state = next;
            true
        });
        if changed {
            debug!("[RibbonClient] State: {} -> {}", previous, next);
        }
    }

    /// 离开当前物理连接：先切换状态再推进代次，之前排队的帧都不会再发出
    fn retire_connection(&self, next: ConnectionState) {
        self.set_state(next);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    fn is_current(&self, frame: &Outbound) -> bool {
        if frame.generation == self.generation() {
            return true;
        }
        warn!("[RibbonClient] Discarding frame queued for a previous connection");
        false
    }

    fn start_keepalive(&self) {
        let outbound = self.outbound.clone();
        let generation = self.generation();
        self.keepalive.start(
            move |text| outbound.send(Outbound { generation, text }).is_ok(),
            self.session.watch_last_received(),
        );
    }

    fn enqueue(&self, command: &Command, data: Option<&Value>) -> Result<()> {
        self.enqueue_for(self.generation(), command, data)
    }

    fn enqueue_for(&self, generation: u64, command: &Command, data: Option<&Value>) -> Result<()> {
        let text = codec::encode(command, data)?;
        if !command.is_quiet() {
            debug!("[RibbonClient] Sending {}", command);
        }
        self.outbound
            .send(Outbound { generation, text })
            .map_err(|_| RibbonError::Closed)
    }

    fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// 进入 Closed：停止心跳、记录终止错误、发布 disconnected，
    /// 清空处理器和订阅者以释放其持有的客户端句柄
    fn finish(&self, error: Option<RibbonError>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }

        // connect() 可能在 close() 取走句柄之后才登记连接任务
        if let Some(connection) = self.connection.lock().take() {
            let _ = connection.shutdown.send(());
        }

        self.keepalive.stop();
        let reason = error.as_ref().map(|e| e.to_string());
        if let Some(e) = error {
            error!("[RibbonClient] Connection terminated: {}", e);
            *self.terminal.lock() = Some(e);
        }
        self.set_state(ConnectionState::Closed);

        self.events
            .emit(names::DISCONNECTED, &json!({ "reason": reason }));

        self.handlers.clear();
        self.events.clear();
        self.features.write().clear();
    }
}

fn kick_reason(data: &Value) -> String {
    serde_json::from_value::<KickData>(data.clone())
        .ok()
        .and_then(|kick| kick.reason)
        .unwrap_or_else(|| "No reason provided".to_string())
}
