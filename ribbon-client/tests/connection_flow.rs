//! 连接状态机集成测试：脚本化的内存传输代替真实 websocket

use async_trait::async_trait;
use parking_lot::Mutex;
use ribbon_client::{
    names, BootstrapInfo, ClientConfig, Command, ConnectionState, Connector, Endpoint,
    Environment, Feature, Identity, ReconnectPolicy, RibbonClient, RibbonError, StaticDiscovery,
    Transport,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};

const WAIT: Duration = Duration::from_secs(2);

// ==================== 脚本化传输 ====================

struct ScriptedTransport {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn send(&mut self, text: String) -> ribbon_client::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RibbonError::Transport("send on closed transport".into()));
        }
        self.outgoing
            .send(text)
            .map_err(|_| RibbonError::Transport("peer gone".into()))
    }

    async fn recv(&mut self) -> Option<ribbon_client::Result<String>> {
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> ribbon_client::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// 测试侧的连接句柄：推送服务端帧、读取客户端发出的帧
struct Link {
    incoming: mpsc::UnboundedSender<String>,
    outgoing: mpsc::UnboundedReceiver<String>,
    closed: Arc<AtomicBool>,
}

impl Link {
    fn push(&self, frame: Value) {
        self.push_raw(&frame.to_string());
    }

    fn push_raw(&self, text: &str) {
        self.incoming.send(text.to_string()).unwrap();
    }

    async fn next(&mut self) -> Value {
        let text = timeout(WAIT, self.outgoing.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("transport dropped");
        serde_json::from_str(&text).unwrap()
    }

    /// 下一个非 ping 帧
    async fn next_command(&mut self) -> Value {
        loop {
            let frame = self.next().await;
            if frame["command"] != "ping" {
                return frame;
            }
        }
    }

    fn drain(&mut self) -> Vec<Value> {
        let mut frames = Vec::new();
        while let Ok(text) = self.outgoing.try_recv() {
            frames.push(serde_json::from_str(&text).unwrap());
        }
        frames
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// 连接器挂起点：进入 connect 时通知测试，等待放行后再建立连接
struct Gate {
    entered: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

struct MockConnector {
    urls: Mutex<Vec<String>>,
    links: mpsc::UnboundedSender<Link>,
    /// URL -> 剩余拒绝次数
    refusals: Mutex<HashMap<String, usize>>,
    gate: Mutex<Option<Gate>>,
}

impl MockConnector {
    fn refuse(&self, url: &str, times: usize) {
        self.refusals.lock().insert(url.to_string(), times);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> ribbon_client::Result<Box<dyn Transport>> {
        self.urls.lock().push(url.to_string());

        if let Some(left) = self.refusals.lock().get_mut(url).filter(|left| **left > 0) {
            *left -= 1;
            return Err(RibbonError::ConnectionFailed(format!("refused: {}", url)));
        }

        let gate = self.gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.entered.send(());
            let _ = gate.release.await;
        }

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let _ = self.links.send(Link {
            incoming: incoming_tx,
            outgoing: outgoing_rx,
            closed: closed.clone(),
        });
        Ok(Box::new(ScriptedTransport {
            incoming: incoming_rx,
            outgoing: outgoing_tx,
            closed,
        }))
    }
}

// ==================== 测试工具 ====================

struct Harness {
    client: RibbonClient,
    connector: Arc<MockConnector>,
    links: mpsc::UnboundedReceiver<Link>,
}

impl Harness {
    fn new(role: &str, reconnect: ReconnectPolicy) -> Self {
        let (links_tx, links) = mpsc::unbounded_channel();
        let connector = Arc::new(MockConnector {
            urls: Mutex::new(Vec::new()),
            links: links_tx,
            refusals: Mutex::new(HashMap::new()),
            gate: Mutex::new(None),
        });

        let mut signature = serde_json::Map::new();
        signature.insert("version".into(), json!("6.3.0"));
        let discovery = StaticDiscovery {
            info: BootstrapInfo {
                environment: Environment { signature },
                identity: Identity {
                    username: "teto".into(),
                    role: role.into(),
                    id: "bot-id".into(),
                },
                endpoint: Endpoint::new("/ribbon/abc"),
            },
        };

        let config = ClientConfig {
            ws_url: "wss://ribbon.test".into(),
            // 只保留每次启动时立即发出的首个 ping
            ping_interval: Duration::from_secs(600),
            reconnect,
            shutdown_timeout: Duration::from_secs(1),
            ..ClientConfig::default()
        };

        let client = RibbonClient::builder("bot-token")
            .config(config)
            .connector(connector.clone())
            .discovery(Arc::new(discovery))
            .build()
            .unwrap();

        Self {
            client,
            connector,
            links,
        }
    }

    async fn next_link(&mut self) -> Link {
        timeout(WAIT, self.links.recv())
            .await
            .expect("timed out waiting for connection")
            .expect("connector dropped")
    }

    /// 连接并完成 new → session → authorize 全流程
    async fn connect_ready(&mut self) -> Link {
        self.client.connect(None).await.unwrap();
        let mut link = self.next_link().await;

        assert_eq!(link.next().await, json!({"command": "new"}));
        link.push(json!({"command": "session", "data": {"ribbonid": "A", "tokenid": "B"}}));

        let authorize = link.next().await;
        assert_eq!(authorize["command"], "server.authorize");
        link.push(json!({"command": "server.authorize", "data": {"success": true}}));

        timeout(WAIT, self.client.wait_ready()).await.unwrap().unwrap();
        assert_eq!(
            link.next_command().await,
            json!({"command": "social.presence", "data": {"status": "online", "detail": "menus"}})
        );
        link
    }

    fn urls(&self) -> Vec<String> {
        self.connector.urls.lock().clone()
    }
}

/// 推送一个只带 id 的同步帧，等待接收循环处理完之前的所有帧
async fn settle(client: &RibbonClient, link: &Link, id: &str) {
    link.push(json!({"command": "test.sync", "id": id}));
    timeout(WAIT, async {
        while client.session().last_received.as_deref() != Some(id) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("frame was not processed");
}

fn count(frames: &[Value], command: &str) -> usize {
    frames.iter().filter(|f| f["command"] == command).count()
}

// ==================== 握手 ====================

#[tokio::test]
async fn test_fresh_session_authorizes_once() {
    let mut harness = Harness::new("bot", ReconnectPolicy::disabled());
    harness.client.connect(None).await.unwrap();
    let mut link = harness.next_link().await;

    assert_eq!(harness.urls(), vec!["wss://ribbon.test/ribbon/abc".to_string()]);
    assert_eq!(link.next().await, json!({"command": "new"}));

    link.push(json!({"command": "session", "data": {"ribbonid": "A", "tokenid": "B"}}));
    let authorize = link.next().await;
    assert_eq!(authorize["command"], "server.authorize");
    assert_eq!(authorize["data"]["token"], "bot-token");
    assert_eq!(authorize["data"]["handling"]["das"], 5);
    assert_eq!(authorize["data"]["handling"]["sdf"], 41);
    assert_eq!(authorize["data"]["signature"]["version"], "6.3.0");
    assert_eq!(harness.client.state(), ConnectionState::Authorizing);

    let session = harness.client.session();
    assert_eq!(session.ribbon_id, "A");
    assert_eq!(session.token_id, "B");

    link.push(json!({"command": "server.authorize", "data": {"success": true}}));
    timeout(WAIT, harness.client.wait_ready()).await.unwrap().unwrap();

    // 已有 token 的会话再收到 session 不会重新授权
    link.push(json!({"command": "session", "data": {"ribbonid": "C", "tokenid": "D"}}));
    settle(&harness.client, &link, "1").await;

    let frames = link.drain();
    assert_eq!(count(&frames, "server.authorize"), 0);
    assert_eq!(harness.client.session().token_id, "B");
    assert_eq!(harness.client.state(), ConnectionState::Ready);

    harness.client.close().await;
}

#[tokio::test]
async fn test_ready_side_effects() {
    let mut harness = Harness::new("bot", ReconnectPolicy::disabled());
    let ready = Arc::new(AtomicUsize::new(0));
    let counter = ready.clone();
    harness.client.subscribe(names::READY, move |_: &Value| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let mut link = harness.connect_ready().await;
    assert_eq!(ready.load(Ordering::SeqCst), 1);
    assert!(harness.client.keepalive_running());
    assert_eq!(harness.client.keepalive_starts(), 1);

    // 心跳首个 tick 立即发出
    let ping = link.next().await;
    assert_eq!(ping["command"], "ping");
    assert!(harness.client.last_ping_at().is_some());

    harness.client.close().await;
}

#[tokio::test]
async fn test_authorize_without_session_is_dropped() {
    let mut harness = Harness::new("bot", ReconnectPolicy::disabled());
    harness.client.connect(None).await.unwrap();
    let mut link = harness.next_link().await;
    assert_eq!(link.next().await["command"], "new");

    link.push(json!({"command": "server.authorize", "data": {"success": true}}));
    settle(&harness.client, &link, "1").await;

    assert_eq!(harness.client.state(), ConnectionState::AwaitingSession);
    assert!(!harness.client.keepalive_running());
    assert!(harness.client.session().token_id.is_empty());

    harness.client.close().await;
}

// ==================== 分发 ====================

#[tokio::test]
async fn test_packets_batch_dispatch_order() {
    let mut harness = Harness::new("bot", ReconnectPolicy::disabled());
    let mut link = harness.connect_ready().await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let log = seen.clone();
    harness.client.register_handler("room.chat", move |data: &Value| {
        log.lock().push(data["content"].as_str().unwrap_or_default().to_string());
    });

    link.push(json!({
        "command": "packets",
        "data": {"packets": [
            {"command": "room.chat", "data": {"content": "first"}, "id": "5"},
            {"command": "ping", "id": "6"}
        ]}
    }));

    timeout(WAIT, async {
        while harness.client.session().last_received.as_deref() != Some("6") {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    assert_eq!(*seen.lock(), vec!["first".to_string()]);
    let _ = link.drain();
    harness.client.close().await;
}

#[tokio::test]
async fn test_handler_last_writer_wins() {
    let mut harness = Harness::new("bot", ReconnectPolicy::disabled());
    let link = harness.connect_ready().await;

    let calls = Arc::new(Mutex::new(Vec::new()));
    let c1 = calls.clone();
    harness
        .client
        .register_handler("room.chat", move |_: &Value| c1.lock().push("h1"));
    let c2 = calls.clone();
    harness
        .client
        .register_handler(Command::RoomChat, move |_: &Value| c2.lock().push("h2"));

    link.push(json!({"command": "room.chat", "data": {"content": "hi"}}));
    settle(&harness.client, &link, "2").await;

    assert_eq!(*calls.lock(), vec!["h2"]);
    harness.client.close().await;
}

#[tokio::test]
async fn test_malformed_frame_does_not_stop_loop() {
    let mut harness = Harness::new("bot", ReconnectPolicy::disabled());
    let link = harness.connect_ready().await;

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    harness.client.register_handler("room.update", move |_: &Value| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    link.push_raw("{not json");
    link.push_raw(r#"{"command":"packets","data":{"packets":"oops"}}"#);
    link.push(json!({"command": "room.update", "data": {}, "id": "3"}));
    settle(&harness.client, &link, "4").await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.client.state(), ConnectionState::Ready);
    harness.client.close().await;
}

// ==================== 发送约束 ====================

#[tokio::test]
async fn test_send_before_ready_is_rejected() {
    let mut harness = Harness::new("bot", ReconnectPolicy::disabled());
    harness.client.connect(None).await.unwrap();
    let mut link = harness.next_link().await;
    assert_eq!(link.next().await["command"], "new");

    assert_eq!(
        harness.client.send("room.chat.send", Some(json!({"content": "too early"}))),
        Err(RibbonError::NotReady {
            command: "room.chat.send".into(),
            state: ConnectionState::AwaitingSession,
        })
    );

    link.push(json!({"command": "session", "data": {"ribbonid": "A", "tokenid": "B"}}));
    assert_eq!(link.next().await["command"], "server.authorize");
    assert!(matches!(
        harness.client.send("room.join", Some(json!("ABCD"))),
        Err(RibbonError::NotReady {
            state: ConnectionState::Authorizing,
            ..
        })
    ));

    settle(&harness.client, &link, "1").await;
    assert!(link.drain().is_empty());

    harness.client.close().await;
}

#[tokio::test]
async fn test_send_when_ready() {
    let mut harness = Harness::new("bot", ReconnectPolicy::disabled());
    let mut link = harness.connect_ready().await;

    harness
        .client
        .send(Command::RoomJoin, Some(json!("ABCD")))
        .unwrap();
    assert_eq!(
        link.next_command().await,
        json!({"command": "room.join", "data": "ABCD"})
    );

    harness.client.close().await;
    assert_eq!(
        harness.client.send(Command::RoomLeave, Some(json!({}))),
        Err(RibbonError::Closed)
    );
}

// ==================== 迁移 ====================

#[tokio::test]
async fn test_migration_round_trip() {
    let mut harness = Harness::new("bot", ReconnectPolicy::disabled());
    let mut old = harness.connect_ready().await;
    assert_eq!(old.next().await["command"], "ping");

    let migrate_calls = Arc::new(AtomicUsize::new(0));
    let counter = migrate_calls.clone();
    harness.client.register_handler("server.migrate", move |_: &Value| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let migrated = Arc::new(AtomicUsize::new(0));
    let counter = migrated.clone();
    harness.client.subscribe(names::MIGRATED, move |_: &Value| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    old.push(json!({
        "command": "server.migrate",
        "data": {"endpoint": "/ribbon/xyz", "name": "osk", "flag": "JP"}
    }));

    let mut new = harness.next_link().await;
    assert!(old.is_closed(), "old transport must be closed before the new one opens");
    assert_eq!(
        harness.urls(),
        vec![
            "wss://ribbon.test/ribbon/abc".to_string(),
            "wss://ribbon.test/ribbon/xyz".to_string(),
        ]
    );
    assert_eq!(harness.client.endpoint().unwrap().path, "/ribbon/xyz");

    assert_eq!(
        new.next().await,
        json!({"command": "session", "data": {"ribbonid": "A", "tokenid": "B"}})
    );
    assert!(!harness.client.keepalive_running());
    assert!(matches!(
        harness.client.send("room.chat.send", Some(json!({"content": "x"}))),
        Err(RibbonError::NotReady { .. })
    ));

    new.push(json!({"command": "session", "data": {"ribbonid": "A", "tokenid": "B"}}));
    timeout(WAIT, harness.client.wait_ready()).await.unwrap().unwrap();
    new.push(json!({"command": "server.migrated", "data": {}}));
    settle(&harness.client, &new, "10").await;

    assert!(harness.client.keepalive_running());
    assert_eq!(harness.client.keepalive_starts(), 2);
    assert_eq!(migrate_calls.load(Ordering::SeqCst), 0);
    assert_eq!(migrated.load(Ordering::SeqCst), 1);

    let frames = new.drain();
    assert_eq!(count(&frames, "ping"), 1, "exactly one ticker after migration");
    assert_eq!(count(&frames, "server.authorize"), 0);
    assert!(old.drain().is_empty());

    harness.client.close().await;
}

struct CountingFeature {
    installs: AtomicUsize,
}

impl Feature for CountingFeature {
    fn name(&self) -> &str {
        "counting"
    }

    fn install(self: Arc<Self>, client: &RibbonClient) {
        self.installs.fetch_add(1, Ordering::SeqCst);
        client.register_handler("room.update", |_: &Value| {});
    }
}

#[tokio::test]
async fn test_features_install_on_authorize_only() {
    let mut harness = Harness::new("bot", ReconnectPolicy::disabled());
    let feature = Arc::new(CountingFeature {
        installs: AtomicUsize::new(0),
    });
    harness.client.add_feature(feature.clone());

    let old = harness.connect_ready().await;
    assert_eq!(feature.installs.load(Ordering::SeqCst), 1);
    assert!(harness.client.has_handler("room.update"));

    old.push(json!({"command": "server.migrate", "data": {"endpoint": "/ribbon/xyz"}}));
    let mut new = harness.next_link().await;
    assert_eq!(new.next().await["command"], "session");
    new.push(json!({"command": "session", "data": {"ribbonid": "A", "tokenid": "B"}}));
    timeout(WAIT, harness.client.wait_ready()).await.unwrap().unwrap();

    assert_eq!(feature.installs.load(Ordering::SeqCst), 1);
    harness.client.close().await;
    assert!(!harness.client.has_handler("room.update"));
}

#[tokio::test]
async fn test_queued_frames_do_not_cross_migration() {
    let mut harness = Harness::new("bot", ReconnectPolicy::disabled());
    let old = harness.connect_ready().await;

    let client = harness.client.clone();
    harness.client.register_handler("room.chat", move |_: &Value| {
        let _ = client.send(Command::RoomChatSend, Some(json!({"content": "reply"})));
    });

    // 回复在迁移前入队，但属于旧连接
    old.push(json!({
        "command": "packets",
        "data": {"packets": [
            {"command": "room.chat", "data": {"content": "hi"}},
            {"command": "server.migrate", "data": {"endpoint": "/ribbon/xyz"}}
        ]}
    }));

    let mut new = harness.next_link().await;
    assert_eq!(new.next().await["command"], "session");
    new.push(json!({"command": "session", "data": {"ribbonid": "A", "tokenid": "B"}}));
    timeout(WAIT, harness.client.wait_ready()).await.unwrap().unwrap();
    settle(&harness.client, &new, "20").await;

    assert_eq!(count(&new.drain(), "room.chat.send"), 0);

    harness
        .client
        .send(Command::RoomChatSend, Some(json!({"content": "after"})))
        .unwrap();
    assert_eq!(
        new.next_command().await,
        json!({"command": "room.chat.send", "data": {"content": "after"}})
    );

    harness.client.close().await;
}

#[tokio::test]
async fn test_migration_target_retried_under_policy() {
    let policy = ReconnectPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    };
    let mut harness = Harness::new("bot", policy);
    let old = harness.connect_ready().await;
    harness.connector.refuse("wss://ribbon.test/ribbon/xyz", 1);

    old.push(json!({"command": "server.migrate", "data": {"endpoint": "/ribbon/xyz"}}));

    let mut new = harness.next_link().await;
    assert_eq!(
        new.next().await,
        json!({"command": "session", "data": {"ribbonid": "A", "tokenid": "B"}})
    );
    assert_eq!(
        harness.urls(),
        vec![
            "wss://ribbon.test/ribbon/abc".to_string(),
            "wss://ribbon.test/ribbon/xyz".to_string(),
            "wss://ribbon.test/ribbon/xyz".to_string(),
        ]
    );

    new.push(json!({"command": "session", "data": {"ribbonid": "A", "tokenid": "B"}}));
    timeout(WAIT, harness.client.wait_ready()).await.unwrap().unwrap();
    harness.client.close().await;
}

#[tokio::test]
async fn test_unreachable_migration_target_is_terminal() {
    let mut harness = Harness::new("bot", ReconnectPolicy::disabled());
    let old = harness.connect_ready().await;
    harness.connector.refuse("wss://ribbon.test/ribbon/xyz", 1);

    old.push(json!({"command": "server.migrate", "data": {"endpoint": "/ribbon/xyz"}}));

    let result = timeout(WAIT, harness.client.wait_closed()).await.unwrap();
    assert!(matches!(result, Err(RibbonError::ConnectionFailed(_))));
    assert!(old.is_closed());
    assert_eq!(harness.urls().len(), 2);
    assert_eq!(harness.client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_migrate_before_ready_is_ignored() {
    let mut harness = Harness::new("bot", ReconnectPolicy::disabled());
    harness.client.connect(None).await.unwrap();
    let mut link = harness.next_link().await;
    assert_eq!(link.next().await["command"], "new");
    link.push(json!({"command": "session", "data": {"ribbonid": "A", "tokenid": "B"}}));
    assert_eq!(link.next().await["command"], "server.authorize");

    link.push(json!({"command": "server.migrate", "data": {"endpoint": "/ribbon/xyz"}}));
    settle(&harness.client, &link, "1").await;

    assert_eq!(harness.urls().len(), 1);
    assert!(!link.is_closed());
    assert_eq!(harness.client.state(), ConnectionState::Authorizing);

    link.push(json!({"command": "server.authorize", "data": {"success": true}}));
    timeout(WAIT, harness.client.wait_ready()).await.unwrap().unwrap();
    assert_eq!(harness.client.endpoint().unwrap().path, "/ribbon/abc");

    harness.client.close().await;
}

// ==================== 授权 ====================

#[tokio::test]
async fn test_authorize_rejected_is_terminal() {
    let mut harness = Harness::new("bot", ReconnectPolicy::default());
    harness.client.connect(None).await.unwrap();
    let mut link = harness.next_link().await;
    assert_eq!(link.next().await["command"], "new");
    link.push(json!({"command": "session", "data": {"ribbonid": "A", "tokenid": "B"}}));
    assert_eq!(link.next().await["command"], "server.authorize");

    link.push(json!({"command": "server.authorize", "data": {"success": false}}));

    let result = timeout(WAIT, harness.client.wait_closed()).await.unwrap();
    assert!(matches!(result, Err(RibbonError::ConnectionFailed(_))));
    assert!(link.is_closed());
    assert!(!harness.client.keepalive_running());
    assert!(!harness.client.session().authorized);
    // 授权被拒不重连
    assert_eq!(harness.urls().len(), 1);
}

#[tokio::test]
async fn test_drop_before_authorized_starts_new_session() {
    let policy = ReconnectPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    };
    let mut harness = Harness::new("bot", policy);
    let feature = Arc::new(CountingFeature {
        installs: AtomicUsize::new(0),
    });
    harness.client.add_feature(feature.clone());
    let ready = Arc::new(AtomicUsize::new(0));
    let counter = ready.clone();
    harness.client.subscribe(names::READY, move |_: &Value| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    harness.client.connect(None).await.unwrap();
    let mut link = harness.next_link().await;
    assert_eq!(link.next().await["command"], "new");
    link.push(json!({"command": "session", "data": {"ribbonid": "A", "tokenid": "B"}}));
    assert_eq!(link.next().await["command"], "server.authorize");
    drop(link);

    // 未授权的会话不能恢复，重新走 new → authorize
    let mut next = harness.next_link().await;
    assert_eq!(next.next().await, json!({"command": "new"}));
    assert!(harness.client.session().token_id.is_empty());
    assert!(matches!(
        harness.client.send("room.join", Some(json!("ABCD"))),
        Err(RibbonError::NotReady { .. })
    ));

    next.push(json!({"command": "session", "data": {"ribbonid": "C", "tokenid": "D"}}));
    assert_eq!(next.next().await["command"], "server.authorize");
    next.push(json!({"command": "server.authorize", "data": {"success": true}}));
    timeout(WAIT, harness.client.wait_ready()).await.unwrap().unwrap();

    assert_eq!(next.next_command().await["command"], "social.presence");
    assert_eq!(ready.load(Ordering::SeqCst), 1);
    assert_eq!(feature.installs.load(Ordering::SeqCst), 1);
    let session = harness.client.session();
    assert_eq!(session.token_id, "D");
    assert!(session.authorized);

    harness.client.close().await;
}

// ==================== 终止 ====================

#[tokio::test]
async fn test_kick_is_fatal_and_surfaced_once() {
    let mut harness = Harness::new("bot", ReconnectPolicy::default());
    let link = harness.connect_ready().await;

    let disconnects = Arc::new(AtomicUsize::new(0));
    let counter = disconnects.clone();
    harness.client.subscribe(names::DISCONNECTED, move |_: &Value| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    link.push(json!({"command": "kick", "data": {"reason": "idle"}}));

    let result = timeout(WAIT, harness.client.wait_closed()).await.unwrap();
    assert_eq!(result, Err(RibbonError::Kicked { reason: "idle".into() }));
    assert_eq!(harness.client.wait_closed().await, Ok(()));

    assert!(link.is_closed());
    assert!(!harness.client.keepalive_running());
    assert_eq!(harness.client.state(), ConnectionState::Closed);
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    // 被踢不会触发重连
    assert_eq!(harness.urls().len(), 1);
    harness.client.close().await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_close_is_clean() {
    let mut harness = Harness::new("bot", ReconnectPolicy::default());
    let link = harness.connect_ready().await;

    harness.client.close().await;
    assert!(link.is_closed());
    assert_eq!(harness.client.state(), ConnectionState::Closed);
    assert!(!harness.client.keepalive_running());
    assert_eq!(harness.client.wait_closed().await, Ok(()));

    harness.client.close().await;
    assert_eq!(harness.client.connect(None).await, Err(RibbonError::Closed));
}

#[tokio::test]
async fn test_dropped_connection_without_retries_is_fatal() {
    let mut harness = Harness::new("bot", ReconnectPolicy::disabled());
    let link = harness.connect_ready().await;

    drop(link);
    let result = timeout(WAIT, harness.client.wait_closed()).await.unwrap();
    assert!(matches!(result, Err(RibbonError::Transport(_))));
    assert_eq!(harness.urls().len(), 1);
}

#[tokio::test]
async fn test_dropped_connection_resumes_session() {
    let policy = ReconnectPolicy {
        max_retries: 2,
        base_delay: Duration::from_millis(10),
        max_delay: Duration::from_millis(50),
    };
    let mut harness = Harness::new("bot", policy);
    let link = harness.connect_ready().await;

    drop(link);
    let mut next = harness.next_link().await;
    assert_eq!(
        next.next().await,
        json!({"command": "session", "data": {"ribbonid": "A", "tokenid": "B"}})
    );

    next.push(json!({"command": "session", "data": {"ribbonid": "A", "tokenid": "B"}}));
    timeout(WAIT, harness.client.wait_ready()).await.unwrap().unwrap();
    assert_eq!(harness.urls().len(), 2);
    assert_eq!(harness.urls()[1], "wss://ribbon.test/ribbon/abc");

    harness.client.close().await;
}

#[tokio::test]
async fn test_bootstrap_rejects_non_bot() {
    let harness = Harness::new("user", ReconnectPolicy::default());
    assert_eq!(
        harness.client.connect(None).await,
        Err(RibbonError::NotBot { role: "user".into() })
    );
    assert!(harness.urls().is_empty());
    assert_eq!(harness.client.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_connect_with_explicit_endpoint_skips_bootstrap() {
    let mut harness = Harness::new("user", ReconnectPolicy::disabled());
    harness
        .client
        .connect(Some(Endpoint::new("/ribbon/direct")))
        .await
        .unwrap();
    let mut link = harness.next_link().await;

    assert_eq!(harness.urls(), vec!["wss://ribbon.test/ribbon/direct".to_string()]);
    assert_eq!(link.next().await, json!({"command": "new"}));
    assert!(harness.client.identity().is_none());
    assert_eq!(
        harness.client.connect(None).await,
        Err(RibbonError::AlreadyConnected)
    );

    link.push(json!({"command": "session", "data": {"ribbonid": "A", "tokenid": "B"}}));
    let authorize = link.next_command().await;
    assert_eq!(authorize["command"], "server.authorize");
    assert_eq!(authorize["data"]["signature"], json!({}));

    harness.client.close().await;
}

#[tokio::test]
async fn test_close_while_connecting_leaves_no_task() {
    let mut harness = Harness::new("bot", ReconnectPolicy::default());
    let (entered_tx, entered_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel();
    *harness.connector.gate.lock() = Some(Gate {
        entered: entered_tx,
        release: release_rx,
    });

    let client = harness.client.clone();
    let connecting = tokio::spawn(async move { client.connect(None).await });
    timeout(WAIT, entered_rx).await.unwrap().unwrap();

    // 连接任务尚未登记，close() 无任务可停
    harness.client.close().await;
    assert_eq!(harness.client.state(), ConnectionState::Closed);

    release_tx.send(()).unwrap();
    let result = timeout(WAIT, connecting).await.unwrap().unwrap();
    assert_eq!(result, Err(RibbonError::Closed));

    let link = harness.next_link().await;
    assert!(link.is_closed());
    // 握手不会把已关闭的客户端拉回 AwaitingSession
    assert_eq!(harness.client.state(), ConnectionState::Closed);
    assert_eq!(harness.client.wait_closed().await, Ok(()));
}
