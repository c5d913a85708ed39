//! 测试用内存连接

use async_trait::async_trait;
use ribbon_client::{
    BootstrapInfo, ClientConfig, Connector, Endpoint, Environment, Identity, ReconnectPolicy,
    RibbonClient, RibbonError, StaticDiscovery, Transport,
};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const BOT_ID: &str = "bot-id";
const WAIT: Duration = Duration::from_secs(2);

struct PeerTransport {
    incoming: mpsc::UnboundedReceiver<String>,
    outgoing: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl Transport for PeerTransport {
    async fn send(&mut self, text: String) -> ribbon_client::Result<()> {
        self.outgoing
            .send(text)
            .map_err(|_| RibbonError::Transport("peer gone".into()))
    }

    async fn recv(&mut self) -> Option<ribbon_client::Result<String>> {
        self.incoming.recv().await.map(Ok)
    }

    async fn close(&mut self) -> ribbon_client::Result<()> {
        self.incoming.close();
        Ok(())
    }
}

/// 服务端一侧
pub struct Peer {
    incoming: mpsc::UnboundedSender<String>,
    outgoing: mpsc::UnboundedReceiver<String>,
    /// 握手期间读到、尚未被测试消费的帧
    pending: VecDeque<Value>,
}

impl Peer {
    pub fn push(&self, frame: Value) {
        let _ = self.incoming.send(frame.to_string());
    }

    pub async fn next(&mut self) -> Value {
        if let Some(frame) = self.pending.pop_front() {
            return frame;
        }
        self.recv().await
    }

    async fn recv(&mut self) -> Value {
        let text = timeout(WAIT, self.outgoing.recv())
            .await
            .expect("timed out waiting for outbound frame")
            .expect("transport dropped");
        serde_json::from_str(&text).unwrap()
    }

    /// 下一个非 ping 帧
    pub async fn next_command(&mut self) -> Value {
        loop {
            let frame = self.next().await;
            if frame["command"] != "ping" {
                return frame;
            }
        }
    }
}

struct PeerConnector {
    peers: mpsc::UnboundedSender<Peer>,
}

#[async_trait]
impl Connector for PeerConnector {
    async fn connect(&self, _url: &str) -> ribbon_client::Result<Box<dyn Transport>> {
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel();
        let _ = self.peers.send(Peer {
            incoming: incoming_tx,
            outgoing: outgoing_rx,
            pending: VecDeque::new(),
        });
        Ok(Box::new(PeerTransport {
            incoming: incoming_rx,
            outgoing: outgoing_tx,
        }))
    }
}

/// 未连接的客户端，bootstrap 返回 bot 身份 `bot-id`
pub fn client() -> (RibbonClient, mpsc::UnboundedReceiver<Peer>) {
    let (peers_tx, peers) = mpsc::unbounded_channel();
    let discovery = StaticDiscovery {
        info: BootstrapInfo {
            environment: Environment::default(),
            identity: Identity {
                username: "teto".into(),
                role: "bot".into(),
                id: BOT_ID.into(),
            },
            endpoint: Endpoint::new("/ribbon/test"),
        },
    };
    let config = ClientConfig {
        ws_url: "wss://ribbon.test".into(),
        ping_interval: Duration::from_secs(600),
        reconnect: ReconnectPolicy::disabled(),
        ..ClientConfig::default()
    };

    let client = RibbonClient::builder("bot-token")
        .config(config)
        .connector(Arc::new(PeerConnector { peers: peers_tx }))
        .discovery(Arc::new(discovery))
        .build()
        .unwrap();
    (client, peers)
}

/// 驱动握手直到 Ready
///
/// 读掉自动发送的 presence 帧；ready 回调里先发出的帧保留给测试按序读取。
pub async fn drive_ready(client: &RibbonClient, peers: &mut mpsc::UnboundedReceiver<Peer>) -> Peer {
    let mut peer = timeout(WAIT, peers.recv()).await.unwrap().unwrap();
    assert_eq!(peer.recv().await["command"], "new");

    peer.push(json!({"command": "session", "data": {"ribbonid": "R", "tokenid": "T"}}));
    assert_eq!(peer.recv().await["command"], "server.authorize");
    peer.push(json!({"command": "server.authorize", "data": {"success": true}}));

    timeout(WAIT, client.wait_ready()).await.unwrap().unwrap();
    loop {
        let frame = peer.recv().await;
        match frame["command"].as_str() {
            Some("social.presence") => break,
            Some("ping") => {}
            _ => peer.pending.push_back(frame),
        }
    }
    peer
}
