//! Bot 服务实现

use crate::room::RoomModule;
use crate::social::SocialModule;
use anyhow::{Context, Result};
use ribbon_client::{names, ClientConfig, Endpoint, RibbonClient, SubscriptionId};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// 等待授权完成的最长时间
const READY_TIMEOUT: Duration = Duration::from_secs(30);

/// Bot 服务：一个 Ribbon 客户端加上房间 / 社交模块
pub struct BotService {
    client: RibbonClient,
    room: Arc<RoomModule>,
    social: Arc<SocialModule>,
}

impl BotService {
    pub fn new(token: &str, config: ClientConfig) -> Result<Self> {
        let client = RibbonClient::new(token, config).context("Failed to create Ribbon client")?;
        Ok(Self::with_client(client))
    }

    /// 在已有客户端上挂载功能模块
    pub fn with_client(client: RibbonClient) -> Self {
        let room = RoomModule::new(client.clone());
        let social = SocialModule::new(client.clone());
        client.add_feature(room.clone());
        client.add_feature(social.clone());

        Self {
            client,
            room,
            social,
        }
    }

    pub fn client(&self) -> &RibbonClient {
        &self.client
    }

    pub fn room(&self) -> &Arc<RoomModule> {
        &self.room
    }

    pub fn social(&self) -> &Arc<SocialModule> {
        &self.social
    }

    /// Ready 后自动加入房间（房间 ID 转大写）
    pub fn join_on_ready(&self, room_id: &str) -> SubscriptionId {
        let room = self.room.clone();
        let room_id = room_id.to_uppercase();
        self.client.subscribe(names::READY, move |_: &Value| {
            if let Err(e) = room.join_room(&room_id) {
                warn!("[Room] Failed to join {}: {}", room_id, e);
            }
        })
    }

    /// 有玩家进入房间时发送欢迎语
    pub fn greet_on_join(&self, greeting: &str) -> SubscriptionId {
        let room = self.room.clone();
        let greeting = greeting.to_string();
        self.client
            .subscribe(names::ROOM_PLAYER_JOINED, move |_: &Value| {
                if let Err(e) = room.send_chat(&greeting) {
                    warn!("[Room] Failed to greet player: {}", e);
                }
            })
    }

    /// 启动服务：连接并等待授权完成
    pub async fn start(&self, endpoint: Option<Endpoint>) -> Result<()> {
        info!("Starting bot service...");

        self.client
            .connect(endpoint)
            .await
            .context("Failed to connect to Ribbon")?;

        tokio::time::timeout(READY_TIMEOUT, self.client.wait_ready())
            .await
            .context("Timed out waiting for authorization")?
            .context("Connection closed before ready")?;

        info!("Bot service started");
        Ok(())
    }

    /// 停止服务：离开当前房间后关闭连接
    pub async fn stop(&self) {
        info!("Stopping bot service...");

        if self.room.current_room().is_some() {
            if let Err(e) = self.room.leave_room() {
                warn!("[Room] Failed to leave room: {}", e);
            }
        }
        self.client.close().await;

        info!("Bot service stopped");
    }

    /// 运行直到连接终止，返回终止原因
    pub async fn run(&self) -> Result<()> {
        self.client
            .wait_closed()
            .await
            .context("Ribbon connection terminated")
    }
}
