//! 房间功能模块
//!
//! 加入 / 离开房间、房间聊天，并把房间内事件转成应用层事件

use anyhow::{bail, Result};
use parking_lot::RwLock;
use ribbon_client::{names, ChatMessage, ChatSendData, Command, Feature, RibbonClient};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct RoomModule {
    client: RibbonClient,
    /// 当前房间 ID
    current_room: RwLock<Option<String>>,
}

impl RoomModule {
    pub fn new(client: RibbonClient) -> Arc<Self> {
        Arc::new(Self {
            client,
            current_room: RwLock::new(None),
        })
    }

    pub fn current_room(&self) -> Option<String> {
        self.current_room.read().clone()
    }

    /// 加入房间（数据为裸房间 ID 字符串）
    pub fn join_room(&self, room_id: &str) -> Result<()> {
        self.client.send(Command::RoomJoin, Some(json!(room_id)))?;
        *self.current_room.write() = Some(room_id.to_string());
        info!("[Room] Joining room {}", room_id);
        Ok(())
    }

    /// 离开当前房间，不在房间内时返回 false
    pub fn leave_room(&self) -> Result<bool> {
        let Some(room_id) = self.current_room() else {
            return Ok(false);
        };
        self.client.send(Command::RoomLeave, Some(json!({})))?;
        *self.current_room.write() = None;
        info!("[Room] Left room {}", room_id);
        Ok(true)
    }

    pub fn send_chat(&self, content: &str) -> Result<()> {
        if self.current_room.read().is_none() {
            bail!("Not in a room");
        }
        let data = serde_json::to_value(ChatSendData {
            content: content.to_string(),
        })?;
        self.client.send(Command::RoomChatSend, Some(data))?;
        Ok(())
    }

    // ==================== 下行处理 ====================

    fn handle_chat(&self, data: &Value) {
        let message: ChatMessage = match serde_json::from_value(data.clone()) {
            Ok(message) => message,
            Err(e) => {
                warn!("[Room] Invalid chat message: {}", e);
                return;
            }
        };

        // 忽略系统消息和自己的消息
        let own_id = self.client.identity().map(|identity| identity.id);
        if message.system || own_id.as_deref() == Some(message.user.id.as_str()) {
            debug!("[Room] Skipping chat from {}", message.user.username);
            return;
        }

        self.client.emit(names::ROOM_CHAT_RECEIVED, data);
    }

    fn handle_update(&self, data: &Value) {
        info!("[Room] Room update: {}", data);
    }

    fn handle_player_add(&self, data: &Value) {
        info!("[Room] Player joined: {}", data);
        self.client.emit(names::ROOM_PLAYER_JOINED, data);
    }

    fn handle_player_remove(&self, data: &Value) {
        info!("[Room] Player left: {}", data);
        self.client.emit(names::ROOM_PLAYER_LEFT, data);
    }

    fn handle_join(&self, data: &Value) {
        info!("[Room] Joined room: {}", data);
    }
}

impl Feature for RoomModule {
    fn name(&self) -> &str {
        "room"
    }

    fn install(self: Arc<Self>, client: &RibbonClient) {
        let room = self.clone();
        client.register_handler(Command::RoomChat, move |data: &Value| room.handle_chat(data));
        let room = self.clone();
        client.register_handler(Command::RoomUpdate, move |data: &Value| {
            room.handle_update(data)
        });
        let room = self.clone();
        client.register_handler(Command::RoomPlayerAdd, move |data: &Value| {
            room.handle_player_add(data)
        });
        let room = self.clone();
        client.register_handler(Command::RoomPlayerRemove, move |data: &Value| {
            room.handle_player_remove(data)
        });
        let room = self;
        client.register_handler(Command::RoomJoin, move |data: &Value| room.handle_join(data));
    }
}
