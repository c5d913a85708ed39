//! Ribbon 命令与事件定义
//!
//! 定义 client 和 server 之间的所有命令，以及对外发布的应用层事件名

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

// ==================== 命令 ====================

/// 协议命令
///
/// 已知命令为封闭集合，未知命令保留原始名称。
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Command {
    // 握手 / 控制
    New,
    Session,
    Authorize,
    Migrate,
    Migrated,
    Ping,
    Kick,
    Packets,

    // 房间
    RoomJoin,
    RoomLeave,
    RoomChat,
    RoomChatSend,
    RoomUpdate,
    RoomPlayerAdd,
    RoomPlayerRemove,

    // 社交
    SocialNotification,
    SocialDm,
    SocialInvite,
    SocialOnline,
    SocialPresence,

    /// 未识别的命令
    Other(String),
}

impl Command {
    pub fn as_str(&self) -> &str {
        match self {
            Command::New => "new",
            Command::Session => "session",
            Command::Authorize => "server.authorize",
            Command::Migrate => "server.migrate",
            Command::Migrated => "server.migrated",
            Command::Ping => "ping",
            Command::Kick => "kick",
            Command::Packets => "packets",
            Command::RoomJoin => "room.join",
            Command::RoomLeave => "room.leave",
            Command::RoomChat => "room.chat",
            Command::RoomChatSend => "room.chat.send",
            Command::RoomUpdate => "room.update",
            Command::RoomPlayerAdd => "room.player.add",
            Command::RoomPlayerRemove => "room.player.remove",
            Command::SocialNotification => "social.notification",
            Command::SocialDm => "social.dm",
            Command::SocialInvite => "social.invite",
            Command::SocialOnline => "social.online",
            Command::SocialPresence => "social.presence",
            Command::Other(name) => name,
        }
    }

    /// 发送日志中需要隐藏的命令（心跳太频繁，authorize 含 token）
    pub fn is_quiet(&self) -> bool {
        matches!(self, Command::Ping | Command::Authorize)
    }
}

impl From<&str> for Command {
    fn from(name: &str) -> Self {
        match name {
            "new" => Command::New,
            "session" => Command::Session,
            "server.authorize" => Command::Authorize,
            "server.migrate" => Command::Migrate,
            "server.migrated" => Command::Migrated,
            "ping" => Command::Ping,
            "kick" => Command::Kick,
            "packets" => Command::Packets,
            "room.join" => Command::RoomJoin,
            "room.leave" => Command::RoomLeave,
            "room.chat" => Command::RoomChat,
            "room.chat.send" => Command::RoomChatSend,
            "room.update" => Command::RoomUpdate,
            "room.player.add" => Command::RoomPlayerAdd,
            "room.player.remove" => Command::RoomPlayerRemove,
            "social.notification" => Command::SocialNotification,
            "social.dm" => Command::SocialDm,
            "social.invite" => Command::SocialInvite,
            "social.online" => Command::SocialOnline,
            "social.presence" => Command::SocialPresence,
            other => Command::Other(other.to_string()),
        }
    }
}

impl From<String> for Command {
    fn from(name: String) -> Self {
        Command::from(name.as_str())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Command {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Command::from(name))
    }
}

// ==================== 应用层事件 ====================

/// 对外发布的应用层事件名
pub mod names {
    /// 授权完成，client 可用
    pub const READY: &str = "ready";
    /// 迁移完成
    pub const MIGRATED: &str = "migrated";
    /// client 进入 Closed
    pub const DISCONNECTED: &str = "disconnected";

    pub const ROOM_CHAT_RECEIVED: &str = "room.chat.received";
    pub const ROOM_PLAYER_JOINED: &str = "room.player.joined";
    pub const ROOM_PLAYER_LEFT: &str = "room.player.left";

    pub const SOCIAL_NOTIFICATION_RECEIVED: &str = "social.notification.received";
    pub const SOCIAL_DM_RECEIVED: &str = "social.dm.received";
    pub const SOCIAL_INVITE_RECEIVED: &str = "social.invite.received";
    pub const SOCIAL_ONLINE: &str = "social.online";
}

// ==================== 上行数据 (Client → Server) ====================

/// 迁移后恢复会话
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(rename = "ribbonid", default)]
    pub ribbon_id: String,
    #[serde(rename = "tokenid", default)]
    pub token_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorizeData<'a> {
    pub token: &'a str,
    pub handling: crate::session::Handling,
    pub signature: &'a serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingData {
    pub recvid: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceData {
    pub status: String,
    pub detail: String,
}

impl Default for PresenceData {
    fn default() -> Self {
        Self {
            status: "online".to_string(),
            detail: "menus".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSendData {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectMessageData {
    pub recipient: String,
    pub msg: String,
}

// ==================== 下行数据 (Server → Client) ====================

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KickData {
    #[serde(default)]
    pub reason: Option<String>,
}

/// 房间聊天消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub content_safe: String,
    #[serde(default)]
    pub user: ChatUser,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub system: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatUser {
    #[serde(rename = "_id", default)]
    pub id: String,
    #[serde(default)]
    pub username: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}
