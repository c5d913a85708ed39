//! 社交功能模块：私信、邀请、在线状态

use anyhow::Result;
use ribbon_client::{names, Command, DirectMessageData, Feature, PresenceData, RibbonClient};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

pub struct SocialModule {
    client: RibbonClient,
}

impl SocialModule {
    pub fn new(client: RibbonClient) -> Arc<Self> {
        Arc::new(Self { client })
    }

    pub fn send_dm(&self, user_id: &str, message: &str) -> Result<()> {
        let data = serde_json::to_value(DirectMessageData {
            recipient: user_id.to_string(),
            msg: message.to_string(),
        })?;
        self.client.send(Command::SocialDm, Some(data))?;
        Ok(())
    }

    pub fn set_presence(&self, status: &str, detail: &str) -> Result<()> {
        let data = serde_json::to_value(PresenceData {
            status: status.to_string(),
            detail: detail.to_string(),
        })?;
        self.client.send(Command::SocialPresence, Some(data))?;
        Ok(())
    }

    fn is_self(&self, user_id: Option<&str>) -> bool {
        match (self.client.identity(), user_id) {
            (Some(identity), Some(user_id)) => identity.id == user_id,
            _ => false,
        }
    }

    // ==================== 下行处理 ====================

    fn handle_notification(&self, data: &Value) {
        self.client.emit(names::SOCIAL_NOTIFICATION_RECEIVED, data);
    }

    fn handle_dm(&self, data: &Value) {
        let message = data.get("data").unwrap_or(&Value::Null);
        let user = message.get("user").cloned().unwrap_or(Value::Null);
        if self.is_self(user.as_str()) {
            return;
        }

        debug!("[Social] DM from {}", user);
        self.client.emit(
            names::SOCIAL_DM_RECEIVED,
            &json!({
                "user": user,
                "content": message.get("content").cloned().unwrap_or(Value::Null),
                "system": message.get("system").and_then(Value::as_bool).unwrap_or(false),
                "raw": data,
            }),
        );
    }

    fn handle_invite(&self, data: &Value) {
        info!("[Social] Invite: {}", data);
        if self.is_self(data.get("sender").and_then(Value::as_str)) {
            return;
        }
        self.client.emit(names::SOCIAL_INVITE_RECEIVED, data);
    }

    fn handle_online(&self, data: &Value) {
        self.client.emit(names::SOCIAL_ONLINE, data);
    }
}

impl Feature for SocialModule {
    fn name(&self) -> &str {
        "social"
    }

    fn install(self: Arc<Self>, client: &RibbonClient) {
        let social = self.clone();
        client.register_handler(Command::SocialNotification, move |data: &Value| {
            social.handle_notification(data)
        });
        let social = self.clone();
        client.register_handler(Command::SocialDm, move |data: &Value| social.handle_dm(data));
        let social = self.clone();
        client.register_handler(Command::SocialInvite, move |data: &Value| {
            social.handle_invite(data)
        });
        let social = self;
        client.register_handler(Command::SocialOnline, move |data: &Value| {
            social.handle_online(data)
        });
    }
}
