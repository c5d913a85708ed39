//! 命令处理器注册表与事件总线
//!
//! - 处理器注册表：每个协议命令最多一个处理器，重复注册后者覆盖前者
//! - 事件总线：每个事件名可有多个订阅者，按注册顺序调用

use crate::events::Command;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// 协议命令处理器
pub type CommandHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// 事件订阅回调
pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// 订阅 ID，用于取消订阅
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

// ==================== 处理器注册表 ====================

#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<Command, CommandHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册处理器，返回被替换的旧处理器
    pub fn register(&self, command: Command, handler: CommandHandler) -> Option<CommandHandler> {
        let previous = self.handlers.write().insert(command.clone(), handler);
        if previous.is_some() {
            debug!("[Registry] Handler for {} replaced", command);
        }
        previous
    }

    pub fn unregister(&self, command: &Command) -> bool {
        self.handlers.write().remove(command).is_some()
    }

    pub fn contains(&self, command: &Command) -> bool {
        self.handlers.read().contains_key(command)
    }

    /// 调用命令对应的处理器，返回是否有处理器
    pub fn dispatch(&self, command: &Command, data: &Value) -> bool {
        // 先释放锁再调用，处理器内部可以再注册
        let handler = self.handlers.read().get(command).cloned();
        match handler {
            Some(handler) => {
                handler(data);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        self.handlers.write().clear();
    }
}

// ==================== 事件总线 ====================

#[derive(Default)]
pub struct EventBus {
    subscribers: RwLock<HashMap<String, Vec<(SubscriptionId, EventCallback)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, event: &str, callback: EventCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .write()
            .entry(event.to_string())
            .or_default()
            .push((id, callback));
        debug!("[EventBus] Subscribed to {}", event);
        id
    }

    pub fn unsubscribe(&self, event: &str, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(list) = subscribers.get_mut(event) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sub_id, _)| *sub_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(event);
        }
        removed
    }

    /// 发布事件，返回调用的订阅者数量
    pub fn emit(&self, event: &str, data: &Value) -> usize {
        let callbacks: Vec<EventCallback> = match self.subscribers.read().get(event) {
            Some(list) => list.iter().map(|(_, cb)| cb.clone()).collect(),
            None => Vec::new(),
        };
        debug!("[EventBus] Emitting {} to {} subscribers", event, callbacks.len());
        for callback in &callbacks {
            callback(data);
        }
        callbacks.len()
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers.read().get(event).map_or(0, Vec::len)
    }

    pub fn clear(&self) {
        self.subscribers.write().clear();
    }
}
