//! Bot 业务逻辑层
//!
//! 在 ribbon-client 之上实现房间和社交功能模块，并由 BotService 统一装配

mod room;
mod service;
mod social;

#[cfg(test)]
mod testing;

pub use room::RoomModule;
pub use service::BotService;
pub use social::SocialModule;
