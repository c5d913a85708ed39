//! 命令编解码
//!
//! 出站：`{command, data?}`；入站：`{command, data?, id?}`，
//! `packets` 批量包按原顺序拆成单条命令。

use crate::error::{Result, RibbonError};
use crate::events::Command;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Serialize)]
struct OutgoingEnvelope<'a> {
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Value>,
}

#[derive(Deserialize)]
struct IncomingEnvelope {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    id: Option<Value>,
}

/// 解码后的单条入站命令
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    /// 缺失 command 的包只用于更新 last received id
    pub command: Option<Command>,
    pub data: Value,
    pub id: Option<String>,
}

impl Frame {
    pub fn is(&self, command: &Command) -> bool {
        self.command.as_ref() == Some(command)
    }
}

/// 编码出站命令
pub fn encode(command: &Command, data: Option<&Value>) -> Result<String> {
    let envelope = OutgoingEnvelope {
        command: command.as_str(),
        data,
    };
    Ok(serde_json::to_string(&envelope)?)
}

/// 解码一个入站文本帧
///
/// 嵌套在 `packets` 中的 `packets` 直接丢弃，不做递归拆包。
pub fn decode(text: &str) -> Result<Vec<Frame>> {
    let envelope: IncomingEnvelope = serde_json::from_str(text)
        .map_err(|e| RibbonError::Protocol(format!("Malformed frame: {}", e)))?;

    if envelope.command.as_deref() != Some(Command::Packets.as_str()) {
        return Ok(vec![into_frame(envelope)]);
    }

    let packets = match envelope.data.as_ref().and_then(|d| d.get("packets")) {
        Some(Value::Array(packets)) => packets,
        Some(_) => {
            return Err(RibbonError::Protocol(
                "packets.data.packets is not a list".to_string(),
            ))
        }
        None => return Ok(Vec::new()),
    };

    let mut frames = Vec::with_capacity(packets.len());
    for packet in packets {
        let nested: IncomingEnvelope = match serde_json::from_value(packet.clone()) {
            Ok(nested) => nested,
            Err(e) => {
                tracing::warn!("[Codec] Skipping malformed packet in batch: {}", e);
                continue;
            }
        };
        if nested.command.as_deref() == Some(Command::Packets.as_str()) {
            continue;
        }
        frames.push(into_frame(nested));
    }
    Ok(frames)
}

fn into_frame(envelope: IncomingEnvelope) -> Frame {
    Frame {
        command: envelope.command.map(Command::from),
        data: envelope.data.unwrap_or(Value::Null),
        id: envelope.id.and_then(id_to_string),
    }
}

fn id_to_string(id: Value) -> Option<String> {
    match id {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
