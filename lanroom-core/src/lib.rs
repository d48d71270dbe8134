use std::path::Path;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PORT: u16 = 7645;
/// Senders refuse to offer files above this; the relay never checks.
pub const MAX_FILE_BYTES: u64 = 5 * 1024 * 1024;
pub const HOST_SUFFIX: &str = " (host)";
pub const USER_LIST_SEPARATOR: &str = ", ";

/// Every kind a frame can carry. The codec maps tags to kinds and back;
/// it never infers a kind from the other fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Join,
    Chat,
    System,
    NickChange,
    Ping,
    Pong,
    UserListRequest,
    UserListReply,
    FileOffer,
    FileAccept,
    FileReject,
    FileData,
    SignalRelay,
}

impl MessageKind {
    pub fn tag(self) -> &'static str {
        match self {
            MessageKind::Join => "join",
            MessageKind::Chat => "msg",
            MessageKind::System => "system",
            MessageKind::NickChange => "nick",
            MessageKind::Ping => "ping",
            MessageKind::Pong => "pong",
            MessageKind::UserListRequest => "userlist_req",
            MessageKind::UserListReply => "userlist",
            MessageKind::FileOffer => "fileoffer",
            MessageKind::FileAccept => "fileacc",
            MessageKind::FileReject => "filerej",
            MessageKind::FileData => "file",
            MessageKind::SignalRelay => "signal",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Some(match tag {
            "join" => MessageKind::Join,
            "msg" => MessageKind::Chat,
            "system" => MessageKind::System,
            "nick" => MessageKind::NickChange,
            "ping" => MessageKind::Ping,
            "pong" => MessageKind::Pong,
            "userlist_req" => MessageKind::UserListRequest,
            "userlist" => MessageKind::UserListReply,
            "fileoffer" => MessageKind::FileOffer,
            "fileacc" => MessageKind::FileAccept,
            "filerej" => MessageKind::FileReject,
            "file" => MessageKind::FileData,
            "signal" => MessageKind::SignalRelay,
            _ => return None,
        })
    }
}

impl Default for MessageKind {
    fn default() -> Self {
        MessageKind::System
    }
}

/// One unit of wire transmission. Field meaning depends on `kind`:
/// `text` is the chat body, system notice, new nickname, filename or
/// comma-joined user list; `payload` is a human-readable size string
/// (FileOffer), base64 bytes (FileData) or an opaque signaling blob
/// (SignalRelay). An empty `target` means broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub kind: MessageKind,
    pub nick: String,
    pub text: String,
    pub payload: String,
    pub target: String,
}

impl Message {
    pub fn new(kind: MessageKind) -> Self {
        Message {
            kind,
            ..Default::default()
        }
    }

    pub fn join(nick: &str) -> Self {
        Message {
            kind: MessageKind::Join,
            nick: nick.to_owned(),
            ..Default::default()
        }
    }

    pub fn chat(nick: &str, text: &str) -> Self {
        Message {
            kind: MessageKind::Chat,
            nick: nick.to_owned(),
            text: text.to_owned(),
            ..Default::default()
        }
    }

    pub fn system(text: &str) -> Self {
        Message {
            kind: MessageKind::System,
            text: text.to_owned(),
            ..Default::default()
        }
    }

    pub fn nick_change(old_nick: &str, new_nick: &str) -> Self {
        Message {
            kind: MessageKind::NickChange,
            nick: old_nick.to_owned(),
            text: new_nick.to_owned(),
            ..Default::default()
        }
    }

    pub fn user_list_reply(users: &str) -> Self {
        Message {
            kind: MessageKind::UserListReply,
            text: users.to_owned(),
            ..Default::default()
        }
    }

    pub fn file_offer(nick: &str, filename: &str, size: &str, target: &str) -> Self {
        Message {
            kind: MessageKind::FileOffer,
            nick: nick.to_owned(),
            text: filename.to_owned(),
            payload: size.to_owned(),
            target: target.to_owned(),
        }
    }

    pub fn file_data(nick: &str, filename: &str, encoded: String, target: &str) -> Self {
        Message {
            kind: MessageKind::FileData,
            nick: nick.to_owned(),
            text: filename.to_owned(),
            payload: encoded,
            target: target.to_owned(),
        }
    }

    pub fn signal(nick: &str, payload: &str, target: &str) -> Self {
        Message {
            kind: MessageKind::SignalRelay,
            nick: nick.to_owned(),
            payload: payload.to_owned(),
            target: target.to_owned(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("unknown message kind {0:?}")]
    UnknownMessageKind(String),
    #[error("invalid base64 payload: {0}")]
    InvalidPayload(String),
}

/// On-the-wire shape of a frame. Empty fields are omitted so small
/// frames (ping, pong) stay small.
#[derive(Serialize, Deserialize, Default)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    nick: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    data: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    target: String,
}

/// Serializes one message as a newline-terminated JSON frame.
pub fn encode_frame(message: &Message) -> Result<String, WireError> {
    let frame = WireFrame {
        kind: message.kind.tag().to_owned(),
        nick: message.nick.clone(),
        text: message.text.clone(),
        data: message.payload.clone(),
        target: message.target.clone(),
    };
    let mut line =
        serde_json::to_string(&frame).map_err(|err| WireError::MalformedFrame(err.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Decodes exactly one frame (the line terminator may be present or
/// already stripped). Performs no semantic validation; routing rules
/// belong to the relay.
pub fn decode_frame(line: &str) -> Result<Message, WireError> {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.is_empty() {
        return Err(WireError::MalformedFrame("empty frame".to_owned()));
    }
    let frame: WireFrame =
        serde_json::from_str(trimmed).map_err(|err| WireError::MalformedFrame(err.to_string()))?;
    let kind = MessageKind::from_tag(&frame.kind)
        .ok_or_else(|| WireError::UnknownMessageKind(frame.kind.clone()))?;
    Ok(Message {
        kind,
        nick: frame.nick,
        text: frame.text,
        payload: frame.data,
        target: frame.target,
    })
}

pub fn encode_file_payload(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

pub fn decode_file_payload(payload: &str) -> Result<Vec<u8>, WireError> {
    BASE64
        .decode(payload)
        .map_err(|err| WireError::InvalidPayload(err.to_string()))
}

/// Human-readable size string shown alongside file offers.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes}B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1}KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1}MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

/// Strips any directory components from a received filename so a
/// payload can never escape the download directory.
pub fn sanitize_filename(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .unwrap_or("download")
        .to_owned()
}
