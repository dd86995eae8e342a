// file: src/protocol.rs
// description: Engine.IO v4 / Socket.IO v5 text packet codec and endpoint construction
// reference: https://socket.io/docs/v4/engine-io-protocol/ and https://socket.io/docs/v4/socket-io-protocol/

use crate::error::{SyncError, SyncResult};
use crate::types::JobId;
use serde::Deserialize;
use std::time::Duration;
use url::Url;

pub const ENGINE_IO_VERSION: &str = "4";
pub const DEFAULT_PATH: &str = "/socket.io/";
/// Query parameter the backend reads to scope a connection to one lesson.
pub const SUBSCRIPTION_PARAM: &str = "lesson_id";

/// Engine.IO open handshake body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenHandshake {
    pub sid: String,
    #[serde(default)]
    pub upgrades: Vec<String>,
    pub ping_interval: u64,
    pub ping_timeout: u64,
    #[serde(default)]
    pub max_payload: Option<u64>,
}

impl OpenHandshake {
    /// Silence longer than this means the server is gone.
    pub fn liveness_window(&self) -> Duration {
        Duration::from_millis(self.ping_interval + self.ping_timeout)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EnginePacket {
    Open(OpenHandshake),
    Close,
    Ping(String),
    Pong(String),
    Message(SocketPacket),
    Upgrade,
    Noop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketPacket {
    Connect {
        namespace: String,
        data: Option<serde_json::Value>,
    },
    Disconnect {
        namespace: String,
    },
    Event {
        namespace: String,
        ack_id: Option<u64>,
        name: String,
        payload: serde_json::Value,
    },
    Ack {
        namespace: String,
        ack_id: u64,
    },
    ConnectError {
        namespace: String,
        message: String,
    },
    /// Events with binary attachments; the attachments arrive as separate frames.
    Binary {
        namespace: String,
        attachments: u32,
    },
}

impl EnginePacket {
    pub fn parse(text: &str) -> SyncResult<Self> {
        let mut chars = text.chars();
        let kind = chars
            .next()
            .ok_or_else(|| SyncError::InvalidMessage("empty engine.io packet".into()))?;
        let body = chars.as_str();

        match kind {
            '0' => Ok(EnginePacket::Open(serde_json::from_str(body)?)),
            '1' => Ok(EnginePacket::Close),
            '2' => Ok(EnginePacket::Ping(body.to_string())),
            '3' => Ok(EnginePacket::Pong(body.to_string())),
            '4' => Ok(EnginePacket::Message(SocketPacket::parse(body)?)),
            '5' => Ok(EnginePacket::Upgrade),
            '6' => Ok(EnginePacket::Noop),
            other => Err(SyncError::InvalidMessage(format!(
                "unknown engine.io packet type '{other}'"
            ))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            EnginePacket::Open(_) => "0".to_string(),
            EnginePacket::Close => "1".to_string(),
            EnginePacket::Ping(body) => format!("2{body}"),
            EnginePacket::Pong(body) => format!("3{body}"),
            EnginePacket::Message(packet) => format!("4{}", packet.encode()),
            EnginePacket::Upgrade => "5".to_string(),
            EnginePacket::Noop => "6".to_string(),
        }
    }
}

impl SocketPacket {
    pub fn connect() -> Self {
        SocketPacket::Connect {
            namespace: "/".to_string(),
            data: None,
        }
    }

    pub fn disconnect() -> Self {
        SocketPacket::Disconnect {
            namespace: "/".to_string(),
        }
    }

    pub fn parse(body: &str) -> SyncResult<Self> {
        let mut rest = body;
        let kind = take_char(&mut rest)
            .ok_or_else(|| SyncError::InvalidMessage("empty socket.io packet".into()))?;

        let attachments = if matches!(kind, '5' | '6') {
            let (count, tail) = rest.split_once('-').ok_or_else(|| {
                SyncError::InvalidMessage("binary packet without attachment count".into())
            })?;
            rest = tail;
            count
                .parse::<u32>()
                .map_err(|e| SyncError::InvalidMessage(format!("bad attachment count: {e}")))?
        } else {
            0
        };

        let namespace = if rest.starts_with('/') {
            match rest.split_once(',') {
                Some((nsp, tail)) => {
                    rest = tail;
                    nsp.to_string()
                }
                None => {
                    let nsp = rest.to_string();
                    rest = "";
                    nsp
                }
            }
        } else {
            "/".to_string()
        };

        let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
        let ack_id = if digits > 0 {
            let (id, tail) = rest.split_at(digits);
            rest = tail;
            id.parse::<u64>().ok()
        } else {
            None
        };

        let data: Option<serde_json::Value> = if rest.is_empty() {
            None
        } else {
            Some(serde_json::from_str(rest)?)
        };

        match kind {
            '0' => Ok(SocketPacket::Connect { namespace, data }),
            '1' => Ok(SocketPacket::Disconnect { namespace }),
            '2' => {
                let (name, payload) = split_event(data)?;
                Ok(SocketPacket::Event {
                    namespace,
                    ack_id,
                    name,
                    payload,
                })
            }
            '3' => Ok(SocketPacket::Ack {
                namespace,
                ack_id: ack_id
                    .ok_or_else(|| SyncError::InvalidMessage("ack without id".into()))?,
            }),
            '4' => Ok(SocketPacket::ConnectError {
                namespace,
                message: connect_error_message(data),
            }),
            '5' | '6' => Ok(SocketPacket::Binary {
                namespace,
                attachments,
            }),
            other => Err(SyncError::InvalidMessage(format!(
                "unknown socket.io packet type '{other}'"
            ))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            SocketPacket::Connect { namespace, data } => {
                let mut out = format!("0{}", namespace_prefix(namespace));
                if let Some(data) = data {
                    out.push_str(&data.to_string());
                }
                out
            }
            SocketPacket::Disconnect { namespace } => format!("1{}", namespace_prefix(namespace)),
            SocketPacket::Event {
                namespace,
                ack_id,
                name,
                payload,
            } => {
                let ack = ack_id.map(|id| id.to_string()).unwrap_or_default();
                let args = serde_json::Value::Array(vec![
                    serde_json::Value::String(name.clone()),
                    payload.clone(),
                ]);
                format!("2{}{ack}{args}", namespace_prefix(namespace))
            }
            SocketPacket::Ack { namespace, ack_id } => {
                format!("3{}{ack_id}[]", namespace_prefix(namespace))
            }
            SocketPacket::ConnectError { namespace, message } => format!(
                "4{}{}",
                namespace_prefix(namespace),
                serde_json::json!({ "message": message })
            ),
            SocketPacket::Binary {
                namespace,
                attachments,
            } => format!("5{attachments}-{}", namespace_prefix(namespace)),
        }
    }
}

fn take_char(rest: &mut &str) -> Option<char> {
    let mut chars = rest.chars();
    let c = chars.next()?;
    *rest = chars.as_str();
    Some(c)
}

fn namespace_prefix(namespace: &str) -> String {
    if namespace == "/" {
        String::new()
    } else {
        format!("{namespace},")
    }
}

// Event data is `["name", arg0, ...]`; only the first argument is kept.
fn split_event(data: Option<serde_json::Value>) -> SyncResult<(String, serde_json::Value)> {
    let serde_json::Value::Array(mut args) = data.unwrap_or(serde_json::Value::Null) else {
        return Err(SyncError::InvalidMessage(
            "event data must be an array".into(),
        ));
    };
    if args.is_empty() {
        return Err(SyncError::InvalidMessage("event without a name".into()));
    }
    let name = match args.remove(0) {
        serde_json::Value::String(name) => name,
        other => {
            return Err(SyncError::InvalidMessage(format!(
                "event name must be a string, got {other}"
            )));
        }
    };
    let payload = if args.is_empty() {
        serde_json::Value::Null
    } else {
        args.swap_remove(0)
    };
    Ok((name, payload))
}

fn connect_error_message(data: Option<serde_json::Value>) -> String {
    match data {
        Some(serde_json::Value::Object(map)) => map
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("connect error")
            .to_string(),
        Some(serde_json::Value::String(s)) => s,
        Some(other) => other.to_string(),
        None => "connect error".to_string(),
    }
}

/// Builds the WebSocket endpoint for one job's subscription.
pub fn endpoint_url(base: &Url, path: &str, job_id: &JobId) -> SyncResult<Url> {
    let mut url = base.clone();
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SyncError::InvalidMessage(format!(
                "unsupported scheme '{other}'"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SyncError::InvalidMessage(format!("cannot switch scheme to {scheme}")))?;

    let path = if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    };
    url.set_path(&path);
    url.set_query(None);
    url.query_pairs_mut()
        .append_pair("EIO", ENGINE_IO_VERSION)
        .append_pair("transport", "websocket")
        .append_pair(SUBSCRIPTION_PARAM, job_id.as_str());
    Ok(url)
}
