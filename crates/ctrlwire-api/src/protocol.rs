//! Control-socket wire protocol.
//!
//! Outbound frames are [`Command`]s; inbound frames are [`Inbound`] messages
//! discriminated by their `type` field. The bare strings `"ping"` and
//! `"pong"` are keep-alive frames and never reach these types.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Keep-alive frame sent by the client.
pub const PING: &str = "ping";
/// Keep-alive reply sent by the server.
pub const PONG: &str = "pong";

// ── Outbound ────────────────────────────────────────────────────────

/// Verb of an outbound command.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum CommandKind {
    Bind,
    Unbind,
    Exec,
    Debug,
    Ignore,
}

/// A request frame: `{ id, cmd, sys, mod, index, name, args? }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: u64,
    pub cmd: CommandKind,
    pub sys: String,
    #[serde(rename = "mod")]
    pub module: String,
    pub index: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<Vec<Value>>,
}

// ── Inbound ─────────────────────────────────────────────────────────

/// Any structured frame the server pushes to us.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    /// Successful response to the command with the same `id`.
    Success {
        id: u64,
        #[serde(default)]
        value: Value,
    },
    /// Failed response to the command with the same `id`.
    Error {
        id: u64,
        code: i64,
        #[serde(default)]
        msg: String,
    },
    /// A bound variable changed.
    Notify {
        #[serde(default)]
        value: Value,
        meta: NotifyMeta,
    },
    /// Log line from a module under `debug`.
    Debug {
        #[serde(rename = "mod")]
        mod_id: String,
        #[serde(default)]
        klass: String,
        #[serde(default)]
        msg: String,
        #[serde(default)]
        level: String,
        meta: DebugMeta,
    },
}

/// Identifies the binding a `notify` frame belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotifyMeta {
    pub sys: String,
    #[serde(rename = "mod")]
    pub module: String,
    pub index: u32,
    pub name: String,
}

/// Identifies the module instance a `debug` frame came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugMeta {
    #[serde(rename = "mod")]
    pub module: String,
    pub index: u32,
}

// ── Error codes ─────────────────────────────────────────────────────

/// Error codes carried by `error` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ParseError,
    BadRequest,
    AccessDenied,
    RequestFailed,
    UnknownCmd,
    SystemNotFound,
    ModuleNotFound,
    UnexpectedFailure,
    Unknown(i64),
}

impl ErrorCode {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::ParseError => 0,
            Self::BadRequest => 1,
            Self::AccessDenied => 2,
            Self::RequestFailed => 3,
            Self::UnknownCmd => 4,
            Self::SystemNotFound => 5,
            Self::ModuleNotFound => 6,
            Self::UnexpectedFailure => 7,
            Self::Unknown(code) => code,
        }
    }
}

impl From<i64> for ErrorCode {
    fn from(code: i64) -> Self {
        match code {
            0 => Self::ParseError,
            1 => Self::BadRequest,
            2 => Self::AccessDenied,
            3 => Self::RequestFailed,
            4 => Self::UnknownCmd,
            5 => Self::SystemNotFound,
            6 => Self::ModuleNotFound,
            7 => Self::UnexpectedFailure,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParseError => f.write_str("PARSE_ERROR"),
            Self::BadRequest => f.write_str("BAD_REQUEST"),
            Self::AccessDenied => f.write_str("ACCESS_DENIED"),
            Self::RequestFailed => f.write_str("REQUEST_FAILED"),
            Self::UnknownCmd => f.write_str("UNKNOWN_CMD"),
            Self::SystemNotFound => f.write_str("SYSTEM_NOT_FOUND"),
            Self::ModuleNotFound => f.write_str("MODULE_NOT_FOUND"),
            Self::UnexpectedFailure => f.write_str("UNEXPECTED_FAILURE"),
            Self::Unknown(code) => write!(f, "UNKNOWN({code})"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_uses_wire_field_names() {
        let cmd = Command {
            id: 7,
            cmd: CommandKind::Exec,
            sys: "sys-1".into(),
            module: "Display".into(),
            index: 2,
            name: "power".into(),
            args: Some(vec![json!(true)]),
        };

        let value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(
            value,
            json!({
                "id": 7, "cmd": "exec", "sys": "sys-1", "mod": "Display",
                "index": 2, "name": "power", "args": [true]
            })
        );
    }

    #[test]
    fn command_omits_missing_args() {
        let cmd = Command {
            id: 1,
            cmd: CommandKind::Bind,
            sys: "sys-1".into(),
            module: "Light".into(),
            index: 1,
            name: "level".into(),
            args: None,
        };
        let text = serde_json::to_string(&cmd).unwrap();
        assert!(!text.contains("args"));
    }

    #[test]
    fn parses_success_without_value() {
        let msg: Inbound = serde_json::from_str(r#"{"id":3,"type":"success"}"#).unwrap();
        assert_eq!(
            msg,
            Inbound::Success {
                id: 3,
                value: Value::Null
            }
        );
    }

    #[test]
    fn parses_error_frame() {
        let msg: Inbound =
            serde_json::from_str(r#"{"id":4,"type":"error","code":6,"msg":"no such module"}"#)
                .unwrap();
        let Inbound::Error { id, code, msg } = msg else {
            panic!("expected error frame");
        };
        assert_eq!(id, 4);
        assert_eq!(ErrorCode::from(code), ErrorCode::ModuleNotFound);
        assert_eq!(msg, "no such module");
    }

    #[test]
    fn parses_notify_frame() {
        let raw = json!({
            "type": "notify",
            "value": "{\"on\":true}",
            "meta": { "sys": "sys-1", "mod": "Light", "index": 1, "name": "state" }
        });
        let msg: Inbound = serde_json::from_value(raw).unwrap();
        let Inbound::Notify { value, meta } = msg else {
            panic!("expected notify frame");
        };
        assert_eq!(value, json!("{\"on\":true}"));
        assert_eq!(meta.module, "Light");
        assert_eq!(meta.index, 1);
    }

    #[test]
    fn parses_debug_frame() {
        let raw = json!({
            "type": "debug", "mod": "mod-abc", "klass": "Lighting::Dali",
            "msg": "sent level 40", "level": "info",
            "meta": { "mod": "Light", "index": 1 }
        });
        let msg: Inbound = serde_json::from_value(raw).unwrap();
        let Inbound::Debug { mod_id, klass, meta, .. } = msg else {
            panic!("expected debug frame");
        };
        assert_eq!(mod_id, "mod-abc");
        assert_eq!(klass, "Lighting::Dali");
        assert_eq!(meta.index, 1);
    }

    #[test]
    fn error_codes_map_both_ways() {
        for code in 0..8 {
            assert_eq!(ErrorCode::from(code).as_i64(), code);
        }
        assert_eq!(ErrorCode::from(42), ErrorCode::Unknown(42));
        assert_eq!(ErrorCode::SystemNotFound.to_string(), "SYSTEM_NOT_FOUND");
    }

    #[test]
    fn command_kind_round_trips_through_strum() {
        assert_eq!(CommandKind::Unbind.as_ref(), "unbind");
        assert_eq!("ignore".parse::<CommandKind>().unwrap(), CommandKind::Ignore);
    }
}
