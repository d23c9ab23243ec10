//! Companion Satellite text-line protocol codec.
//!
//! Frames are space-delimited: `COMMAND arg1 arg2 …`. Textual values are
//! percent-encoded; `KEY-STATE` carries tagged values (`COLOR:`,
//! `TEXT:`, `BITMAP:`) plus the bare `PRESSED`/`RELEASED` tokens, and
//! `VARIABLES-UPDATE` carries `name=value` pairs.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Everything except `[A-Za-z0-9-_.~]` is escaped, matching the
/// upstream's URI-component encoding.
const ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

pub fn encode_arg(value: &str) -> String {
    utf8_percent_encode(value, ENCODE_SET).to_string()
}

pub fn decode_arg(value: &str) -> Result<String, ProtocolError> {
    percent_decode_str(value)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| ProtocolError::InvalidArgument {
            command: "",
            argument: "percent-encoded value",
        })
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("empty frame")]
    EmptyFrame,

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    #[error("{command}: missing argument '{argument}'")]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },

    #[error("{command}: invalid argument '{argument}'")]
    InvalidArgument {
        command: &'static str,
        argument: &'static str,
    },
}

/// Capability tokens announced on `ADD-DEVICE`. Unknown tokens are
/// ignored; detected ones overlay the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    pub api_version: Option<String>,
    pub variables: bool,
    pub rotation: bool,
    pub variable_write: bool,
    pub key_images: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            api_version: None,
            variables: true,
            rotation: false,
            variable_write: false,
            key_images: true,
        }
    }
}

impl Capabilities {
    /// Overlays one announced token; unknown tokens are ignored.
    pub fn apply_token(&mut self, token: &str) {
        match token {
            "VARIABLES" => self.variables = true,
            "ROTATION" => self.rotation = true,
            "VARIABLE_WRITE" => self.variable_write = true,
            "KEY_IMAGES" => self.key_images = true,
            _ => {
                if let Some(version) = token.strip_prefix("API:") {
                    self.api_version = Some(version.to_string());
                }
            }
        }
    }
}

/// Last-seen rendering state of one key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64 bitmap payload, kept encoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitmap: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pressed: Option<bool>,
}

/// Frames the adapter sends upstream.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundFrame {
    Begin {
        device_id: String,
        product_name: String,
        keys_per_row: u32,
        keys_total: u32,
        bitmap_size: u32,
    },
    KeyPress {
        device_id: String,
        key_index: u32,
        pressed: bool,
    },
    KeyRotate {
        device_id: String,
        key_index: u32,
        /// `-1` for left, `1` for right.
        direction: i8,
    },
    KeysClear {
        device_id: String,
    },
    VariableValue {
        name: String,
        value: String,
    },
    Ping,
}

impl OutboundFrame {
    pub fn encode(&self) -> String {
        match self {
            OutboundFrame::Begin {
                device_id,
                product_name,
                keys_per_row,
                keys_total,
                bitmap_size,
            } => format!(
                "BEGIN {} {} {} {} {}",
                encode_arg(device_id),
                encode_arg(product_name),
                keys_per_row,
                keys_total,
                bitmap_size
            ),
            OutboundFrame::KeyPress {
                device_id,
                key_index,
                pressed,
            } => format!(
                "KEY-PRESS {} {} {}",
                encode_arg(device_id),
                key_index,
                if *pressed { "PRESSED" } else { "RELEASED" }
            ),
            OutboundFrame::KeyRotate {
                device_id,
                key_index,
                direction,
            } => format!(
                "KEY-ROTATE {} {} {}",
                encode_arg(device_id),
                key_index,
                direction
            ),
            OutboundFrame::KeysClear { device_id } => {
                format!("KEYS-CLEAR {}", encode_arg(device_id))
            }
            OutboundFrame::VariableValue { name, value } => {
                format!("VARIABLE-VALUE {}={}", encode_arg(name), encode_arg(value))
            }
            OutboundFrame::Ping => "PING".to_string(),
        }
    }
}

/// Frames the upstream sends to the adapter.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    AddDevice {
        device_id: String,
        capabilities: Vec<String>,
    },
    KeyState {
        device_id: String,
        key_index: u32,
        state: KeyState,
    },
    VariablesUpdate {
        variables: Vec<(String, String)>,
    },
    Brightness {
        device_id: String,
        level: u32,
    },
    Pong,
    Error {
        message: String,
    },
}

/// Parses one inbound line.
pub fn parse_line(line: &str) -> Result<InboundFrame, ProtocolError> {
    let mut tokens = line.split_whitespace();
    let command = tokens.next().ok_or(ProtocolError::EmptyFrame)?;

    match command {
        "ADD-DEVICE" => {
            let device_id = decode_arg(tokens.next().ok_or(ProtocolError::MissingArgument {
                command: "ADD-DEVICE",
                argument: "deviceId",
            })?)?;
            Ok(InboundFrame::AddDevice {
                device_id,
                capabilities: tokens.map(str::to_string).collect(),
            })
        }
        "KEY-STATE" => {
            let device_id = decode_arg(tokens.next().ok_or(ProtocolError::MissingArgument {
                command: "KEY-STATE",
                argument: "deviceId",
            })?)?;
            let key_index = tokens
                .next()
                .ok_or(ProtocolError::MissingArgument {
                    command: "KEY-STATE",
                    argument: "keyIndex",
                })?
                .parse()
                .map_err(|_| ProtocolError::InvalidArgument {
                    command: "KEY-STATE",
                    argument: "keyIndex",
                })?;

            let mut state = KeyState::default();
            for tag in tokens {
                if let Some(color) = tag.strip_prefix("COLOR:") {
                    state.color = Some(color.to_string());
                } else if let Some(text) = tag.strip_prefix("TEXT:") {
                    state.text = Some(decode_arg(text)?);
                } else if let Some(bitmap) = tag.strip_prefix("BITMAP:") {
                    BASE64.decode(bitmap).map_err(|_| {
                        ProtocolError::InvalidArgument {
                            command: "KEY-STATE",
                            argument: "bitmap",
                        }
                    })?;
                    state.bitmap = Some(bitmap.to_string());
                } else if tag == "PRESSED" {
                    state.pressed = Some(true);
                } else if tag == "RELEASED" {
                    state.pressed = Some(false);
                }
                // Unknown tags are ignored.
            }
            Ok(InboundFrame::KeyState {
                device_id,
                key_index,
                state,
            })
        }
        "VARIABLES-UPDATE" => {
            let mut variables = Vec::new();
            for token in tokens {
                let Some((name, value)) = token.split_once('=') else {
                    return Err(ProtocolError::InvalidArgument {
                        command: "VARIABLES-UPDATE",
                        argument: "name=value",
                    });
                };
                variables.push((decode_arg(name)?, decode_arg(value)?));
            }
            Ok(InboundFrame::VariablesUpdate { variables })
        }
        "BRIGHTNESS" => {
            let device_id = decode_arg(tokens.next().ok_or(ProtocolError::MissingArgument {
                command: "BRIGHTNESS",
                argument: "deviceId",
            })?)?;
            let level = tokens
                .next()
                .ok_or(ProtocolError::MissingArgument {
                    command: "BRIGHTNESS",
                    argument: "level",
                })?
                .parse()
                .map_err(|_| ProtocolError::InvalidArgument {
                    command: "BRIGHTNESS",
                    argument: "level",
                })?;
            Ok(InboundFrame::Brightness { device_id, level })
        }
        "PONG" => Ok(InboundFrame::Pong),
        "ERROR" => Ok(InboundFrame::Error {
            message: line["ERROR".len()..].trim().to_string(),
        }),
        other => Err(ProtocolError::UnknownCommand(other.to_string())),
    }
}

/// Lowercases a variable name and maps characters outside `[a-z0-9_]`
/// to `_`, producing the store path segment.
pub fn safe_variable_name(name: &str) -> String {
    name.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_frame_encodes_descriptor() {
        let frame = OutboundFrame::Begin {
            device_id: "desk left".to_string(),
            product_name: "Satellite Bridge".to_string(),
            keys_per_row: 8,
            keys_total: 32,
            bitmap_size: 72,
        };
        assert_eq!(
            frame.encode(),
            "BEGIN desk%20left Satellite%20Bridge 8 32 72"
        );
    }

    #[test]
    fn key_press_uses_bare_tokens() {
        let frame = OutboundFrame::KeyPress {
            device_id: "dev".to_string(),
            key_index: 5,
            pressed: true,
        };
        assert_eq!(frame.encode(), "KEY-PRESS dev 5 PRESSED");

        let frame = OutboundFrame::KeyPress {
            device_id: "dev".to_string(),
            key_index: 5,
            pressed: false,
        };
        assert_eq!(frame.encode(), "KEY-PRESS dev 5 RELEASED");
    }

    #[test]
    fn variable_value_percent_encodes_both_sides() {
        let frame = OutboundFrame::VariableValue {
            name: "cam name".to_string(),
            value: "wide & tight".to_string(),
        };
        assert_eq!(
            frame.encode(),
            "VARIABLE-VALUE cam%20name=wide%20%26%20tight"
        );
    }

    #[test]
    fn parse_add_device_collects_capability_tokens() {
        let frame = parse_line("ADD-DEVICE dev1 API:1.5 VARIABLES ROTATION MYSTERY").unwrap();
        let InboundFrame::AddDevice {
            device_id,
            capabilities,
        } = frame
        else {
            panic!("wrong frame");
        };
        assert_eq!(device_id, "dev1");

        let mut caps = Capabilities::default();
        for token in &capabilities {
            caps.apply_token(token);
        }
        assert_eq!(caps.api_version.as_deref(), Some("1.5"));
        assert!(caps.rotation);
        assert!(caps.variables);
        assert!(!caps.variable_write);
    }

    #[test]
    fn parse_key_state_tags() {
        let frame =
            parse_line("KEY-STATE dev1 3 COLOR:#ff0000 TEXT:Go%20Live PRESSED UNKNOWN:tag")
                .unwrap();
        let InboundFrame::KeyState {
            device_id,
            key_index,
            state,
        } = frame
        else {
            panic!("wrong frame");
        };
        assert_eq!(device_id, "dev1");
        assert_eq!(key_index, 3);
        assert_eq!(state.color.as_deref(), Some("#ff0000"));
        assert_eq!(state.text.as_deref(), Some("Go Live"));
        assert_eq!(state.pressed, Some(true));
        assert!(state.bitmap.is_none());
    }

    #[test]
    fn parse_key_state_validates_bitmap_base64() {
        let frame = parse_line("KEY-STATE dev1 0 BITMAP:aGVsbG8=").unwrap();
        let InboundFrame::KeyState { state, .. } = frame else {
            panic!("wrong frame");
        };
        assert_eq!(state.bitmap.as_deref(), Some("aGVsbG8="));

        assert!(parse_line("KEY-STATE dev1 0 BITMAP:!!notbase64!!").is_err());
    }

    #[test]
    fn parse_variables_update_decodes_pairs() {
        let frame = parse_line("VARIABLES-UPDATE tally=cam%201 scene=Main").unwrap();
        let InboundFrame::VariablesUpdate { variables } = frame else {
            panic!("wrong frame");
        };
        assert_eq!(
            variables,
            vec![
                ("tally".to_string(), "cam 1".to_string()),
                ("scene".to_string(), "Main".to_string())
            ]
        );
    }

    #[test]
    fn parse_error_keeps_the_full_message() {
        let frame = parse_line("ERROR something went badly wrong").unwrap();
        assert_eq!(
            frame,
            InboundFrame::Error {
                message: "something went badly wrong".to_string()
            }
        );
    }

    #[test]
    fn parse_rejects_unknown_and_empty() {
        assert!(matches!(
            parse_line("NOT-A-COMMAND x"),
            Err(ProtocolError::UnknownCommand(_))
        ));
        assert_eq!(parse_line("   "), Err(ProtocolError::EmptyFrame));
    }

    #[test]
    fn brightness_parses_level() {
        let frame = parse_line("BRIGHTNESS dev1 80").unwrap();
        assert_eq!(
            frame,
            InboundFrame::Brightness {
                device_id: "dev1".to_string(),
                level: 80
            }
        );
        assert!(parse_line("BRIGHTNESS dev1 high").is_err());
    }

    #[test]
    fn safe_variable_name_flattens_to_store_charset() {
        assert_eq!(safe_variable_name("Cam 1/Tally"), "cam_1_tally");
        assert_eq!(safe_variable_name("simple_name"), "simple_name");
        assert_eq!(safe_variable_name("ÜBER"), "_ber");
    }

    #[test]
    fn arg_encoding_round_trips() {
        for value in ["plain", "with space", "a&b=c", "ünïcode", "100%"] {
            assert_eq!(decode_arg(&encode_arg(value)).unwrap(), value);
        }
    }
}
