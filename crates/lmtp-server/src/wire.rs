//! Parses the demonstrator binary's newline-delimited JSON command lines
//! into [`Command`]. This framing is a stand-in: the real wire protocol is
//! out of scope for this crate.

use lmtp_core::kwargs::Kwargs;
use lmtp_server::server::session::Command;
use serde::Deserialize;
use std::collections::HashMap;

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireCommand {
    Generate {
        model: String,
        stream_id: u64,
        prompt: Vec<u32>,
        #[serde(default)]
        logit_bias: HashMap<String, f32>,
        #[serde(default)]
        kwargs: Kwargs,
    },
    Score {
        model: String,
        stream_id: u64,
        prompt: Vec<u32>,
        scored: Vec<u32>,
        #[serde(default)]
        kwargs: Kwargs,
    },
    ModelInfo {
        model: String,
        stream_id: u64,
    },
    Cancel {
        stream_id: u64,
        target_stream_id: u64,
    },
}

impl From<WireCommand> for Command {
    fn from(wire: WireCommand) -> Self {
        match wire {
            WireCommand::Generate {
                model,
                stream_id,
                prompt,
                logit_bias,
                kwargs,
            } => Command::Generate {
                model,
                stream_id,
                prompt,
                logit_bias: logit_bias
                    .into_iter()
                    .filter_map(|(k, v)| k.parse::<u32>().ok().map(|token| (token, v)))
                    .collect(),
                kwargs,
            },
            WireCommand::Score {
                model,
                stream_id,
                prompt,
                scored,
                kwargs,
            } => Command::Score {
                model,
                stream_id,
                prompt,
                scored,
                kwargs,
            },
            WireCommand::ModelInfo { model, stream_id } => Command::ModelInfo { model, stream_id },
            WireCommand::Cancel {
                stream_id,
                target_stream_id,
            } => Command::Cancel {
                stream_id,
                target_stream_id,
            },
        }
    }
}

/// Parses one line into a [`Command`]. Never fails: a line that isn't valid
/// JSON, names a `type` we don't recognize, or is missing fields a known
/// type requires becomes [`Command::Unknown`] so the session can still emit
/// a client-visible error, per spec.md §4.6/§7.
pub fn parse_command(line: &str) -> Command {
    let value: serde_json::Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(_) => {
            return Command::Unknown {
                stream_id: 0,
                cmd: line.to_string(),
            };
        }
    };

    let cmd = value
        .get("type")
        .and_then(|v| v.as_str())
        .unwrap_or("<missing type>")
        .to_string();
    let stream_id = value.get("stream_id").and_then(|v| v.as_u64()).unwrap_or(0);

    match serde_json::from_value::<WireCommand>(value) {
        Ok(wire) => wire.into(),
        Err(_) => Command::Unknown { stream_id, cmd },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generate_with_defaults() {
        let cmd = parse_command(r#"{"type":"generate","model":"demo","stream_id":1,"prompt":[1,2,3]}"#);
        match cmd {
            Command::Generate { model, stream_id, prompt, .. } => {
                assert_eq!(model, "demo");
                assert_eq!(stream_id, 1);
                assert_eq!(prompt, vec![1, 2, 3]);
            }
            _ => panic!("expected Generate"),
        }
    }

    #[test]
    fn parses_cancel() {
        let cmd = parse_command(r#"{"type":"cancel","stream_id":1,"target_stream_id":7}"#);
        match cmd {
            Command::Cancel { stream_id, target_stream_id } => {
                assert_eq!(stream_id, 1);
                assert_eq!(target_stream_id, 7);
            }
            _ => panic!("expected Cancel"),
        }
    }

    #[test]
    fn unknown_type_becomes_unknown_command() {
        let cmd = parse_command(r#"{"type":"frobnicate","stream_id":9}"#);
        match cmd {
            Command::Unknown { stream_id, cmd } => {
                assert_eq!(stream_id, 9);
                assert_eq!(cmd, "frobnicate");
            }
            _ => panic!("expected Unknown"),
        }
    }

    #[test]
    fn malformed_json_becomes_unknown_command() {
        let cmd = parse_command("not json at all");
        assert!(matches!(cmd, Command::Unknown { .. }));
    }
}
