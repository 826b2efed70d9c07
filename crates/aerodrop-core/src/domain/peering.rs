//! Commands exchanged over the direct connection.
//!
//! The control channel carries [`ControlCommand`]s; every transfer channel
//! starts with [`TransferCommand`]s and then switches to raw binary frames.

use serde::{Deserialize, Serialize};

use super::error::AerodropError;

/// Label of the long-lived control channel.
pub const CONTROL_CHANNEL_LABEL: &str = "command";

/// Prefix of a transfer channel label; the file id follows it.
pub const TRANSFER_CHANNEL_PREFIX: &str = "transfer-";

pub fn transfer_label(file_id: &str) -> String {
    format!("{TRANSFER_CHANNEL_PREFIX}{file_id}")
}

/// File id encoded in a transfer channel label.
pub fn file_id_from_label(label: &str) -> Option<&str> {
    label
        .strip_prefix(TRANSFER_CHANNEL_PREFIX)
        .filter(|id| !id.is_empty())
}

// ---------------------------------------------------------------------------
// Control channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(rename = "type")]
    pub mime_type: String,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: String,
    pub metadata: FileMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlCommand {
    Message { message: String },
    File { file: FileDescriptor },
}

// ---------------------------------------------------------------------------
// Transfer channel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TransferCommand {
    FileRequest {
        #[serde(rename = "fileId")]
        file_id: String,
    },
    ReadyToUpload {
        #[serde(rename = "bufferSize")]
        buffer_size: u64,
    },
    BeginBinary,
    Error {
        message: String,
    },
}

macro_rules! json_command {
    ($ty:ty) => {
        impl $ty {
            pub fn encode(&self) -> String {
                // Plain enums of strings and integers always serialize.
                serde_json::to_string(self).unwrap_or_default()
            }

            pub fn decode(data: &str) -> Result<Self, AerodropError> {
                serde_json::from_str(data).map_err(|e| {
                    AerodropError::violation(format!(
                        "bad {}: {e}",
                        stringify!($ty)
                    ))
                })
            }
        }
    };
}

json_command!(ControlCommand);
json_command!(TransferCommand);

/// Lifecycle of one transfer channel, seen from either side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Opening,
    /// Sender waiting for `FileRequest`.
    AwaitRequest,
    /// Receiver waiting for `ReadyToUpload`.
    AwaitReady,
    Streaming,
    Complete,
    Cancelled,
    Errored,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Cancelled | Self::Errored)
    }
}

/// Whole percent of `done` over `total`, rounded down. An empty file is 100%.
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.min(total) * 100 / total) as u8
}

/// File name safe to create inside a download directory: path separators,
/// control characters and leading dots are replaced. Never empty.
pub fn sanitize_file_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    let cleaned = cleaned.trim().trim_start_matches('.');
    if cleaned.is_empty() {
        "download".to_owned()
    } else {
        cleaned.to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[test]
    fn control_commands_match_wire_format() {
        let msg = ControlCommand::Message {
            message: "hi".into(),
        };
        assert_eq!(
            serde_json::from_str::<Value>(&msg.encode()).unwrap(),
            json!({"type": "message", "message": "hi"})
        );

        let offer = ControlCommand::File {
            file: FileDescriptor {
                id: "f1".into(),
                metadata: FileMetadata {
                    mime_type: "text/plain".into(),
                    name: "notes.txt".into(),
                    size: 5,
                },
            },
        };
        assert_eq!(
            serde_json::from_str::<Value>(&offer.encode()).unwrap(),
            json!({"type": "file", "file": {"id": "f1", "metadata": {"type": "text/plain", "name": "notes.txt", "size": 5}}})
        );
    }

    #[test]
    fn transfer_commands_match_wire_format() {
        let cases = [
            (
                TransferCommand::FileRequest { file_id: "f1".into() },
                json!({"type": "file-request", "fileId": "f1"}),
            ),
            (
                TransferCommand::ReadyToUpload { buffer_size: 50_000 },
                json!({"type": "ready-to-upload", "bufferSize": 50_000}),
            ),
            (TransferCommand::BeginBinary, json!({"type": "begin-binary"})),
            (
                TransferCommand::Error { message: "File not found".into() },
                json!({"type": "error", "message": "File not found"}),
            ),
        ];
        for (command, wire) in cases {
            assert_eq!(serde_json::from_str::<Value>(&command.encode()).unwrap(), wire);
            assert_eq!(TransferCommand::decode(&wire.to_string()).unwrap(), command);
        }
    }

    #[test]
    fn unknown_command_is_violation() {
        let err = ControlCommand::decode(r#"{"type":"dance"}"#).unwrap_err();
        assert!(matches!(err, AerodropError::ProtocolViolation(_)));
        let err = TransferCommand::decode("[1,2]").unwrap_err();
        assert!(matches!(err, AerodropError::ProtocolViolation(_)));
    }

    #[test]
    fn labels() {
        assert_eq!(transfer_label("abc"), "transfer-abc");
        assert_eq!(file_id_from_label("transfer-abc"), Some("abc"));
        assert_eq!(file_id_from_label("transfer-"), None);
        assert_eq!(file_id_from_label(CONTROL_CHANNEL_LABEL), None);
    }

    #[test]
    fn progress_rounds_down() {
        assert_eq!(progress_percent(0, 50_000), 0);
        assert_eq!(progress_percent(16_384, 50_000), 32);
        assert_eq!(progress_percent(49_999, 50_000), 99);
        assert_eq!(progress_percent(50_000, 50_000), 100);
        assert_eq!(progress_percent(0, 0), 100);
    }

    #[test]
    fn terminal_states() {
        assert!(TransferState::Complete.is_terminal());
        assert!(TransferState::Errored.is_terminal());
        assert!(!TransferState::Streaming.is_terminal());
    }

    #[test]
    fn file_names_cannot_escape_the_download_dir() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_file_name("a\\b:c"), "a_b_c");
        assert_eq!(sanitize_file_name(".."), "download");
        assert_eq!(sanitize_file_name("  "), "download");
    }
}
