//! Binary wire protocol between clients and the broker.
//!
//! Every WebSocket message is binary: one kind byte followed by the payload.
//! Terminal data travels as raw bytes, session output as a length-prefixed
//! id plus raw bytes, and everything else as UTF-8 JSON delimited by the
//! frame itself. Decoding never panics; malformed input surfaces as a
//! recoverable [`ProtocolError`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while decoding a frame.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty frame")]
    Empty,

    #[error("unknown message kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("truncated payload")]
    Truncated,

    #[error("invalid JSON payload: {0}")]
    Json(#[source] serde_json::Error),

    #[error("session id is not valid UTF-8")]
    InvalidSessionId,
}

/// Message kinds, one per frame type on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    TerminalData = 0x00,
    Resize = 0x01,
    Ping = 0x02,
    Pong = 0x03,
    SessionControl = 0x04,
    Auth = 0x05,
    Error = 0x06,
    SessionList = 0x07,
    AuthOk = 0x08,
    SessionOutput = 0x09,
    FileList = 0x0a,
    FileRead = 0x0b,
    FileContent = 0x0c,
    FileWrite = 0x0d,
}

impl TryFrom<u8> for MessageKind {
    type Error = ProtocolError;

    fn try_from(byte: u8) -> Result<Self, ProtocolError> {
        match byte {
            0x00 => Ok(Self::TerminalData),
            0x01 => Ok(Self::Resize),
            0x02 => Ok(Self::Ping),
            0x03 => Ok(Self::Pong),
            0x04 => Ok(Self::SessionControl),
            0x05 => Ok(Self::Auth),
            0x06 => Ok(Self::Error),
            0x07 => Ok(Self::SessionList),
            0x08 => Ok(Self::AuthOk),
            0x09 => Ok(Self::SessionOutput),
            0x0a => Ok(Self::FileList),
            0x0b => Ok(Self::FileRead),
            0x0c => Ok(Self::FileContent),
            0x0d => Ok(Self::FileWrite),
            other => Err(ProtocolError::UnknownKind(other)),
        }
    }
}

/// Error codes surfaced in `ERROR` frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    AuthTimeout,
    AuthFailed,
    AuthRequired,
    NoSession,
    MissingSessionId,
    SessionNotFound,
    FileError,
    RateLimited,
    ParseError,
}

/// `RESIZE` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resize {
    pub cols: u16,
    pub rows: u16,
}

/// Actions within the `SESSION_CONTROL` sub-protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Create,
    Attach,
    Detach,
    Destroy,
    List,
}

/// `SESSION_CONTROL` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionControl {
    pub action: ControlAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cols: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows: Option<u16>,
}

impl SessionControl {
    /// Shorthand for an action with no arguments.
    #[must_use]
    pub fn action(action: ControlAction) -> Self {
        Self {
            action,
            session_id: None,
            name: None,
            cwd: None,
            cols: None,
            rows: None,
        }
    }
}

/// `AUTH` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    pub token: String,
}

/// `ERROR` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub code: ErrorCode,
    pub message: String,
}

/// One entry of a `SESSION_LIST` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub name: String,
    pub cwd: String,
    /// Unix millis.
    pub created_at: u64,
    /// Unix millis.
    pub last_activity: u64,
    /// Whether a client is currently attached.
    pub connected: bool,
    pub pid: Option<u32>,
}

/// `AUTH_OK` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthOk {
    pub status: String,
}

impl Default for AuthOk {
    fn default() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

/// File kind in a directory listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    File,
    Directory,
}

/// One entry of a `FILE_LIST` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FileKind,
    pub size: u64,
}

/// `FILE_LIST` payload. Requests carry only `path`; responses add `files`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileList {
    pub path: String,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

/// `FILE_READ` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRead {
    pub path: String,
}

/// `FILE_CONTENT` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContent {
    pub path: String,
    pub content: String,
    pub language: String,
}

/// `FILE_WRITE` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileWrite {
    pub path: String,
    pub content: String,
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    TerminalData(Vec<u8>),
    Resize(Resize),
    Ping,
    Pong,
    SessionControl(SessionControl),
    Auth(Auth),
    Error(ErrorMessage),
    SessionList(Vec<SessionInfo>),
    AuthOk(AuthOk),
    SessionOutput { session_id: String, data: Vec<u8> },
    FileList(FileList),
    FileRead(FileRead),
    FileContent(FileContent),
    FileWrite(FileWrite),
}

impl Frame {
    /// The kind byte this frame encodes to.
    #[must_use]
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::TerminalData(_) => MessageKind::TerminalData,
            Self::Resize(_) => MessageKind::Resize,
            Self::Ping => MessageKind::Ping,
            Self::Pong => MessageKind::Pong,
            Self::SessionControl(_) => MessageKind::SessionControl,
            Self::Auth(_) => MessageKind::Auth,
            Self::Error(_) => MessageKind::Error,
            Self::SessionList(_) => MessageKind::SessionList,
            Self::AuthOk(_) => MessageKind::AuthOk,
            Self::SessionOutput { .. } => MessageKind::SessionOutput,
            Self::FileList(_) => MessageKind::FileList,
            Self::FileRead(_) => MessageKind::FileRead,
            Self::FileContent(_) => MessageKind::FileContent,
            Self::FileWrite(_) => MessageKind::FileWrite,
        }
    }

    /// Shorthand for an `ERROR` frame.
    #[must_use]
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error(ErrorMessage {
            code,
            message: message.into(),
        })
    }

    /// Encode to wire bytes: kind byte + payload.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        fn with_json<T: Serialize>(kind: MessageKind, payload: &T) -> Vec<u8> {
            let mut out = vec![kind as u8];
            // These payload types serialize infallibly.
            if let Ok(json) = serde_json::to_vec(payload) {
                out.extend_from_slice(&json);
            }
            out
        }

        match self {
            Self::TerminalData(data) => {
                let mut out = Vec::with_capacity(1 + data.len());
                out.push(MessageKind::TerminalData as u8);
                out.extend_from_slice(data);
                out
            }
            Self::Resize(payload) => with_json(MessageKind::Resize, payload),
            Self::Ping => vec![MessageKind::Ping as u8],
            Self::Pong => vec![MessageKind::Pong as u8],
            Self::SessionControl(payload) => with_json(MessageKind::SessionControl, payload),
            Self::Auth(payload) => with_json(MessageKind::Auth, payload),
            Self::Error(payload) => with_json(MessageKind::Error, payload),
            Self::SessionList(payload) => with_json(MessageKind::SessionList, payload),
            Self::AuthOk(payload) => with_json(MessageKind::AuthOk, payload),
            Self::SessionOutput { session_id, data } => {
                let id = session_id.as_bytes();
                let mut out = Vec::with_capacity(5 + id.len() + data.len());
                out.push(MessageKind::SessionOutput as u8);
                out.extend_from_slice(&(id.len() as u32).to_le_bytes());
                out.extend_from_slice(id);
                out.extend_from_slice(data);
                out
            }
            Self::FileList(payload) => with_json(MessageKind::FileList, payload),
            Self::FileRead(payload) => with_json(MessageKind::FileRead, payload),
            Self::FileContent(payload) => with_json(MessageKind::FileContent, payload),
            Self::FileWrite(payload) => with_json(MessageKind::FileWrite, payload),
        }
    }

    /// Decode wire bytes. Fails with a recoverable error on any malformed
    /// input; never panics.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let (&kind_byte, payload) = data.split_first().ok_or(ProtocolError::Empty)?;
        let kind = MessageKind::try_from(kind_byte)?;

        fn json<T: for<'de> Deserialize<'de>>(payload: &[u8]) -> Result<T, ProtocolError> {
            serde_json::from_slice(payload).map_err(ProtocolError::Json)
        }

        match kind {
            MessageKind::TerminalData => Ok(Self::TerminalData(payload.to_vec())),
            MessageKind::Resize => Ok(Self::Resize(json(payload)?)),
            MessageKind::Ping => Ok(Self::Ping),
            MessageKind::Pong => Ok(Self::Pong),
            MessageKind::SessionControl => Ok(Self::SessionControl(json(payload)?)),
            MessageKind::Auth => Ok(Self::Auth(json(payload)?)),
            MessageKind::Error => Ok(Self::Error(json(payload)?)),
            MessageKind::SessionList => Ok(Self::SessionList(json(payload)?)),
            MessageKind::AuthOk => Ok(Self::AuthOk(json(payload)?)),
            MessageKind::SessionOutput => {
                let (session_id, data) = decode_session_output(payload)?;
                Ok(Self::SessionOutput { session_id, data })
            }
            MessageKind::FileList => Ok(Self::FileList(json(payload)?)),
            MessageKind::FileRead => Ok(Self::FileRead(json(payload)?)),
            MessageKind::FileContent => Ok(Self::FileContent(json(payload)?)),
            MessageKind::FileWrite => Ok(Self::FileWrite(json(payload)?)),
        }
    }
}

/// Split a `SESSION_OUTPUT` payload into `(session_id, data)`.
fn decode_session_output(payload: &[u8]) -> Result<(String, Vec<u8>), ProtocolError> {
    if payload.len() < 4 {
        return Err(ProtocolError::Truncated);
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&payload[..4]);
    let id_len = u32::from_le_bytes(len_bytes) as usize;

    let rest = &payload[4..];
    if rest.len() < id_len {
        return Err(ProtocolError::Truncated);
    }

    let id = std::str::from_utf8(&rest[..id_len])
        .map_err(|_| ProtocolError::InvalidSessionId)?
        .to_string();
    Ok((id, rest[id_len..].to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_bytes_match_wire_table() {
        assert_eq!(MessageKind::TerminalData as u8, 0x00);
        assert_eq!(MessageKind::Resize as u8, 0x01);
        assert_eq!(MessageKind::Ping as u8, 0x02);
        assert_eq!(MessageKind::Pong as u8, 0x03);
        assert_eq!(MessageKind::SessionControl as u8, 0x04);
        assert_eq!(MessageKind::Auth as u8, 0x05);
        assert_eq!(MessageKind::Error as u8, 0x06);
        assert_eq!(MessageKind::SessionList as u8, 0x07);
        assert_eq!(MessageKind::AuthOk as u8, 0x08);
        assert_eq!(MessageKind::SessionOutput as u8, 0x09);
        assert_eq!(MessageKind::FileList as u8, 0x0a);
        assert_eq!(MessageKind::FileRead as u8, 0x0b);
        assert_eq!(MessageKind::FileContent as u8, 0x0c);
        assert_eq!(MessageKind::FileWrite as u8, 0x0d);
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let frames = vec![
            Frame::TerminalData(b"ls -la\r".to_vec()),
            Frame::TerminalData(vec![]),
            Frame::Resize(Resize {
                cols: 120,
                rows: 40,
            }),
            Frame::Ping,
            Frame::Pong,
            Frame::SessionControl(SessionControl {
                action: ControlAction::Create,
                session_id: None,
                name: Some("work".into()),
                cwd: Some("/tmp".into()),
                cols: Some(80),
                rows: Some(24),
            }),
            Frame::SessionControl(SessionControl {
                action: ControlAction::Attach,
                session_id: Some("ab12cd34".into()),
                name: None,
                cwd: None,
                cols: None,
                rows: None,
            }),
            Frame::Auth(Auth {
                token: "header.payload.sig".into(),
            }),
            Frame::error(ErrorCode::SessionNotFound, "session not found: zz"),
            Frame::SessionList(vec![SessionInfo {
                id: "ab12cd34".into(),
                name: "session-ab12cd34".into(),
                cwd: "/tmp".into(),
                created_at: 1706140800000,
                last_activity: 1706140801234,
                connected: true,
                pid: Some(4242),
            }]),
            Frame::SessionList(vec![]),
            Frame::AuthOk(AuthOk::default()),
            Frame::SessionOutput {
                session_id: "ab12cd34".into(),
                data: vec![0x1b, b'[', b'3', b'1', b'm', 0x00, 0xff],
            },
            Frame::FileList(FileList {
                path: ".".into(),
                files: vec![FileEntry {
                    name: "src".into(),
                    kind: FileKind::Directory,
                    size: 0,
                }],
            }),
            Frame::FileRead(FileRead {
                path: "notes.md".into(),
            }),
            Frame::FileContent(FileContent {
                path: "notes.md".into(),
                content: "# notes\n".into(),
                language: "markdown".into(),
            }),
            Frame::FileWrite(FileWrite {
                path: "out.txt".into(),
                content: "hello".into(),
            }),
        ];

        for frame in frames {
            let encoded = frame.encode();
            let decoded = Frame::decode(&encoded).expect("decode");
            assert_eq!(frame, decoded, "roundtrip failed for {frame:?}");
        }
    }

    #[test]
    fn test_session_output_binary_payload() {
        let frame = Frame::SessionOutput {
            session_id: "deadbeef".into(),
            data: (0u8..=255).collect(),
        };
        let encoded = frame.encode();
        assert_eq!(encoded[0], 0x09);
        assert_eq!(&encoded[1..5], &8u32.to_le_bytes());
        assert_eq!(&encoded[5..13], b"deadbeef");
        match Frame::decode(&encoded).unwrap() {
            Frame::SessionOutput { session_id, data } => {
                assert_eq!(session_id, "deadbeef");
                assert_eq!(data, (0u8..=255).collect::<Vec<u8>>());
            }
            other => panic!("expected SessionOutput, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_rejects_empty_and_unknown() {
        assert!(matches!(Frame::decode(&[]), Err(ProtocolError::Empty)));
        assert!(matches!(
            Frame::decode(&[0x7f, 1, 2, 3]),
            Err(ProtocolError::UnknownKind(0x7f))
        ));
    }

    #[test]
    fn test_decode_rejects_truncated_session_output() {
        // Not enough bytes for the length prefix.
        assert!(matches!(
            Frame::decode(&[0x09, 1, 0]),
            Err(ProtocolError::Truncated)
        ));
        // Length prefix claims more id bytes than remain.
        let mut bad = vec![0x09];
        bad.extend_from_slice(&100u32.to_le_bytes());
        bad.extend_from_slice(b"short");
        assert!(matches!(Frame::decode(&bad), Err(ProtocolError::Truncated)));
    }

    #[test]
    fn test_decode_rejects_bad_json() {
        let mut bad = vec![0x04];
        bad.extend_from_slice(b"{not json");
        assert!(matches!(Frame::decode(&bad), Err(ProtocolError::Json(_))));
    }

    #[test]
    fn test_decode_never_panics_on_garbage() {
        // A cheap in-tree sweep; the fuzz target does this with real corpora.
        for kind in 0u8..=0x10 {
            for len in 0..16 {
                let data: Vec<u8> = std::iter::once(kind)
                    .chain((0..len).map(|i| (i * 37) as u8))
                    .collect();
                let _ = Frame::decode(&data);
            }
        }
    }

    #[test]
    fn test_control_payload_field_names() {
        let frame = Frame::SessionControl(SessionControl {
            action: ControlAction::Destroy,
            session_id: Some("ab12cd34".into()),
            name: None,
            cwd: None,
            cols: None,
            rows: None,
        });
        let encoded = frame.encode();
        let json = std::str::from_utf8(&encoded[1..]).unwrap();
        assert!(json.contains("\"action\":\"destroy\""));
        assert!(json.contains("\"sessionId\":\"ab12cd34\""));
    }

    #[test]
    fn test_error_code_wire_names() {
        let encoded = Frame::error(ErrorCode::RateLimited, "slow down").encode();
        let json = std::str::from_utf8(&encoded[1..]).unwrap();
        assert!(json.contains("\"RATE_LIMITED\""));
    }
}
