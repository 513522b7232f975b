//! The message envelope carried as a ring frame's payload: `[type][request_id][body]`.

use std::fmt;

/// Stable wire values for the envelope's `type` byte. These are part of the
/// wire contract (spec §6) and must never be repurposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Stdout = 0x00,
    FsRead = 0x01,
    FsWrite = 0x02,
    NetConnect = 0x03,
    Exec = 0x04,
    ListDir = 0x05,
    Allow = 0x10,
    Deny = 0x11,
    Code = 0x20,
}

impl TryFrom<u8> for MessageType {
    type Error = UnknownMessageType;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x00 => Self::Stdout,
            0x01 => Self::FsRead,
            0x02 => Self::FsWrite,
            0x03 => Self::NetConnect,
            0x04 => Self::Exec,
            0x05 => Self::ListDir,
            0x10 => Self::Allow,
            0x11 => Self::Deny,
            0x20 => Self::Code,
            other => return Err(UnknownMessageType(other)),
        })
    }
}

#[derive(Debug)]
pub struct UnknownMessageType(pub u8);

impl fmt::Display for UnknownMessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown envelope message type byte {:#04x}", self.0)
    }
}

impl std::error::Error for UnknownMessageType {}

/// `[u8 type][u32 LE request_id][N bytes body]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub msg_type: MessageType,
    pub request_id: u32,
    pub body: Vec<u8>,
}

/// A frame whose envelope header is shorter than 5 bytes, or whose type byte
/// is not one of the stable wire values. Per spec §7 this is a
/// protocol-inconsistency: the caller should silently discard the frame.
#[derive(Debug)]
pub enum DecodeError {
    ShortFrame,
    UnknownType(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShortFrame => write!(f, "frame shorter than the envelope header"),
            Self::UnknownType(b) => write!(f, "unknown envelope message type byte {b:#04x}"),
        }
    }
}

impl std::error::Error for DecodeError {}

impl Envelope {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(5 + self.body.len());
        buf.push(self.msg_type as u8);
        buf.extend_from_slice(&self.request_id.to_le_bytes());
        buf.extend_from_slice(&self.body);
        buf
    }

    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        if frame.len() < 5 {
            return Err(DecodeError::ShortFrame);
        }
        let msg_type = MessageType::try_from(frame[0]).map_err(|e| DecodeError::UnknownType(e.0))?;
        let request_id = u32::from_le_bytes(frame[1..5].try_into().expect("checked length above"));
        let body = frame[5..].to_vec();
        Ok(Self {
            msg_type,
            request_id,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        let env = Envelope {
            msg_type: MessageType::FsRead,
            request_id: 42,
            body: b"/tmp/x".to_vec(),
        };
        let encoded = env.encode();
        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(env, decoded);
    }

    #[test]
    fn stdout_has_zero_request_id_by_convention() {
        let env = Envelope {
            msg_type: MessageType::Stdout,
            request_id: 0,
            body: b"hi".to_vec(),
        };
        assert_eq!(env.encode()[1..5], [0, 0, 0, 0]);
    }

    #[test]
    fn short_frame_is_rejected() {
        assert!(matches!(Envelope::decode(&[0x01, 0, 0]), Err(DecodeError::ShortFrame)));
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        let frame = [0x42, 0, 0, 0, 0];
        assert!(matches!(Envelope::decode(&frame), Err(DecodeError::UnknownType(0x42))));
    }
}
