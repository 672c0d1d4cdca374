//! Bit-exact wire formats at the measurement boundary (§6).

/// Length of the 4-byte dispatch prefix on a fresh control-channel
/// connection: `b"RPC\0"` selects JSON-RPC framing; the four legacy values
/// below are recognized only so the server can reject them with a clear
/// protocol error instead of misparsing.
pub const RPC_DISPATCH_PREFIX: &[u8; 4] = b"RPC\0";
pub const LEGACY_CTRL_PREFIX: &[u8; 4] = b"CTRL";
pub const LEGACY_DATA_PREFIX: &[u8; 4] = b"DATA";
pub const LEGACY_RECV_PREFIX: &[u8; 4] = b"RECV";
pub const LEGACY_PING_PREFIX: &[u8; 4] = b"PING";

/// TCP data-channel header: `"DATA"` (upload, client -> server) or `"RECV"`
/// (download, server -> client), immediately followed by a 2-byte session id
/// length and the session id bytes (§4.2).
pub const DATA_CHANNEL_UPLOAD_HEADER: &[u8; 4] = b"DATA";
pub const DATA_CHANNEL_DOWNLOAD_HEADER: &[u8; 4] = b"RECV";

/// 16-byte frame prefix used by the pacing sender (§4.1): sample id (4B) +
/// sequence (8B) + payload length (4B).
pub const FRAME_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub sample_id: u32,
    pub sequence: u64,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut buf = [0u8; FRAME_HEADER_LEN];
        buf[0..4].copy_from_slice(&self.sample_id.to_be_bytes());
        buf[4..12].copy_from_slice(&self.sequence.to_be_bytes());
        buf[12..16].copy_from_slice(&self.payload_len.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; FRAME_HEADER_LEN]) -> Self {
        Self {
            sample_id: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            sequence: u64::from_be_bytes(buf[4..12].try_into().unwrap()),
            payload_len: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        }
    }
}

/// Type codes for the UDP session-bound data format (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UdpFrameType {
    LegacyData = 1,
    Ping = 2,
    Pong = 3,
    SessionBoundData = 4,
    SampleDone = 5,
}

impl UdpFrameType {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::LegacyData),
            2 => Some(Self::Ping),
            3 => Some(Self::Pong),
            4 => Some(Self::SessionBoundData),
            5 => Some(Self::SampleDone),
            _ => None,
        }
    }
}

/// `uint8 type || uint8 sid_len || sid_bytes || uint32_be sample_id ||
/// uint64_be sequence || payload`
pub struct UdpSessionFrame<'a> {
    pub frame_type: UdpFrameType,
    pub session_id: &'a str,
    pub sample_id: u32,
    pub sequence: u64,
    pub payload: &'a [u8],
}

impl<'a> UdpSessionFrame<'a> {
    pub fn encode(&self) -> Vec<u8> {
        let sid = self.session_id.as_bytes();
        let mut buf = Vec::with_capacity(2 + sid.len() + 12 + self.payload.len());
        buf.push(self.frame_type as u8);
        buf.push(sid.len() as u8);
        buf.extend_from_slice(sid);
        buf.extend_from_slice(&self.sample_id.to_be_bytes());
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(self.payload);
        buf
    }

    pub fn decode(buf: &'a [u8]) -> Option<Self> {
        if buf.len() < 2 {
            return None;
        }
        let frame_type = UdpFrameType::from_byte(buf[0])?;
        let sid_len = buf[1] as usize;
        let rest = &buf[2..];
        if rest.len() < sid_len + 12 {
            return None;
        }
        let session_id = std::str::from_utf8(&rest[..sid_len]).ok()?;
        let sample_id = u32::from_be_bytes(rest[sid_len..sid_len + 4].try_into().unwrap());
        let sequence =
            u64::from_be_bytes(rest[sid_len + 4..sid_len + 12].try_into().unwrap());
        let payload = &rest[sid_len + 12..];
        Some(Self {
            frame_type,
            session_id,
            sample_id,
            sequence,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_header_round_trips() {
        let h = FrameHeader {
            sample_id: 7,
            sequence: 1234,
            payload_len: 1200,
        };
        let decoded = FrameHeader::decode(&h.encode());
        assert_eq!(h, decoded);
    }

    #[test]
    fn udp_session_frame_round_trips() {
        let payload = vec![0xAB; 32];
        let frame = UdpSessionFrame {
            frame_type: UdpFrameType::SessionBoundData,
            session_id: "abc123",
            sample_id: 3,
            sequence: 99,
            payload: &payload,
        };
        let encoded = frame.encode();
        let decoded = UdpSessionFrame::decode(&encoded).unwrap();
        assert_eq!(decoded.session_id, "abc123");
        assert_eq!(decoded.sample_id, 3);
        assert_eq!(decoded.sequence, 99);
        assert_eq!(decoded.payload, payload.as_slice());
    }
}
