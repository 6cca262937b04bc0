use bytes::{Buf, BufMut, Bytes, BytesMut};

use tessera_types::Error;

/// Tag of the first frame on a fresh connection.
pub const STARTUP_TAG: u8 = 0x00;
/// Tag of a protocol error frame; payload is a UTF-8 message.
pub const ERROR_TAG: u8 = b'E';

/// Tag byte plus length field.
pub const HEADER_LEN: usize = 5;

/// Protocol families sharing the listener, keyed by startup magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    /// PostgreSQL protocol 3.0 client traffic.
    Client,
    /// Cluster client/server RPC.
    InternalRpc,
    /// Raft peer traffic.
    Peer,
}

impl Protocol {
    pub const CLIENT_MAGIC: u32 = 196_608;
    pub const INTERNAL_RPC_MAGIC: u32 = 0x5453_5250;
    pub const PEER_MAGIC: u32 = 0x5453_5243;

    pub fn magic(self) -> u32 {
        match self {
            Protocol::Client => Self::CLIENT_MAGIC,
            Protocol::InternalRpc => Self::INTERNAL_RPC_MAGIC,
            Protocol::Peer => Self::PEER_MAGIC,
        }
    }

    pub fn from_magic(magic: u32) -> Option<Self> {
        match magic {
            Self::CLIENT_MAGIC => Some(Protocol::Client),
            Self::INTERNAL_RPC_MAGIC => Some(Protocol::InternalRpc),
            Self::PEER_MAGIC => Some(Protocol::Peer),
            _ => None,
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Protocol::Client => "client",
            Protocol::InternalRpc => "internal-rpc",
            Protocol::Peer => "peer",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub tag: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(tag: u8, payload: impl Into<Bytes>) -> Self {
        Frame { tag, payload: payload.into() }
    }

    /// Startup frame for `protocol`; `params` follow the magic number.
    pub fn startup(protocol: Protocol, params: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(4 + params.len());
        payload.put_u32(protocol.magic());
        payload.put_slice(params);
        Frame::new(STARTUP_TAG, payload.freeze())
    }

    pub fn error(message: &str) -> Self {
        Frame::new(ERROR_TAG, Bytes::copy_from_slice(message.as_bytes()))
    }

    /// Protocol named by a startup frame, plus the bytes after the magic.
    pub fn parse_startup(&self) -> Result<(Protocol, Bytes), Error> {
        if self.tag != STARTUP_TAG {
            return Err(Error::Protocol(format!("unexpected startup tag {:#04x}", self.tag)));
        }
        if self.payload.len() < 4 {
            return Err(Error::Protocol("startup frame too short".into()));
        }
        let mut payload = self.payload.clone();
        let magic = payload.get_u32();
        let protocol = Protocol::from_magic(magic)
            .ok_or_else(|| Error::Protocol(format!("unknown protocol magic {magic}")))?;
        Ok((protocol, payload))
    }

    /// Message of an error frame, if this is one.
    pub fn error_message(&self) -> Option<String> {
        (self.tag == ERROR_TAG).then(|| String::from_utf8_lossy(&self.payload).into_owned())
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// The length field counts itself and the payload.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.reserve(self.encoded_len());
        dst.put_u8(self.tag);
        dst.put_u32((self.payload.len() + 4) as u32);
        dst.put_slice(&self.payload);
    }

    /// Split one frame off the front of `src`.
    ///
    /// Returns `Ok(None)` without consuming anything while the frame is
    /// incomplete.
    pub fn decode(src: &mut BytesMut, max_frame_bytes: usize) -> Result<Option<Frame>, Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let tag = src[0];
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if len < 4 {
            return Err(Error::Protocol(format!("frame length {len} below header size")));
        }
        if len - 4 > max_frame_bytes {
            return Err(Error::Protocol(format!(
                "frame of {} bytes exceeds limit of {max_frame_bytes}",
                len - 4
            )));
        }
        if src.len() < 1 + len {
            src.reserve(1 + len - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(len - 4).freeze();
        Ok(Some(Frame { tag, payload }))
    }
}
