//! Fixed-size frame header.
//!
//! Every payload on the wire is preceded by:
//!
//! ```text
//! [ msg_len: u32 big-endian | opts: u8 ]
//! ```

use bytes::{Buf, BufMut};

/// Bit set carried in the header's `opts` byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Opts(u8);

impl Opts {
    /// Ordinary data message.
    pub const NONE: Opts = Opts(0);
    /// Handoff request: the client asks which port carries data.
    pub const REQ_WPORT: Opts = Opts(0b0001);
    /// Remote shutdown request.
    pub const SIGTERM: Opts = Opts(0b0010);

    pub const fn from_bits(bits: u8) -> Self {
        Opts(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: Opts) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Opts {
    type Output = Opts;

    fn bitor(self, rhs: Opts) -> Opts {
        Opts(self.0 | rhs.0)
    }
}

/// Header sent ahead of every payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Exact number of payload bytes that follow.
    pub msg_len: u32,
    pub opts: Opts,
}

impl Header {
    /// Encoded size on the wire.
    pub const SIZE: usize = 5;

    /// Header for an ordinary data payload.
    pub fn data(msg_len: u32) -> Self {
        Self {
            msg_len,
            opts: Opts::NONE,
        }
    }

    /// Header for an empty control message.
    pub fn control(opts: Opts) -> Self {
        Self { msg_len: 0, opts }
    }

    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        let mut dst = &mut out[..];
        dst.put_u32(self.msg_len);
        dst.put_u8(self.opts.bits());
        out
    }

    pub fn decode(bytes: &[u8; Self::SIZE]) -> Self {
        let mut src = &bytes[..];
        let msg_len = src.get_u32();
        let opts = Opts::from_bits(src.get_u8());
        Self { msg_len, opts }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_is_network_order() {
        let header = Header::data(0x0102_0304);
        assert_eq!(header.encode(), [0x01, 0x02, 0x03, 0x04, 0x00]);
    }

    #[test]
    fn test_control_header() {
        let bytes = Header::control(Opts::REQ_WPORT).encode();
        assert_eq!(bytes, [0, 0, 0, 0, 0x01]);

        let decoded = Header::decode(&[0, 0, 0, 0, 0x02]);
        assert_eq!(decoded.msg_len, 0);
        assert_eq!(decoded.opts, Opts::SIGTERM);
    }

    #[test]
    fn test_opts_bits() {
        let both = Opts::REQ_WPORT | Opts::SIGTERM;
        assert!(both.contains(Opts::REQ_WPORT));
        assert!(both.contains(Opts::SIGTERM));
        assert!(!Opts::REQ_WPORT.contains(Opts::SIGTERM));
        assert!(Opts::NONE.is_empty());
        assert_eq!(both.bits(), 0x03);
    }
}
