//! Reliable transfer over a stream that may move fewer bytes than asked.
//!
//! `send_all` / `recv_all` keep calling the partial primitive until the whole
//! block has moved, counting the calls. The framed variants put a
//! [`Header`] in front of the payload.

use super::buffer::Buffer;
use super::header::Header;
use crate::error::{Error, Result};
use std::io::{self, Read, Write};
use std::ops::{Add, AddAssign};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::trace;

/// Outcome of a completed transfer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    /// Bytes moved, header included.
    pub bytes: usize,
    /// Underlying read/write calls it took ("ntrans").
    pub calls: usize,
}

impl Add for Transfer {
    type Output = Transfer;

    fn add(self, rhs: Transfer) -> Transfer {
        Transfer {
            bytes: self.bytes + rhs.bytes,
            calls: self.calls + rhs.calls,
        }
    }
}

impl AddAssign for Transfer {
    fn add_assign(&mut self, rhs: Transfer) {
        *self = *self + rhs;
    }
}

/// Write all of `data`, looping over short writes.
pub fn send_all<W: Write + ?Sized>(w: &mut W, data: &[u8]) -> Result<Transfer> {
    let mut sent = 0;
    let mut calls = 0;

    while sent < data.len() {
        calls += 1;
        match w.write(&data[sent..]) {
            Ok(0) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "socket accepted zero bytes",
                )))
            }
            Ok(n) => sent += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Transfer { bytes: sent, calls })
}

/// Fill all of `data`, looping over short reads.
///
/// A zero-length read before the block is complete means the peer went
/// away, which is an error rather than end-of-stream.
pub fn recv_all<R: Read + ?Sized>(r: &mut R, data: &mut [u8]) -> Result<Transfer> {
    let expected = data.len();
    let mut received = 0;
    let mut calls = 0;

    while received < expected {
        calls += 1;
        match r.read(&mut data[received..]) {
            Ok(0) => {
                return Err(Error::PeerDisconnected {
                    expected,
                    remaining: expected - received,
                })
            }
            Ok(n) => received += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(Transfer {
        bytes: received,
        calls,
    })
}

/// Send an optional header followed by `payload`.
///
/// Stops at the first error; the payload is not attempted if the header
/// failed.
pub fn send_frame<W: Write + ?Sized>(
    w: &mut W,
    header: Option<&Header>,
    payload: &[u8],
) -> Result<Transfer> {
    let mut total = Transfer::default();
    if let Some(header) = header {
        total += send_all(w, &header.encode())?;
    }
    total += send_all(w, payload)?;

    trace!(bytes = total.bytes, calls = total.calls, "sent frame");
    Ok(total)
}

/// Read one header.
pub fn recv_header<R: Read + ?Sized>(r: &mut R) -> Result<(Header, Transfer)> {
    let mut raw = [0u8; Header::SIZE];
    let transfer = recv_all(r, &mut raw)?;
    Ok((Header::decode(&raw), transfer))
}

/// Read one header and its payload into `buf`.
///
/// On return `buf` holds exactly `msg_len` bytes. The buffer grows to
/// whatever length the peer announces; pass `max_len` to refuse larger
/// messages before allocating.
///
/// A disconnect while reading the payload reports the header bytes as part
/// of `expected`, so only a disconnect before the first header byte looks
/// like a clean end of stream.
pub fn recv_frame<R: Read + ?Sized>(
    r: &mut R,
    buf: &mut Buffer,
    max_len: Option<usize>,
) -> Result<(Header, Transfer)> {
    let (header, mut total) = recv_header(r)?;
    let len = header.msg_len as usize;
    if max_len.is_some_and(|max| len > max) {
        return Err(Error::MessageTooLarge(len));
    }

    let payload = buf.prepare(len);
    total += recv_all(r, payload).map_err(|e| match e {
        Error::PeerDisconnected {
            expected,
            remaining,
        } => Error::PeerDisconnected {
            expected: expected + Header::SIZE,
            remaining,
        },
        other => other,
    })?;

    debug_assert_eq!(total.bytes, header.msg_len as usize + Header::SIZE);
    trace!(bytes = total.bytes, calls = total.calls, "received frame");
    Ok((header, total))
}

/// Stream adapter that moves at most `limit` bytes per call.
///
/// Emulates a small MTU or a congested socket, making the per-message call
/// count visible.
#[derive(Debug)]
pub struct Chunked<S> {
    inner: S,
    limit: usize,
}

impl<S> Chunked<S> {
    /// `None` passes calls through unchanged.
    pub fn new(inner: S, limit: Option<usize>) -> Self {
        let limit = limit.filter(|&l| l > 0).unwrap_or(usize::MAX);
        Self { inner, limit }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Read> Read for Chunked<S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.limit);
        self.inner.read(&mut buf[..n])
    }
}

impl<S: Write> Write for Chunked<S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(self.limit);
        self.inner.write(&buf[..n])
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Stream adapter for sockets with a read timeout: timed-out reads are
/// retried until `stop` is raised.
///
/// Partial progress inside [`recv_all`] survives the retries.
#[derive(Debug)]
pub struct Watched<'a, S> {
    inner: S,
    stop: &'a AtomicBool,
}

impl<'a, S> Watched<'a, S> {
    pub fn new(inner: S, stop: &'a AtomicBool) -> Self {
        Self { inner, stop }
    }
}

impl<S: Read> Read for Watched<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match self.inner.read(buf) {
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    if self.stop.load(Ordering::SeqCst) {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "stop requested"));
                    }
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::header::Opts;
    use std::io::Cursor;

    /// Writer that is interrupted once, then accepts 3 bytes per call.
    struct Stuttering {
        out: Vec<u8>,
        interrupted: bool,
    }

    impl Write for Stuttering {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(io::ErrorKind::Interrupted.into());
            }
            let n = buf.len().min(3);
            self.out.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_send_all_loops_over_short_writes() {
        let mut w = Stuttering {
            out: Vec::new(),
            interrupted: false,
        };
        let t = send_all(&mut w, b"0123456789").unwrap();

        assert_eq!(w.out, b"0123456789");
        assert_eq!(t.bytes, 10);
        assert_eq!(t.calls, 5); // one interrupted + 4 short writes
    }

    #[test]
    fn test_empty_block_makes_no_calls() {
        let mut out = Vec::new();
        assert_eq!(send_all(&mut out, &[]).unwrap(), Transfer::default());

        let mut input = Cursor::new(Vec::new());
        assert_eq!(recv_all(&mut input, &mut []).unwrap(), Transfer::default());
    }

    #[test]
    fn test_recv_all_reports_disconnect() {
        let mut input = Cursor::new(vec![1u8, 2, 3]);
        let mut block = [0u8; 8];

        match recv_all(&mut input, &mut block) {
            Err(Error::PeerDisconnected {
                expected,
                remaining,
            }) => {
                assert_eq!(expected, 8);
                assert_eq!(remaining, 5);
            }
            other => panic!("expected disconnect, got {other:?}"),
        }
    }

    #[test]
    fn test_frame_exchange() {
        let payload = b"frame payload".to_vec();
        let mut wire = Vec::new();
        let header = Header::data(payload.len() as u32);
        let sent = send_frame(&mut wire, Some(&header), &payload).unwrap();
        assert_eq!(sent.bytes, Header::SIZE + payload.len());

        let mut buf = Buffer::default();
        let (got, recvd) = recv_frame(&mut Cursor::new(wire), &mut buf, None).unwrap();
        assert_eq!(got, header);
        assert_eq!(buf.as_slice(), &payload[..]);
        assert_eq!(recvd.bytes, sent.bytes);
    }

    #[test]
    fn test_empty_control_frame() {
        let mut wire = Vec::new();
        send_frame(&mut wire, Some(&Header::control(Opts::SIGTERM)), &[]).unwrap();
        assert_eq!(wire.len(), Header::SIZE);

        let mut buf = Buffer::default();
        let (header, t) = recv_frame(&mut Cursor::new(wire), &mut buf, None).unwrap();
        assert_eq!(header.opts, Opts::SIGTERM);
        assert!(buf.is_empty());
        assert_eq!(t.calls, 1);
    }

    #[test]
    fn test_truncated_payload_fails() {
        let mut wire = Header::data(100).encode().to_vec();
        wire.extend_from_slice(&[7u8; 40]);

        let mut buf = Buffer::default();
        let err = recv_frame(&mut Cursor::new(wire), &mut buf, None).unwrap_err();
        assert!(matches!(
            err,
            Error::PeerDisconnected {
                expected: 105,
                remaining: 60
            }
        ));
        assert!(!err.is_clean_disconnect());
    }

    #[test]
    fn test_header_without_payload_is_not_clean() {
        let wire = Header::data(100).encode().to_vec();

        let mut buf = Buffer::default();
        let err = recv_frame(&mut Cursor::new(wire), &mut buf, None).unwrap_err();
        assert!(matches!(
            err,
            Error::PeerDisconnected {
                expected: 105,
                remaining: 100
            }
        ));
        assert!(!err.is_clean_disconnect());
    }

    #[test]
    fn test_close_between_frames_is_clean() {
        let mut buf = Buffer::default();
        let err = recv_frame(&mut Cursor::new(Vec::new()), &mut buf, None).unwrap_err();
        assert!(err.is_clean_disconnect());

        let partial_header = vec![0u8, 0];
        let err = recv_frame(&mut Cursor::new(partial_header), &mut buf, None).unwrap_err();
        assert!(!err.is_clean_disconnect());
    }

    #[test]
    fn test_oversized_message_refused() {
        let mut wire = Header::data(64).encode().to_vec();
        wire.extend_from_slice(&[1u8; 64]);

        let mut buf = Buffer::new(8);
        let err = recv_frame(&mut Cursor::new(wire), &mut buf, Some(16)).unwrap_err();
        assert!(matches!(err, Error::MessageTooLarge(64)));
        assert_eq!(buf.capacity(), 8);
    }

    /// Reader that times out every other call.
    struct Sluggish {
        data: Cursor<Vec<u8>>,
        stalled: bool,
    }

    impl Read for Sluggish {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.stalled = !self.stalled;
            if self.stalled {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(2);
            self.data.read(&mut buf[..n])
        }
    }

    #[test]
    fn test_watched_retries_timeouts() {
        let mut wire = Header::data(4).encode().to_vec();
        wire.extend_from_slice(b"tail");
        let stop = AtomicBool::new(false);
        let mut reader = Watched::new(
            Sluggish {
                data: Cursor::new(wire),
                stalled: false,
            },
            &stop,
        );

        let mut buf = Buffer::default();
        let (header, t) = recv_frame(&mut reader, &mut buf, None).unwrap();
        assert_eq!(header.msg_len, 4);
        assert_eq!(buf.as_slice(), b"tail");
        assert_eq!(t.bytes, Header::SIZE + 4);
    }

    #[test]
    fn test_watched_gives_up_when_stopped() {
        let stop = AtomicBool::new(true);
        let mut reader = Watched::new(
            Sluggish {
                data: Cursor::new(vec![0u8; 5]),
                stalled: false,
            },
            &stop,
        );

        let mut block = [0u8; 5];
        let err = recv_all(&mut reader, &mut block).unwrap_err();
        assert!(matches!(err, Error::Io(ref e) if e.kind() == io::ErrorKind::TimedOut));
    }

    #[test]
    fn test_large_payload_call_counts() {
        const LEN: usize = 10 * 1024 * 1024;
        const LIMIT: usize = 64 * 1024;
        let payload: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
        let header = Header::data(LEN as u32);

        // Capped: every call moves at most 64 KiB.
        let mut capped = Chunked::new(Vec::new(), Some(LIMIT));
        let sent = send_frame(&mut capped, Some(&header), &payload).unwrap();
        assert_eq!(sent.calls, 1 + LEN / LIMIT);

        let mut reader = Chunked::new(Cursor::new(capped.into_inner()), Some(LIMIT));
        let mut buf = Buffer::default();
        let (_, recvd) = recv_frame(&mut reader, &mut buf, None).unwrap();
        assert!(recvd.calls > 1);
        assert_eq!(recvd.calls, 1 + LEN / LIMIT);
        assert_eq!(buf.len(), LEN);
        assert_eq!(buf.as_slice(), &payload[..]);

        // Uncapped: one call for the header, one for the payload.
        let mut wire = Vec::new();
        let sent = send_frame(&mut wire, Some(&header), &payload).unwrap();
        assert_eq!(sent.calls, 2);

        let mut buf = Buffer::default();
        let (_, recvd) = recv_frame(&mut Cursor::new(wire), &mut buf, None).unwrap();
        assert_eq!(recvd.calls, 2);
        assert_eq!(buf.len(), LEN);
    }
}
