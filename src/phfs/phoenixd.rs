//! `phoenixd` message types: the host-daemon protocol carried over
//! [`super::msg`] frames (§4.2, grounded on `phoenixd.c`).
//!
//! Matches the original's partial coverage: `open`/`read`/`stat` round-trip
//! through the daemon, while `write`/`close` are local no-ops (the original
//! daemon never implements their wire side either; a loader talking to
//! `phoenixd` only ever pulls files down, never pushes them back up).

use super::msg::{send, Endpoint, Msg};
use crate::error::{Error, Result};

/// Wire message types (`phoenixd.h`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MsgType {
    Open = 1,
    Read = 2,
    Write = 3,
    Copy = 4,
    Fstat = 6,
}

/// An open file handle on the daemon side, identified by the file descriptor
/// the `OPEN` reply carried back.
#[derive(Debug, Clone, Copy)]
pub struct Handle(pub i32);

/// Size of the `{handle, pos, len}` sub-header every non-`OPEN` request and
/// reply carries ahead of its real payload (`msg_phoenixd_t`).
const IO_HDR_LEN: usize = 12;
/// `sizeof(phoenixd_stat_t)`: two `u32`s, four `u16`s, then five more `u32`s
/// — no padding, every field already falls on a 4-byte boundary.
const STAT_STRUCT_LEN: usize = 44;
/// Offset of `st_size` within `phoenixd_stat_t`.
const ST_SIZE_OFFSET: usize = 20;

fn build_open_payload(path: &str, flags: u32) -> Result<([u8; 256], usize)> {
    let bytes = path.as_bytes();
    // +1 for the NUL terminator `hal_strlen(file) + 1` copies.
    if bytes.len() + 1 + 4 > 256 {
        return Err(Error::Invalid);
    }
    let mut buf = [0u8; 256];
    buf[0..4].copy_from_slice(&flags.to_le_bytes());
    buf[4..4 + bytes.len()].copy_from_slice(bytes);
    // buf[4 + bytes.len()] is already 0 (the NUL terminator).
    Ok((buf, 4 + bytes.len() + 1))
}

/// `OPEN`: resolves `path` on the host with `flags` and returns a handle.
/// Matches `phoenixd_open`'s payload layout: `flags` as the first 4 bytes,
/// then the NUL-terminated path.
pub fn open<E: Endpoint>(endpoint: &mut E, seq: u16, path: &str, flags: u32) -> Result<Handle> {
    let (payload, len) = build_open_payload(path, flags)?;
    let req = Msg::new(MsgType::Open as u16, &payload[..len]);
    let reply = send(endpoint, &req, seq)?;
    if reply.ty() != MsgType::Open as u16 || reply.payload().len() != 4 {
        return Err(Error::Io);
    }
    let fd = i32::from_le_bytes(reply.payload()[0..4].try_into().unwrap());
    if fd <= 0 {
        return Err(Error::Invalid);
    }
    Ok(Handle(fd))
}

/// `READ`: pulls up to `buf.len()` bytes starting at `offset` from `handle`.
/// Returns the number of bytes actually copied into `buf` (may be short on
/// end-of-file).
///
/// Both request and reply carry a 12-byte `{handle, pos, len}` sub-header
/// ahead of the real data (`msg_phoenixd_t`); the byte count to copy is the
/// reply's own embedded `len` field, not the raw frame payload length.
pub fn read<E: Endpoint>(
    endpoint: &mut E,
    seq: u16,
    handle: Handle,
    offset: u32,
    buf: &mut [u8],
) -> Result<usize> {
    let mut payload = [0u8; IO_HDR_LEN];
    payload[0..4].copy_from_slice(&handle.0.to_le_bytes());
    payload[4..8].copy_from_slice(&offset.to_le_bytes());
    payload[8..12].copy_from_slice(&(buf.len() as u32).to_le_bytes());

    let req = Msg::new(MsgType::Read as u16, &payload);
    let reply = send(endpoint, &req, seq)?;
    if reply.ty() != MsgType::Read as u16 {
        return Err(Error::Io);
    }
    let reply_payload = reply.payload();
    if reply_payload.len() < IO_HDR_LEN {
        return Err(Error::Io);
    }
    let io_len = i32::from_le_bytes(reply_payload[8..12].try_into().unwrap());
    if io_len < 0 {
        return Err(Error::Io);
    }
    let available = reply_payload.len() - IO_HDR_LEN;
    let n = (io_len as usize).min(available).min(buf.len());
    buf[..n].copy_from_slice(&reply_payload[IO_HDR_LEN..IO_HDR_LEN + n]);
    Ok(n)
}

/// `WRITE`: not implemented by the daemon. Always reports success without
/// sending a frame, matching the original's `/* TODO */` stub.
pub fn write<E: Endpoint>(_endpoint: &mut E, _handle: Handle, buf: &[u8]) -> Result<usize> {
    Ok(buf.len())
}

/// `CLOSE`: not implemented by the daemon; there is no frame to send.
pub fn close<E: Endpoint>(_endpoint: &mut E, _handle: Handle) -> Result<()> {
    Ok(())
}

/// `FSTAT`: retrieves the size of the file behind an already-open `handle`
/// (`phoenixd_stat` stats by handle, not by path). The reply carries the
/// same 12-byte `{handle, pos, len}` sub-header as `read`, followed by a
/// `phoenixd_stat_t`; `st_size` sits at offset [`ST_SIZE_OFFSET`] in it.
pub fn stat<E: Endpoint>(endpoint: &mut E, seq: u16, handle: Handle) -> Result<u32> {
    let mut payload = [0u8; IO_HDR_LEN];
    payload[0..4].copy_from_slice(&handle.0.to_le_bytes());
    // pos = 0, len = 0, matching phoenixd_stat's request.

    let req = Msg::new(MsgType::Fstat as u16, &payload);
    let reply = send(endpoint, &req, seq)?;
    if reply.ty() != MsgType::Fstat as u16 {
        return Err(Error::Io);
    }
    let reply_payload = reply.payload();
    if reply_payload.len() < IO_HDR_LEN {
        return Err(Error::Io);
    }
    let io_len = i32::from_le_bytes(reply_payload[8..12].try_into().unwrap());
    if io_len != STAT_STRUCT_LEN as i32 {
        return Err(Error::Io);
    }
    let st_size_at = IO_HDR_LEN + ST_SIZE_OFFSET;
    if reply_payload.len() < st_size_at + 4 {
        return Err(Error::Io);
    }
    Ok(u32::from_le_bytes(reply_payload[st_size_at..st_size_at + 4].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct Loopback {
        inbox: VecDeque<u8>,
    }

    impl Endpoint for Loopback {
        fn write_all(&mut self, _buf: &[u8]) -> Result<()> {
            Ok(())
        }
        fn read_byte(&mut self, _timeout_ms: u32) -> Result<Option<u8>> {
            Ok(self.inbox.pop_front())
        }
    }

    fn queue_reply(lb: &mut Loopback, ty: u16, payload: &[u8], seq: u16) {
        let framed = Msg::new(ty, payload).with_csum(seq);
        framed
            .write_framed(|b| {
                lb.inbox.push_back(b);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn write_and_close_are_local_noops() {
        let mut lb = Loopback {
            inbox: VecDeque::new(),
        };
        let n = write(&mut lb, Handle(3), b"abc").unwrap();
        assert_eq!(n, 3);
        close(&mut lb, Handle(3)).unwrap();
    }

    #[test]
    fn open_payload_rejects_oversized_path() {
        let long = "a".repeat(300);
        assert_eq!(build_open_payload(&long, 0).unwrap_err(), Error::Invalid);
    }

    #[test]
    fn open_payload_carries_flags_then_path() {
        let (buf, len) = build_open_payload("kernel.elf", 0x1234_5678).unwrap();
        assert_eq!(&buf[0..4], &0x1234_5678u32.to_le_bytes());
        assert_eq!(&buf[4..4 + 10], b"kernel.elf");
        assert_eq!(buf[4 + 10], 0); // NUL terminator
        assert_eq!(len, 4 + 10 + 1);
    }

    #[test]
    fn open_round_trips_handle() {
        let mut lb = Loopback {
            inbox: VecDeque::new(),
        };
        queue_reply(&mut lb, MsgType::Open as u16, &7i32.to_le_bytes(), 1);
        let handle = open(&mut lb, 1, "kernel.elf", 0).unwrap();
        assert_eq!(handle.0, 7);
    }

    #[test]
    fn read_copies_short_reply_into_buf() {
        let mut lb = Loopback {
            inbox: VecDeque::new(),
        };
        let mut reply_payload = [0u8; IO_HDR_LEN + 3];
        reply_payload[8..12].copy_from_slice(&3u32.to_le_bytes()); // io->len
        reply_payload[IO_HDR_LEN..].copy_from_slice(&[1, 2, 3]);
        queue_reply(&mut lb, MsgType::Read as u16, &reply_payload, 2);
        let mut buf = [0u8; 8];
        let n = read(&mut lb, 2, Handle(7), 0, &mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf[..3], &[1, 2, 3]);
    }

    #[test]
    fn stat_returns_size() {
        let mut lb = Loopback {
            inbox: VecDeque::new(),
        };
        let mut reply_payload = [0u8; IO_HDR_LEN + STAT_STRUCT_LEN];
        reply_payload[8..12].copy_from_slice(&(STAT_STRUCT_LEN as u32).to_le_bytes()); // io->len
        let st_size_at = IO_HDR_LEN + ST_SIZE_OFFSET;
        reply_payload[st_size_at..st_size_at + 4].copy_from_slice(&4096u32.to_le_bytes());
        queue_reply(&mut lb, MsgType::Fstat as u16, &reply_payload, 3);
        let size = stat(&mut lb, 3, Handle(7)).unwrap();
        assert_eq!(size, 4096);
    }
}
