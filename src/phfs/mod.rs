//! PHFS (Phoenix FileSystem): a uniform file/alias layer over the device
//! registry (§4.3, grounded on `phfs.c`/`phfs.h`).
//!
//! Two namespaces live on top of [`crate::device::Registry`]: device
//! **bindings** (an alias to a `(major, minor)` pair plus a transport
//! protocol) and named **file entries** (a sub-region of a bound raw
//! device). A `Handler` is the opaque token callers hold after [`Phfs::open`].

pub mod msg;
pub mod phoenixd;

use crate::config::{SIZE_PHFS_FILES, SIZE_PHFS_HANDLERS};
use crate::device::Registry;
use crate::error::{Error, Result};
use msg::Endpoint;

/// Maximum alias length (device bindings), excluding NUL.
pub const MAX_DEV_ALIAS_LEN: usize = 7;
/// Maximum alias length (file entries), excluding NUL.
pub const MAX_FILE_ALIAS_LEN: usize = 31;

/// Transport protocol a device binding speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub enum Protocol {
    /// Direct `devs_read`/`devs_write` against the bound device.
    Raw,
    /// Framed `phoenixd` request/reply over the bound device's byte stream.
    Phoenixd,
}

struct DevBinding {
    alias: heapless::String<MAX_DEV_ALIAS_LEN>,
    major: usize,
    minor: usize,
    protocol: Protocol,
}

struct FileEntry {
    alias: heapless::String<MAX_FILE_ALIAS_LEN>,
    base_addr: u32,
    size: u32,
}

/// An open file/device handler (§4.3's "opaque `{binding_index, file_index}`").
///
/// `file_index == NO_FILE` denotes the raw device stream itself rather than a
/// named sub-region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handler {
    binding_index: usize,
    file_index: Option<usize>,
    /// For `phoenixd`, the daemon-assigned remote file descriptor.
    remote_fd: i32,
}

const NO_FD: i32 = -1;

/// The PHFS tables: up to [`SIZE_PHFS_HANDLERS`] device bindings and
/// [`SIZE_PHFS_FILES`] named file entries, layered over a [`Registry`].
pub struct Phfs {
    bindings: heapless::Vec<DevBinding, SIZE_PHFS_HANDLERS>,
    files: heapless::Vec<FileEntry, SIZE_PHFS_FILES>,
    seq: u16,
}

impl Phfs {
    /// An empty PHFS layer with no bindings or file entries registered.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            bindings: heapless::Vec::new(),
            files: heapless::Vec::new(),
            seq: 0,
        }
    }

    fn find_binding(&self, alias: &str) -> Option<usize> {
        self.bindings.iter().position(|b| b.alias == alias)
    }

    fn find_file(&self, alias: &str) -> Option<usize> {
        self.files.iter().position(|f| f.alias == alias)
    }

    /// Registers a device binding, validating against `devices` that
    /// `(major, minor)` is a populated slot, that `alias` is unused, and that
    /// the table has spare capacity.
    pub fn reg_dev(
        &mut self,
        devices: &Registry,
        alias: &str,
        major: usize,
        minor: usize,
        protocol: Protocol,
    ) -> Result<()> {
        if alias.len() > MAX_DEV_ALIAS_LEN || self.find_binding(alias).is_some() {
            return Err(Error::Invalid);
        }
        devices.check(major, minor)?;
        let alias = heapless::String::try_from(alias).map_err(|_| Error::Invalid)?;
        self.bindings
            .push(DevBinding {
                alias,
                major,
                minor,
                protocol,
            })
            .map_err(|_| Error::NoSpace)?;
        Ok(())
    }

    /// Registers a named sub-region `[addr, addr+size)` as `alias`, resolvable
    /// later through a `raw` binding.
    pub fn reg_file(&mut self, alias: &str, base_addr: u32, size: u32) -> Result<()> {
        if alias.len() > MAX_FILE_ALIAS_LEN || self.find_file(alias).is_some() {
            return Err(Error::Invalid);
        }
        let alias = heapless::String::try_from(alias).map_err(|_| Error::Invalid)?;
        self.files
            .push(FileEntry {
                alias,
                base_addr,
                size,
            })
            .map_err(|_| Error::NoSpace)?;
        Ok(())
    }

    /// Opens `device_alias`, optionally resolving `file_alias` to clamp I/O to
    /// a named sub-region. For `phoenixd` bindings, `endpoint` carries the
    /// `OPEN` request with `flags`, and `file_alias` is interpreted as a host
    /// path; `flags` is ignored for `Raw` bindings, matching `phfs_open`
    /// (only the `phoenixd` transport's `OPEN` message carries flags).
    pub fn open<E: Endpoint>(
        &mut self,
        endpoint: Option<&mut E>,
        device_alias: &str,
        file_alias: Option<&str>,
        flags: u32,
    ) -> Result<Handler> {
        let binding_index = self.find_binding(device_alias).ok_or(Error::Invalid)?;
        let protocol = self.bindings[binding_index].protocol;

        match protocol {
            Protocol::Raw => {
                let file_index = match file_alias {
                    Some(name) => Some(self.find_file(name).ok_or(Error::Invalid)?),
                    None => None,
                };
                Ok(Handler {
                    binding_index,
                    file_index,
                    remote_fd: NO_FD,
                })
            }
            Protocol::Phoenixd => {
                let path = file_alias.ok_or(Error::Invalid)?;
                let endpoint = endpoint.ok_or(Error::NotSupported)?;
                self.seq = self.seq.wrapping_add(1);
                let handle = phoenixd::open(endpoint, self.seq, path, flags)?;
                Ok(Handler {
                    binding_index,
                    file_index: None,
                    remote_fd: handle.0,
                })
            }
        }
    }

    /// Reads up to `buf.len()` bytes at `offset` through `handler`.
    pub fn read<E: Endpoint>(
        &mut self,
        devices: &mut Registry,
        endpoint: Option<&mut E>,
        handler: Handler,
        offset: u32,
        buf: &mut [u8],
    ) -> Result<usize> {
        let binding = &self.bindings[handler.binding_index];
        match binding.protocol {
            Protocol::Raw => {
                let (major, minor) = (binding.major, binding.minor);
                let (abs_offset, len) = self.clamp_raw(handler, offset, buf.len())?;
                devices.read(major, minor, abs_offset, &mut buf[..len], crate::config::PHFS_TIMEOUT_MS)
            }
            Protocol::Phoenixd => {
                let endpoint = endpoint.ok_or(Error::NotSupported)?;
                self.seq = self.seq.wrapping_add(1);
                phoenixd::read(endpoint, self.seq, phoenixd::Handle(handler.remote_fd), offset, buf)
            }
        }
    }

    /// Writes `buf` at `offset` through `handler`.
    pub fn write<E: Endpoint>(
        &mut self,
        devices: &mut Registry,
        endpoint: Option<&mut E>,
        handler: Handler,
        offset: u32,
        buf: &[u8],
    ) -> Result<usize> {
        let binding = &self.bindings[handler.binding_index];
        match binding.protocol {
            Protocol::Raw => {
                let (major, minor) = (binding.major, binding.minor);
                let (abs_offset, len) = self.clamp_raw(handler, offset, buf.len())?;
                devices.write(major, minor, abs_offset, &buf[..len])
            }
            Protocol::Phoenixd => {
                let endpoint = endpoint.ok_or(Error::NotSupported)?;
                phoenixd::write(endpoint, phoenixd::Handle(handler.remote_fd), buf)
            }
        }
    }

    /// Closes `handler` (protocol-level only) then syncs the underlying
    /// device, per §4.3 ("`sync` delegates ... after protocol-level close").
    pub fn close<E: Endpoint>(
        &mut self,
        devices: &mut Registry,
        endpoint: Option<&mut E>,
        handler: Handler,
    ) -> Result<()> {
        let binding = &self.bindings[handler.binding_index];
        if binding.protocol == Protocol::Phoenixd {
            let endpoint = endpoint.ok_or(Error::NotSupported)?;
            phoenixd::close(endpoint, phoenixd::Handle(handler.remote_fd))?;
        }
        let (major, minor) = (binding.major, binding.minor);
        devices.sync(major, minor)
    }

    /// Queries whether the device backing `handler` can memory-map
    /// `dev_range` into `mem_range` with at least `mem_mode` access. A pure
    /// passthrough to the device handler's own `map`, matching `phfs_map`:
    /// containment wins unconditionally, so the `(dev_mode & mem_mode) ==
    /// dev_mode` check is the *device's* job in its non-containment fallback
    /// branch (see `NorDevice::map`), not a precondition applied here.
    pub fn map(
        &mut self,
        devices: &mut Registry,
        handler: Handler,
        dev_range: (u32, usize),
        dev_mode: u8,
        mem_range: (u32, usize),
        mem_mode: u8,
    ) -> Result<Option<u32>> {
        let binding = &self.bindings[handler.binding_index];
        devices.is_mappable(binding.major, binding.minor, dev_range, dev_mode, mem_range, mem_mode)
    }

    /// `FSTAT`-equivalent: reports the byte size addressable through
    /// `handler` (§11 supplement). For `phoenixd` bindings, issues the wire
    /// `FSTAT` request against the handle `open` obtained.
    pub fn stat<E: Endpoint>(&mut self, endpoint: Option<&mut E>, handler: Handler) -> Result<u32> {
        let binding = &self.bindings[handler.binding_index];
        match binding.protocol {
            Protocol::Raw => match handler.file_index {
                Some(idx) => Ok(self.files[idx].size),
                None => Err(Error::NotSupported),
            },
            Protocol::Phoenixd => {
                let endpoint = endpoint.ok_or(Error::NotSupported)?;
                self.seq = self.seq.wrapping_add(1);
                phoenixd::stat(endpoint, self.seq, phoenixd::Handle(handler.remote_fd))
            }
        }
    }

    /// Resolves `handler`'s `(offset, len)` request against a named file's
    /// bounds, or passes it through unchanged for a whole-device handler.
    fn clamp_raw(&self, handler: Handler, offset: u32, len: usize) -> Result<(u32, usize)> {
        match handler.file_index {
            None => Ok((offset, len)),
            Some(idx) => {
                let file = &self.files[idx];
                let base = file.base_addr;
                let size = file.size as u64;
                let end = u64::from(offset).saturating_add(len as u64);
                let clamped_len = if end > size {
                    size.saturating_sub(u64::from(offset)) as usize
                } else {
                    len
                };
                Ok((base.wrapping_add(offset), clamped_len))
            }
        }
    }
}

impl Default for Phfs {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{major, DeviceHandler};

    struct MemDev(Vec<u8>);
    impl DeviceHandler for MemDev {
        fn init(&mut self, _minor: usize) -> Result<()> {
            Ok(())
        }
        fn done(&mut self, _minor: usize) -> Result<()> {
            Ok(())
        }
        fn sync(&mut self, _minor: usize) -> Result<()> {
            Ok(())
        }
        fn read(&mut self, _minor: usize, offset: u32, buf: &mut [u8], _timeout_ms: u32) -> Result<usize> {
            let off = offset as usize;
            let n = buf.len().min(self.0.len().saturating_sub(off));
            buf[..n].copy_from_slice(&self.0[off..off + n]);
            Ok(n)
        }
        fn write(&mut self, _minor: usize, offset: u32, buf: &[u8]) -> Result<usize> {
            let off = offset as usize;
            let end = (off + buf.len()).min(self.0.len());
            let n = end.saturating_sub(off);
            self.0[off..off + n].copy_from_slice(&buf[..n]);
            Ok(n)
        }
    }

    struct NoEndpoint;
    impl Endpoint for NoEndpoint {
        fn write_all(&mut self, _buf: &[u8]) -> Result<()> {
            Ok(())
        }
        fn read_byte(&mut self, _timeout_ms: u32) -> Result<Option<u8>> {
            Ok(None)
        }
    }

    fn reg_with_flash() -> (Registry, &'static mut MemDev) {
        let dev: &'static mut MemDev = Box::leak(Box::new(MemDev(vec![0xAAu8; 64])));
        let mut reg = Registry::new();
        reg.register(major::FLASH, 1, dev);
        // SAFETY: test-only alias for asserting on buffer contents afterwards.
        let dev2 = unsafe { &mut *(dev as *mut MemDev) };
        (reg, dev2)
    }

    #[test]
    fn reg_dev_rejects_unpopulated_slot() {
        let mut phfs = Phfs::new();
        let reg = Registry::new();
        let err = phfs
            .reg_dev(&reg, "flash", major::FLASH, 0, Protocol::Raw)
            .unwrap_err();
        assert_eq!(err, Error::Invalid);
    }

    #[test]
    fn reg_dev_rejects_duplicate_alias() {
        let (reg, _) = reg_with_flash();
        let mut phfs = Phfs::new();
        phfs.reg_dev(&reg, "flash", major::FLASH, 0, Protocol::Raw).unwrap();
        let err = phfs
            .reg_dev(&reg, "flash", major::FLASH, 0, Protocol::Raw)
            .unwrap_err();
        assert_eq!(err, Error::Invalid);
    }

    #[test]
    fn raw_whole_device_read_write_round_trip() {
        let (mut reg, _) = reg_with_flash();
        let mut phfs = Phfs::new();
        phfs.reg_dev(&reg, "flash", major::FLASH, 0, Protocol::Raw).unwrap();
        let handler = phfs.open::<NoEndpoint>(None, "flash", None, 0).unwrap();

        phfs.write::<NoEndpoint>(&mut reg, None, handler, 0, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        let n = phfs.read::<NoEndpoint>(&mut reg, None, handler, 0, &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [1, 2, 3, 4]);
    }

    #[test]
    fn raw_named_file_clamps_to_bounds() {
        let (mut reg, _) = reg_with_flash();
        let mut phfs = Phfs::new();
        phfs.reg_dev(&reg, "flash", major::FLASH, 0, Protocol::Raw).unwrap();
        phfs.reg_file("kernel", 10, 4).unwrap();
        let handler = phfs.open::<NoEndpoint>(None, "flash", Some("kernel"), 0).unwrap();

        let mut buf = [0u8; 16];
        let n = phfs.read::<NoEndpoint>(&mut reg, None, handler, 0, &mut buf).unwrap();
        // file size is 4, so a 16-byte request clamps to 4 bytes.
        assert_eq!(n, 4);
    }

    /// Mirrors `flashdrv_map`'s ordering: full containment wins
    /// unconditionally and short-circuits before the mode check; only the
    /// non-containment fallback branch ever looks at `dev_mode`/`mem_mode`.
    struct MapDev(u32);
    impl DeviceHandler for MapDev {
        fn init(&mut self, _minor: usize) -> Result<()> {
            Ok(())
        }
        fn done(&mut self, _minor: usize) -> Result<()> {
            Ok(())
        }
        fn sync(&mut self, _minor: usize) -> Result<()> {
            Ok(())
        }
        fn read(&mut self, _minor: usize, _offset: u32, _buf: &mut [u8], _timeout_ms: u32) -> Result<usize> {
            Ok(0)
        }
        fn write(&mut self, _minor: usize, _offset: u32, _buf: &[u8]) -> Result<usize> {
            Ok(0)
        }
        fn map(
            &mut self,
            _minor: usize,
            dev_range: (u32, usize),
            dev_mode: u8,
            mem_range: (u32, usize),
            mem_mode: u8,
        ) -> Result<Option<u32>> {
            let (dev_start, dev_len) = dev_range;
            let (mem_start, mem_len) = mem_range;
            let dev_end = dev_start + dev_len as u32;
            let mem_end = mem_start + mem_len as u32;
            if dev_start <= mem_start && mem_end <= dev_end {
                return Ok(Some(self.0 + dev_start));
            }
            if dev_mode & mem_mode != dev_mode {
                return Err(Error::Invalid);
            }
            Ok(None)
        }
    }

    fn reg_with_map_dev() -> Registry {
        let dev: &'static mut MapDev = Box::leak(Box::new(MapDev(0x6000_0000)));
        let mut reg = Registry::new();
        reg.register(major::FLASH, 1, dev);
        reg
    }

    #[test]
    fn map_is_a_pure_passthrough_containment_wins_over_mode() {
        let mut reg = reg_with_map_dev();
        let mut phfs = Phfs::new();
        phfs.reg_dev(&reg, "flash", major::FLASH, 0, Protocol::Raw).unwrap();
        let handler = phfs.open::<NoEndpoint>(None, "flash", None, 0).unwrap();

        // dev_range fully contains mem_range, but dev_mode(WRITE) doesn't
        // cover mem_mode(READ): containment must still win, matching
        // `flashdrv_map`/`NorDevice::map`'s ordering, not short-circuit to
        // `None` before the device is ever consulted.
        let res = phfs
            .map(&mut reg, handler, (0x1000, 0x1000), 0b10, (0x1000, 0x100), 0b01)
            .unwrap();
        assert_eq!(res, Some(0x6000_1000));
    }

    #[test]
    fn map_rejects_mode_mismatch_only_outside_containment() {
        let mut reg = reg_with_map_dev();
        let mut phfs = Phfs::new();
        phfs.reg_dev(&reg, "flash", major::FLASH, 0, Protocol::Raw).unwrap();
        let handler = phfs.open::<NoEndpoint>(None, "flash", None, 0).unwrap();

        // mem_range not contained in dev_range, and dev_mode(WRITE) doesn't
        // cover mem_mode(READ): the device's fallback branch rejects it.
        let err = phfs
            .map(&mut reg, handler, (0x1000, 0x10), 0b10, (0x5000, 0x10), 0b01)
            .unwrap_err();
        assert_eq!(err, Error::Invalid);
    }
}
