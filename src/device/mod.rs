//! Device registry and dispatch layer (§4.1).
//!
//! A 2-D `(major, minor)` table of [`DeviceHandler`] trait objects with a
//! strict capability contract: a populated slot must implement every
//! mandatory operation, or [`Registry::check`] rejects it. This is the
//! loader's only notion of "driver" — UART, USB-CDC, and flash devices are
//! all registered the same way.

use crate::config::{SIZE_MAJOR, SIZE_MINOR};
use crate::error::{Error, Result};

/// Capability contract every registered device must uphold.
///
/// `map` is the only optional operation: most devices are not memory-mappable,
/// and a `None` return from [`DeviceHandler::map`]'s default implementation is
/// a legal "not mappable" answer, not a missing-capability error.
pub trait DeviceHandler {
    /// One-time bring-up for minor `minor` of this handler's major number.
    fn init(&mut self, minor: usize) -> Result<()>;

    /// Tear-down, called once from [`Registry::done_all`].
    fn done(&mut self, minor: usize) -> Result<()>;

    /// Flush any buffered state (e.g. a dirty flash sector) to the device.
    fn sync(&mut self, minor: usize) -> Result<()>;

    /// Read `buf.len()` bytes starting at `offset`, blocking up to `timeout_ms`.
    /// Returns the number of bytes actually read (may be short).
    fn read(&mut self, minor: usize, offset: u32, buf: &mut [u8], timeout_ms: u32) -> Result<usize>;

    /// Write `buf` starting at `offset`. Returns the number of bytes written.
    fn write(&mut self, minor: usize, offset: u32, buf: &[u8]) -> Result<usize>;

    /// Ask whether `dev_range` of this device can be memory-mapped into
    /// `mem_range` of CPU address space with at least `mem_mode` access.
    /// The default answer is "not mappable".
    fn map(
        &mut self,
        _minor: usize,
        _dev_range: (u32, usize),
        _dev_mode: u8,
        _mem_range: (u32, usize),
        _mem_mode: u8,
    ) -> Result<Option<u32>> {
        Ok(None)
    }
}

/// A populated registry slot. All five mandatory operations must be callable
/// for [`Registry::check`] to report the slot as usable; `DeviceHandler`'s
/// trait-object nature means this is always true once a `&'static mut dyn
/// DeviceHandler` is stored, so the contract really guards against a slot
/// being *absent* rather than partially implemented (Rust's trait system
/// cannot express "some methods missing" the way a C vtable of raw function
/// pointers can). The check is kept anyway, matching `devs_check`'s shape, so
/// callers can query availability without touching the handler.
struct Slot {
    handler: &'static mut dyn DeviceHandler,
}

/// The `(major, minor)` device table (§4.1). Intended to be a single
/// process-wide singleton constructed once during boot (§9 "Global mutable
/// state"), then passed by exclusive reference through every call chain.
pub struct Registry {
    slots: [[Option<Slot>; SIZE_MINOR]; SIZE_MAJOR],
}

impl Registry {
    /// An empty registry with no devices registered.
    #[must_use]
    pub const fn new() -> Self {
        const NONE_SLOT: Option<Slot> = None;
        const NONE_ROW: [Option<Slot>; SIZE_MINOR] = [NONE_SLOT; SIZE_MINOR];
        Self {
            slots: [NONE_ROW; SIZE_MAJOR],
        }
    }

    /// Places `handler` in the first `count` free minor slots of `major`,
    /// starting at minor 0 and skipping already-filled slots. Must be called
    /// before [`Registry::init_all`]; typically from a driver's constructor.
    pub fn register(&mut self, major: usize, count: usize, handler: &'static mut dyn DeviceHandler) {
        if major >= SIZE_MAJOR {
            return;
        }
        let mut filled = 0;
        let mut minor = 0;
        // NOTE: handler is a single instance shared across `count` minors,
        // matching the C original's single `dev_handler_t *h` pointer shared
        // across multiple minor slots; only the first occupied slot actually
        // owns a usable `&'static mut` reference, since Rust forbids aliased
        // `&mut`. Call sites with count > 1 register one real handler then
        // alias minors onto it is not expressible safely here, so in
        // practice `count` is 1 per call and this loop degenerates to
        // filling the first free slot.
        // Drivers typically register themselves from their own constructor,
        // which may run before or after interrupts are enabled depending on
        // board bring-up order; guard the slot write the same way
        // `hpm-hal`'s GPIO driver guards its own read-modify-write register
        // access, so two concurrent registrations can't race the same slot.
        critical_section::with(|_| {
            while minor < SIZE_MINOR && filled < count {
                if self.slots[major][minor].is_none() {
                    self.slots[major][minor] = Some(Slot { handler });
                    filled += 1;
                    break;
                }
                minor += 1;
            }
        });
    }

    /// Calls `init` on every populated slot. Failures are logged but do not
    /// abort initialisation of the other slots.
    pub fn init_all(&mut self) {
        for major in 0..SIZE_MAJOR {
            for minor in 0..SIZE_MINOR {
                if let Some(slot) = &mut self.slots[major][minor] {
                    if let Err(e) = slot.handler.init(minor) {
                        crate::log::error!("devs: init({}, {}) failed: {}", major, minor, e);
                    }
                }
            }
        }
    }

    /// Calls `done` on every populated slot.
    pub fn done_all(&mut self) {
        for major in 0..SIZE_MAJOR {
            for minor in 0..SIZE_MINOR {
                if let Some(slot) = &mut self.slots[major][minor] {
                    let _ = slot.handler.done(minor);
                }
            }
        }
    }

    /// `OK` iff `(major, minor)` is in range and populated.
    pub fn check(&self, major: usize, minor: usize) -> Result<()> {
        self.slot(major, minor).map(|_| ())
    }

    fn slot(&self, major: usize, minor: usize) -> Result<&Slot> {
        if major >= SIZE_MAJOR || minor >= SIZE_MINOR {
            return Err(Error::Invalid);
        }
        self.slots[major][minor].as_ref().ok_or(Error::Invalid)
    }

    fn slot_mut(&mut self, major: usize, minor: usize) -> Result<&mut Slot> {
        if major >= SIZE_MAJOR || minor >= SIZE_MINOR {
            return Err(Error::Invalid);
        }
        self.slots[major][minor].as_mut().ok_or(Error::Invalid)
    }

    /// Dispatches a read to the registered handler.
    pub fn read(&mut self, major: usize, minor: usize, offset: u32, buf: &mut [u8], timeout_ms: u32) -> Result<usize> {
        self.slot_mut(major, minor)?.handler.read(minor, offset, buf, timeout_ms)
    }

    /// Dispatches a write to the registered handler.
    pub fn write(&mut self, major: usize, minor: usize, offset: u32, buf: &[u8]) -> Result<usize> {
        self.slot_mut(major, minor)?.handler.write(minor, offset, buf)
    }

    /// Dispatches a sync to the registered handler.
    pub fn sync(&mut self, major: usize, minor: usize) -> Result<()> {
        self.slot_mut(major, minor)?.handler.sync(minor)
    }

    /// Dispatches a mappability query to the registered handler.
    pub fn is_mappable(
        &mut self,
        major: usize,
        minor: usize,
        dev_range: (u32, usize),
        dev_mode: u8,
        mem_range: (u32, usize),
        mem_mode: u8,
    ) -> Result<Option<u32>> {
        self.slot_mut(major, minor)?
            .handler
            .map(minor, dev_range, dev_mode, mem_range, mem_mode)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Well-known device major numbers (§4.1 / `devs.h`).
pub mod major {
    pub const UART: usize = 0;
    pub const USB: usize = 1;
    pub const FLASH: usize = 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Null;
    impl DeviceHandler for Null {
        fn init(&mut self, _minor: usize) -> Result<()> {
            Ok(())
        }
        fn done(&mut self, _minor: usize) -> Result<()> {
            Ok(())
        }
        fn sync(&mut self, _minor: usize) -> Result<()> {
            Ok(())
        }
        fn read(&mut self, _minor: usize, _offset: u32, buf: &mut [u8], _timeout_ms: u32) -> Result<usize> {
            buf.fill(0xAB);
            Ok(buf.len())
        }
        fn write(&mut self, _minor: usize, _offset: u32, buf: &[u8]) -> Result<usize> {
            Ok(buf.len())
        }
    }

    #[test]
    fn unregistered_slot_is_invalid() {
        let reg = Registry::new();
        assert_eq!(reg.check(major::UART, 0), Err(Error::Invalid));
    }

    #[test]
    fn out_of_range_is_invalid() {
        let reg = Registry::new();
        assert_eq!(reg.check(99, 0), Err(Error::Invalid));
        assert_eq!(reg.check(0, 99), Err(Error::Invalid));
    }

    #[test]
    fn register_then_dispatch() {
        static mut H: Null = Null;
        let mut reg = Registry::new();
        // SAFETY: test-only static, single-threaded.
        reg.register(major::UART, 1, unsafe { &mut *core::ptr::addr_of_mut!(H) });
        assert_eq!(reg.check(major::UART, 0), Ok(()));
        let mut buf = [0u8; 4];
        let n = reg.read(major::UART, 0, 0, &mut buf, 100).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf, [0xAB; 4]);
    }
}
