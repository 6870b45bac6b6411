//! Monotonic millisecond clock and the blocking wait primitive built on it.
//!
//! The concrete tick source (SysTick, a SoC timer, ...) is an external
//! collaborator (§1); this crate only needs the millisecond counter and a
//! cancellable wait, modeled as a small trait so the algorithmic core stays
//! host-testable (§10 "Test tooling").

/// A free-running millisecond counter.
pub trait Clock {
    /// Milliseconds elapsed since an arbitrary epoch. Must be monotonic and
    /// must not overflow within any single boot.
    fn now_ms(&self) -> u32;
}

/// Extra cancellation conditions for [`wait_ms`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub struct WaitFlags {
    /// Cancel early if a key is pressed (console input ready).
    pub keyb: bool,
    /// Cancel early if `*watch != expect` becomes true.
    pub valchg: bool,
}

/// Outcome of a cancellable wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub enum WaitResult {
    /// The full delay elapsed.
    Elapsed,
    /// A key was pressed before the delay elapsed.
    KeyPressed,
    /// The watched value changed before the delay elapsed.
    ValueChanged,
}

/// Poll source for the `keyb`/`valchg` cancellation conditions.
///
/// Kept separate from [`Clock`] because not every caller of [`wait_ms`] wants
/// to poll a key or a watched value; a no-op implementation is always valid.
pub trait WaitSource {
    /// Returns `true` if a key is currently available at the console.
    fn key_pressed(&mut self) -> bool {
        false
    }
}

/// Blocking millisecond delay with optional early cancellation.
///
/// Mirrors `timer_wait(ms, flags, value_ptr, value)`: polls `clock` in a busy
/// loop (the caller is expected to insert `WFI` between polls on real
/// hardware; that is a platform detail this crate does not model) until `ms`
/// milliseconds have elapsed, or until `flags.keyb` is set and a key becomes
/// available, or until `flags.valchg` is set and `*watch != expect`.
pub fn wait_ms<C: Clock, S: WaitSource>(
    clock: &C,
    source: &mut S,
    ms: u32,
    flags: WaitFlags,
    watch: Option<(&core::sync::atomic::AtomicU32, u32)>,
) -> WaitResult {
    let deadline = clock.now_ms().wrapping_add(ms);
    loop {
        if flags.keyb && source.key_pressed() {
            return WaitResult::KeyPressed;
        }
        if flags.valchg {
            if let Some((cell, expect)) = watch {
                if cell.load(core::sync::atomic::Ordering::Relaxed) != expect {
                    return WaitResult::ValueChanged;
                }
            }
        }
        if clock.now_ms().wrapping_sub(deadline) < u32::MAX / 2 {
            // now_ms has reached or passed the deadline (wrapping-aware compare)
            return WaitResult::Elapsed;
        }
    }
}

/// Returns `true` once `clock.now_ms()` has reached or passed `deadline`,
/// tolerating millisecond-counter wraparound.
#[must_use]
pub fn deadline_elapsed<C: Clock>(clock: &C, deadline: u32) -> bool {
    clock.now_ms().wrapping_sub(deadline) < u32::MAX / 2
}

/// Adapts any [`Clock`] into an `embedded-hal` blocking delay, for board
/// code that wants to hand this crate's tick source to a driver written
/// against that ecosystem trait instead of calling [`wait_ms`] directly.
pub struct BusyDelay<C>(pub C);

impl<C: Clock> embedded_hal::delay::DelayNs for BusyDelay<C> {
    fn delay_ns(&mut self, ns: u32) {
        let ms = ns / 1_000_000;
        let deadline = self.0.now_ms().wrapping_add(ms.max(1));
        while !deadline_elapsed(&self.0, deadline) {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeClock(Cell<u32>);
    impl Clock for FakeClock {
        fn now_ms(&self) -> u32 {
            let v = self.0.get();
            self.0.set(v + 1);
            v
        }
    }
    struct NoSource;
    impl WaitSource for NoSource {}

    #[test]
    fn wait_elapses() {
        let clock = FakeClock(Cell::new(0));
        let mut src = NoSource;
        let res = wait_ms(&clock, &mut src, 3, WaitFlags::default(), None);
        assert_eq!(res, WaitResult::Elapsed);
    }

    #[test]
    fn busy_delay_implements_embedded_hal() {
        use embedded_hal::delay::DelayNs;
        let mut delay = BusyDelay(FakeClock(Cell::new(0)));
        delay.delay_ns(5_000_000); // 5ms, well within FakeClock's 1-tick-per-poll budget
    }

    #[test]
    fn deadline_wraps_cleanly() {
        let clock = FakeClock(Cell::new(u32::MAX - 1));
        assert!(!deadline_elapsed(&clock, u32::MAX));
        assert!(deadline_elapsed(&clock, u32::MAX));
    }
}
