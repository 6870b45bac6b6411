//! Build-time capacity constants.
//!
//! These mirror the `#define`s scattered across the original `plo` sources
//! (`SIZE_MAJOR`, `SIZE_PHFS_HANDLERS`, `MAX_PROGRAMS_NB`, ...) collected in
//! one place, the way `hpm-hal` collects its per-chip-variant constants under
//! `sysctl::v53`/`v63`/... .

/// Number of device major numbers (`DEV_UART`, `DEV_USB`, `DEV_FLASH`, ...).
pub const SIZE_MAJOR: usize = 4;
/// Number of minor slots per major number.
pub const SIZE_MINOR: usize = 16;

/// Maximum number of phfs device bindings (aliases to `(major, minor)`).
pub const SIZE_PHFS_HANDLERS: usize = 8;
/// Maximum number of phfs named file entries.
pub const SIZE_PHFS_FILES: usize = 20;

/// Timeout, in milliseconds, used for phfs raw-device reads/writes.
pub const PHFS_TIMEOUT_MS: u32 = 500;

/// Maximum number of named memory maps.
pub const MAX_MAPS: usize = 16;
/// Maximum number of program (application) entries.
pub const MAX_PROGRAMS: usize = 32;
/// Maximum length of a memory map name, excluding the NUL terminator.
pub const MAX_MAP_NAME_LEN: usize = 7;
/// Maximum length of a program name, excluding the NUL terminator.
pub const MAX_PROG_NAME_LEN: usize = 31;
/// Maximum size of the syspage argument string, including the NUL terminator.
pub const MAX_ARGS_SIZE: usize = 256;
/// Occupied-range slots tracked per map: kernel text/data/bss, plo's own
/// sections, and the syspage region itself.
pub const MAX_OCCUPIED_ENTRIES: usize = 6;

/// Approximate size reserved for the syspage region itself.
pub const SYSPAGE_RESERVED_SIZE: usize = 8 * 1024;

/// Maximum number of hardware MPU regions a single program's table may use.
pub const MAX_MPU_REGIONS: usize = 16;

/// Framed-transport sentinel bytes (§4.2).
pub const MSG_MARK: u8 = 0x7E;
pub const MSG_ESC: u8 = 0x7D;
pub const MSG_ESCMARK: u8 = 0x5E;
pub const MSG_ESCESC: u8 = 0x5D;

/// Maximum payload length of a single framed message.
pub const MSG_MAXLEN: usize = 512;
/// Reply deadline for a single framed request.
pub const MSGRECV_TIMEOUT_MS: u32 = 500;
/// Maximum number of send attempts (1 initial + up to 2 retransmits).
pub const MSGRECV_MAXRETR: u32 = 3;

/// Default NOR flash page-program size.
pub const DEFAULT_PAGE_SIZE: usize = 256;
/// Default NOR flash sector-erase size.
pub const DEFAULT_SECTOR_SIZE: usize = 0x1000;
/// FlexSPI per-transfer cap for IP reads/writes before the AHB-mapped window
/// short-circuit kicks in.
pub const FLEXSPI_MAX_IP_TRANSFER: usize = 64 * 1024;
/// Default deadline for flash bus operations with no caller-supplied
/// timeout (erase/program/bring-up); `0` means wait forever.
pub const FLASH_TIMEOUT_MS: u32 = 5_000;
