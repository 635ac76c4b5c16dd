//! Compile-time board configuration and the HAL traits this crate's
//! dispatcher is generic over.
//!
//! Everything in this module is a contract: physical byte I/O, the MCU
//! flash controller, and board-identification data are implemented by the
//! integrator. This crate never names a concrete MCU.

/// A single erasable region of the flash controller's sector map.
///
/// [`Flash::SECTORS`] is terminated by a zero-sized [`Sector`], matching
/// the source bootloader's "iterate until a zero-sized terminator" idiom
/// (spec §4.G `erase_all`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sector {
    pub base: u32,
    pub size: u32,
}

impl Sector {
    pub const TERMINATOR: Sector = Sector { base: 0, size: 0 };

    pub const fn is_terminator(&self) -> bool {
        self.size == 0
    }
}

/// Flash read/write/erase primitives for the application region.
///
/// All addresses are byte offsets from [`Board::APP_LOAD_ADDRESS`], not
/// absolute addresses; the implementor adds its own base.
pub trait Flash {
    /// Sector map for the application region, terminated by
    /// [`Sector::TERMINATOR`].
    const SECTORS: &'static [Sector];

    /// Erase one sector. `base` is one of [`Self::SECTORS`]'s `base` values.
    fn erase_sector(&mut self, base: u32) -> Result<(), FlashFault>;

    /// Program one 32-bit word at a word-aligned offset.
    fn write_word(&mut self, offset: u32, value: u32) -> Result<(), FlashFault>;

    /// Read back one 32-bit word at a word-aligned offset.
    fn read_word(&mut self, offset: u32) -> Result<u32, FlashFault>;
}

/// Failure signal from the flash HAL. Always maps to `Fault::Flash` at the
/// dispatcher boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashFault;

/// One physical byte-stream interface (USB-CDC, UART, ...).
pub trait PhysicalChannel {
    /// Non-blocking poll; `None` if nothing is queued.
    fn try_read_byte(&mut self) -> Option<u8>;

    /// Write bytes out this interface. Best-effort; the physical layer is
    /// assumed to buffer or block as it sees fit.
    fn write_bytes(&mut self, buf: &[u8]);
}

/// Board-identification data and optional per-board gating hooks.
///
/// An implementor with no silicon errata to check returns `Ok(())` from
/// [`Board::check_silicon`] unconditionally.
pub trait Board {
    /// Size in bytes of the application flash region starting at
    /// `APP_LOAD_ADDRESS`. Word 0 of the region is the application's
    /// initial stack pointer, word 1 its entry point (spec §6).
    const FW_SIZE: u32;

    /// Protocol-level board identifier returned by `GET_DEVICE` sub-arg 2.
    const BOARD_ID: u32;

    /// Protocol-level board revision returned by `GET_DEVICE` sub-arg 3.
    const BOARD_REV: u32;

    /// Absolute flash address of the two-word boot-delay signature
    /// (`SIG1`/`SIG2`). `SET_DELAY` requires both words already present;
    /// there is no command to install them (spec §9, Open Question).
    const BOOT_DELAY_ADDRESS: u32;
    const BOOT_DELAY_SIG1: u32;
    const BOOT_DELAY_SIG2: u32;
    const BOOT_DELAY_MAX: u8;

    /// MCU ID code returned by `GET_CHIP`.
    const CHIP_ID: u32;

    /// ASCII description returned by `GET_CHIP_DES`.
    const CHIP_DESCRIPTION: &'static [u8];

    /// Read one word from the one-time-programmable region. `index` is the
    /// raw wire argument to `GET_OTP`.
    fn otp_word(index: u32) -> Option<u32>;

    /// Read one word from the factory unique-device-ID region. `index` is
    /// the raw wire argument to `GET_SN`.
    fn unique_id_word(index: u32) -> Option<u32>;

    /// Errata gate for boards that must refuse to run on an affected
    /// silicon revision. Boards without an errata check return `Ok(())`.
    fn check_silicon() -> Result<(), ()>;

    /// Read the current value of the boot-delay signature's first word,
    /// used by `SET_DELAY` to confirm the signature is present before
    /// patching its low byte.
    fn read_boot_delay_sig1() -> u32;

    /// Read the current value of the boot-delay signature's second word,
    /// checked alongside [`Board::read_boot_delay_sig1`] before `SET_DELAY`
    /// is allowed to patch anything.
    fn read_boot_delay_sig2() -> u32;

    /// Patch the low byte of `SIG1` in place.
    fn write_boot_delay_low_byte(value: u8) -> Result<(), FlashFault>;
}
