//! Command dispatcher (component I): the main state machine. Reads an
//! opcode byte, selects a handler, enforces per-command timeouts and
//! framing, emits the response, and manages the session timeout
//! (spec §4.I).
//!
//! Each handler below returns `Result<ReplyData, Fault>`; `dispatch` (not
//! the handler) turns that into the wire-level [`Status`] and decides
//! whether the session timeout gets disabled, per spec §9's "replace
//! `goto cmd_bad`/`cmd_fail` with a tagged result" redesign note.

use crate::board::{Board, Flash, PhysicalChannel};
use crate::channel::ChannelMux;
use crate::fault::Fault;
use crate::flash::FlashProgrammer;
use crate::framing::{expect_eoc, read_byte, read_word_le, timeout_ms};
use crate::response::{emit, Status};
use crate::timer::{LedMode, TimerId, Timers};
use core::marker::PhantomData;
use pow2::Pow2;

#[cfg(feature = "encryption")]
use crate::decrypt::{decrypt_cbc, parse_header, AesKey};
#[cfg(feature = "encryption")]
use crate::keystate::{self, KeyState, KeyStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    GetSync = 0x21,
    GetDevice = 0x22,
    ChipErase = 0x23,
    ProgMulti = 0x27,
    GetCrc = 0x29,
    GetOtp = 0x2A,
    GetSn = 0x2B,
    GetChip = 0x2C,
    SetDelay = 0x2D,
    GetChipDes = 0x2E,
    Boot = 0x30,
    Debug = 0x31,
    #[cfg(feature = "encryption")]
    SetIv = 0x36,
    #[cfg(feature = "encryption")]
    ProgMultiEncrypted = 0x37,
    #[cfg(feature = "encryption")]
    CheckCrc = 0x38,
    #[cfg(feature = "encryption")]
    CheckKey = 0x39,
}

impl Opcode {
    fn from_byte(byte: u8) -> Option<Self> {
        Some(match byte {
            0x21 => Self::GetSync,
            0x22 => Self::GetDevice,
            0x23 => Self::ChipErase,
            0x27 => Self::ProgMulti,
            0x29 => Self::GetCrc,
            0x2A => Self::GetOtp,
            0x2B => Self::GetSn,
            0x2C => Self::GetChip,
            0x2D => Self::SetDelay,
            0x2E => Self::GetChipDes,
            0x30 => Self::Boot,
            0x31 => Self::Debug,
            #[cfg(feature = "encryption")]
            0x36 => Self::SetIv,
            #[cfg(feature = "encryption")]
            0x37 => Self::ProgMultiEncrypted,
            #[cfg(feature = "encryption")]
            0x38 => Self::CheckCrc,
            #[cfg(feature = "encryption")]
            0x39 => Self::CheckKey,
            _ => return None,
        })
    }
}

pub const BL_PROTOCOL_VERSION: u32 = 7;
const MAX_PROG_MULTI_BYTES: usize = 252; // largest multiple of 4 below the wire length byte's range
const MAX_REPLY_DATA: usize = 68; // 4-byte length prefix + up to 64 bytes of chip description

/// `PROG_MULTI` payloads must land on word boundaries (spec §4.G).
const WORD_ALIGN: Pow2 = pow2::pow2_const!(4);

/// Fixed-capacity buffer for a handler's data reply, written before the
/// trailing `INSYNC`/status (spec §4.D).
#[derive(Default)]
pub struct ReplyData {
    buf: [u8; MAX_REPLY_DATA],
    len: usize,
}

impl ReplyData {
    pub fn empty() -> Self {
        Self::default()
    }

    fn push(&mut self, bytes: &[u8]) {
        self.buf[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    fn as_slice(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

/// Why `run` returned control to the caller (spec §6 "Exit paths").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// No successful command arrived within the session timeout; the
    /// caller should attempt to jump to the installed application if one
    /// is present.
    SessionTimeout,
    /// `BOOT` finalized the deferred first word and the caller should jump
    /// to the installed application.
    Booted,
}

type HandlerResult = Result<ReplyData, Fault>;

fn ok_empty() -> HandlerResult {
    Ok(ReplyData::empty())
}

fn ok_u32(value: u32) -> HandlerResult {
    let mut r = ReplyData::empty();
    r.push(&value.to_le_bytes());
    Ok(r)
}

fn read_simple_eoc<A, B>(mux: &mut ChannelMux<A, B>, timers: &Timers, poll: impl FnMut()) -> Result<(), Fault>
where
    A: PhysicalChannel,
    B: PhysicalChannel,
{
    expect_eoc(mux, timers, timeout_ms::EOC_AFTER_SIMPLE, poll)
}

fn handle_get_device<A, B, BD, F>(
    mux: &mut ChannelMux<A, B>,
    timers: &Timers,
    flash: &mut F,
    mut poll: impl FnMut(),
) -> HandlerResult
where
    A: PhysicalChannel,
    B: PhysicalChannel,
    BD: Board,
    F: Flash,
{
    let sub = read_byte(mux, timers, timeout_ms::GET_DEVICE_ARG, &mut poll)?;
    read_simple_eoc(mux, timers, &mut poll)?;

    match sub {
        1 => ok_u32(BL_PROTOCOL_VERSION),
        2 => ok_u32(BD::BOARD_ID),
        3 => ok_u32(BD::BOARD_REV),
        4 => ok_u32(BD::FW_SIZE),
        5 => {
            let mut r = ReplyData::empty();
            for word_index in 7..11u32 {
                let word = flash.read_word(word_index * 4).map_err(|_| Fault::Flash)?;
                r.push(&word.to_le_bytes());
            }
            Ok(r)
        }
        _ => Err(Fault::Argument),
    }
}

fn handle_chip_erase<A, B, BD, F>(
    mux: &mut ChannelMux<A, B>,
    timers: &Timers,
    flash: &mut F,
    prog: &mut FlashProgrammer,
    mut poll: impl FnMut(),
) -> HandlerResult
where
    A: PhysicalChannel,
    B: PhysicalChannel,
    BD: Board,
    F: Flash,
{
    read_simple_eoc(mux, timers, &mut poll)?;

    BD::check_silicon().map_err(|_| Fault::Silicon)?;

    timers.set_led_mode(LedMode::On);
    let result = prog.erase_all::<F, BD>(flash, || timers.set_led_mode(LedMode::Off));
    timers.set_led_mode(LedMode::Blink);

    result?;
    ok_empty()
}

fn read_prog_multi_payload<A, B>(
    mux: &mut ChannelMux<A, B>,
    timers: &Timers,
    buf: &mut [u8; MAX_PROG_MULTI_BYTES],
    mut poll: impl FnMut(),
) -> Result<usize, Fault>
where
    A: PhysicalChannel,
    B: PhysicalChannel,
{
    let len = read_byte(mux, timers, timeout_ms::PROG_MULTI_LEN, &mut poll)? as usize;
    if len == 0 || !WORD_ALIGN.is_aligned(len as u32) || len > MAX_PROG_MULTI_BYTES {
        return Err(Fault::Argument);
    }
    for slot in &mut buf[..len] {
        *slot = read_byte(mux, timers, timeout_ms::PROG_MULTI_BYTE, &mut poll)?;
    }
    expect_eoc(mux, timers, timeout_ms::EOC_AFTER_PROG_MULTI, &mut poll)?;
    Ok(len)
}

fn bytes_to_words(bytes: &[u8], words: &mut [u32]) -> usize {
    let n = bytes.len() / 4;
    for (i, chunk) in bytes.chunks_exact(4).enumerate() {
        words[i] = u32::from_le_bytes(chunk.try_into().unwrap());
    }
    n
}

fn handle_prog_multi<A, B, BD, F>(
    mux: &mut ChannelMux<A, B>,
    timers: &Timers,
    flash: &mut F,
    prog: &mut FlashProgrammer,
    mut poll: impl FnMut(),
) -> HandlerResult
where
    A: PhysicalChannel,
    B: PhysicalChannel,
    BD: Board,
    F: Flash,
{
    let mut buf = [0u8; MAX_PROG_MULTI_BYTES];
    let len = read_prog_multi_payload(mux, timers, &mut buf, &mut poll)?;

    let mut words = [0u32; MAX_PROG_MULTI_BYTES / 4];
    let n = bytes_to_words(&buf[..len], &mut words);

    prog.append::<F, BD>(flash, &words[..n])?;
    ok_empty()
}

fn handle_get_crc<F: Flash>(flash: &mut F, prog: &mut FlashProgrammer, fw_size: u32) -> HandlerResult {
    let crc = prog.checksum(flash, fw_size)?;
    ok_u32(crc)
}

fn handle_get_otp<A, B, BD>(mux: &mut ChannelMux<A, B>, timers: &Timers, mut poll: impl FnMut()) -> HandlerResult
where
    A: PhysicalChannel,
    B: PhysicalChannel,
    BD: Board,
{
    let index = read_word_le(mux, timers, timeout_ms::OTP_OR_SN_ADDR, &mut poll)?;
    read_simple_eoc(mux, timers, &mut poll)?;
    let word = BD::otp_word(index).ok_or(Fault::Argument)?;
    ok_u32(word)
}

fn handle_get_sn<A, B, BD>(mux: &mut ChannelMux<A, B>, timers: &Timers, mut poll: impl FnMut()) -> HandlerResult
where
    A: PhysicalChannel,
    B: PhysicalChannel,
    BD: Board,
{
    let index = read_word_le(mux, timers, timeout_ms::OTP_OR_SN_ADDR, &mut poll)?;
    read_simple_eoc(mux, timers, &mut poll)?;
    let word = BD::unique_id_word(index).ok_or(Fault::Argument)?;
    ok_u32(word)
}

fn handle_get_chip_des<BD: Board>() -> HandlerResult {
    let desc = BD::CHIP_DESCRIPTION;
    if desc.len() > MAX_REPLY_DATA - 4 {
        return Err(Fault::Argument);
    }
    let mut r = ReplyData::empty();
    r.push(&(desc.len() as u32).to_le_bytes());
    r.push(desc);
    Ok(r)
}

fn handle_set_delay<A, B, BD>(mux: &mut ChannelMux<A, B>, timers: &Timers, mut poll: impl FnMut()) -> HandlerResult
where
    A: PhysicalChannel,
    B: PhysicalChannel,
    BD: Board,
{
    let seconds = read_byte(mux, timers, timeout_ms::SET_DELAY_ARG, &mut poll)?;
    read_simple_eoc(mux, timers, &mut poll)?;

    if seconds > BD::BOOT_DELAY_MAX {
        return Err(Fault::Argument);
    }
    if BD::read_boot_delay_sig1() != BD::BOOT_DELAY_SIG1 || BD::read_boot_delay_sig2() != BD::BOOT_DELAY_SIG2 {
        return Err(Fault::Integrity);
    }
    BD::write_boot_delay_low_byte(seconds).map_err(|_| Fault::Flash)?;
    ok_empty()
}

fn handle_boot<A, B, F>(
    mux: &mut ChannelMux<A, B>,
    timers: &Timers,
    flash: &mut F,
    prog: &mut FlashProgrammer,
    mut poll: impl FnMut(),
) -> HandlerResult
where
    A: PhysicalChannel,
    B: PhysicalChannel,
    F: Flash,
{
    expect_eoc(mux, timers, timeout_ms::EOC_AFTER_BOOT, &mut poll)?;
    prog.finalize(flash)?;
    ok_empty()
}

#[cfg(feature = "encryption")]
const MAX_ENCRYPTED_BYTES: usize = 240; // largest multiple of 16 below decrypt::MAX_ENCRYPTED_LEN

#[cfg(feature = "encryption")]
const SET_IV_TIMEOUT_MS: u32 = timeout_ms::PROG_MULTI_BYTE;

/// `PROG_MULTI_ENCRYPTED` payloads are whole AES blocks (spec §4.H).
#[cfg(feature = "encryption")]
const BLOCK_ALIGN: Pow2 = pow2::pow2_const!(16);

#[cfg(feature = "encryption")]
struct EncState<K> {
    key_storage: K,
    key_state: KeyState,
    cipher: Option<AesKey>,
    iv: [u8; 16],
    declared_length: u32,
    declared_crc: u32,
}

#[cfg(feature = "encryption")]
fn handle_set_iv<A, B>(
    mux: &mut ChannelMux<A, B>,
    timers: &Timers,
    iv: &mut [u8; 16],
    mut poll: impl FnMut(),
) -> HandlerResult
where
    A: PhysicalChannel,
    B: PhysicalChannel,
{
    for slot in iv.iter_mut() {
        *slot = read_byte(mux, timers, SET_IV_TIMEOUT_MS, &mut poll)?;
    }
    read_simple_eoc(mux, timers, &mut poll)?;
    ok_empty()
}

#[cfg(feature = "encryption")]
fn handle_prog_multi_encrypted<A, B, BD, F, K>(
    mux: &mut ChannelMux<A, B>,
    timers: &Timers,
    flash: &mut F,
    prog: &mut FlashProgrammer,
    enc: &mut EncState<K>,
    mut poll: impl FnMut(),
) -> HandlerResult
where
    A: PhysicalChannel,
    B: PhysicalChannel,
    BD: Board,
    F: Flash,
{
    let len = read_byte(mux, timers, timeout_ms::PROG_MULTI_LEN, &mut poll)? as usize;
    if len == 0 || !BLOCK_ALIGN.is_aligned(len as u32) || len > MAX_ENCRYPTED_BYTES {
        return Err(Fault::Argument);
    }

    let mut buf = [0u8; MAX_ENCRYPTED_BYTES];
    for slot in &mut buf[..len] {
        *slot = read_byte(mux, timers, timeout_ms::PROG_MULTI_BYTE, &mut poll)?;
    }
    expect_eoc(mux, timers, timeout_ms::EOC_AFTER_PROG_MULTI, &mut poll)?;

    if enc.key_state != KeyState::Valid {
        return Err(Fault::Key);
    }
    let cipher = enc.cipher.as_ref().expect("key_state Valid implies a loaded cipher");

    let plaintext = &mut buf[..len];
    decrypt_cbc(cipher, &mut enc.iv, plaintext)?;

    let body = if prog.write_cursor() == 0 {
        let header = parse_header(plaintext);
        enc.declared_length = header.declared_length;
        enc.declared_crc = header.declared_crc;
        &plaintext[16..]
    } else {
        &plaintext[..]
    };

    let mut words = [0u32; MAX_ENCRYPTED_BYTES / 4];
    let n = bytes_to_words(body, &mut words);
    prog.append::<F, BD>(flash, &words[..n])?;
    ok_empty()
}

#[cfg(feature = "encryption")]
fn handle_check_crc<F: Flash, BD: Board>(
    flash: &mut F,
    prog: &mut FlashProgrammer,
    declared_length: u32,
    declared_crc: u32,
) -> HandlerResult {
    if declared_length > BD::FW_SIZE {
        return Err(Fault::Integrity);
    }
    let crc = prog.checksum(flash, declared_length)?;
    if crc != declared_crc {
        return Err(Fault::Integrity);
    }
    ok_empty()
}

#[cfg(feature = "encryption")]
fn handle_check_key(key_state: KeyState) -> HandlerResult {
    match key_state {
        KeyState::Valid => ok_empty(),
        KeyState::Invalid => Err(Fault::Key),
    }
}

#[cfg(feature = "encryption")]
fn key_bytes<K: KeyStorage>(storage: &mut K) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    for i in 0..4 {
        bytes[i * 4..i * 4 + 4].copy_from_slice(&storage.read_key_word(i).to_le_bytes());
    }
    bytes
}

/// Generic over the two physical channels, the flash HAL, and the board
/// configuration. `K` is only meaningful under the `encryption` feature
/// (spec §9's Cargo-feature redesign for components F/H); non-encrypted
/// builds use the default `()`.
pub struct Dispatcher<A, B, F, BD, K = ()> {
    mux: ChannelMux<A, B>,
    flash: F,
    prog: FlashProgrammer,
    _board: PhantomData<BD>,
    #[cfg(feature = "encryption")]
    enc: EncState<K>,
    #[cfg(not(feature = "encryption"))]
    _key: PhantomData<K>,
}

#[cfg(not(feature = "encryption"))]
impl<A, B, F, BD> Dispatcher<A, B, F, BD, ()>
where
    A: PhysicalChannel,
    B: PhysicalChannel,
    F: Flash,
    BD: Board,
{
    pub fn new(first: A, second: B, flash: F) -> Self {
        Self {
            mux: ChannelMux::new(first, second),
            flash,
            prog: FlashProgrammer::new::<BD>(),
            _board: PhantomData,
            _key: PhantomData,
        }
    }

    pub fn write_cursor(&self) -> u32 {
        self.prog.write_cursor()
    }

    /// Run the dispatcher until a successful `BOOT` or a session timeout.
    /// `poll` is invoked while idle and while waiting on framing reads; on
    /// real hardware it's typically `WFI`-then-return, in tests it
    /// advances the fake clock.
    pub fn run(&mut self, timers: &Timers, timeout_ms: u32, mut poll: impl FnMut()) -> ExitReason {
        let mut session_timeout_enabled = timeout_ms > 0;
        if session_timeout_enabled {
            timers.load(TimerId::SessionWait, timeout_ms);
        }

        loop {
            if session_timeout_enabled && timers.expired(TimerId::SessionWait) {
                log::debug!("session timeout expired with no successful command");
                return ExitReason::SessionTimeout;
            }

            let Ok(opcode_byte) = read_byte(&mut self.mux, timers, timeout_ms::IDLE_POLL, &mut poll) else {
                poll();
                continue;
            };

            let Some(opcode) = Opcode::from_byte(opcode_byte) else {
                continue;
            };

            log::trace!("dispatching opcode {:#04x}", opcode_byte);
            let result = self.dispatch(opcode, timers, &mut poll);
            let status = match &result {
                Ok(_) => Status::Ok,
                Err(fault) => Status::for_fault(*fault),
            };

            if status == Status::Ok {
                self.mux.pin_if_unset();
                session_timeout_enabled = false;
                timers.clear(TimerId::SessionWait);
            }

            let data = result.as_ref().map(ReplyData::as_slice).unwrap_or(&[]);
            emit(&mut self.mux, data, status);

            if status == Status::Ok && opcode == Opcode::Boot {
                crate::timer::delay(timers, 100, &mut poll);
                return ExitReason::Booted;
            }
        }
    }

    fn dispatch(&mut self, opcode: Opcode, timers: &Timers, mut poll: impl FnMut()) -> HandlerResult {
        match opcode {
            Opcode::GetSync => {
                read_simple_eoc(&mut self.mux, timers, &mut poll)?;
                ok_empty()
            }
            Opcode::GetDevice => handle_get_device::<_, _, BD, _>(&mut self.mux, timers, &mut self.flash, poll),
            Opcode::ChipErase => {
                handle_chip_erase::<_, _, BD, _>(&mut self.mux, timers, &mut self.flash, &mut self.prog, poll)
            }
            Opcode::ProgMulti => {
                handle_prog_multi::<_, _, BD, _>(&mut self.mux, timers, &mut self.flash, &mut self.prog, poll)
            }
            Opcode::GetCrc => {
                read_simple_eoc(&mut self.mux, timers, &mut poll)?;
                handle_get_crc(&mut self.flash, &mut self.prog, BD::FW_SIZE)
            }
            Opcode::GetOtp => handle_get_otp::<_, _, BD>(&mut self.mux, timers, poll),
            Opcode::GetSn => handle_get_sn::<_, _, BD>(&mut self.mux, timers, poll),
            Opcode::GetChip => {
                read_simple_eoc(&mut self.mux, timers, &mut poll)?;
                ok_u32(BD::CHIP_ID)
            }
            Opcode::SetDelay => handle_set_delay::<_, _, BD>(&mut self.mux, timers, poll),
            Opcode::GetChipDes => {
                read_simple_eoc(&mut self.mux, timers, &mut poll)?;
                handle_get_chip_des::<BD>()
            }
            Opcode::Boot => handle_boot(&mut self.mux, timers, &mut self.flash, &mut self.prog, poll),
            Opcode::Debug => {
                read_simple_eoc(&mut self.mux, timers, &mut poll)?;
                ok_empty()
            }
        }
    }
}

#[cfg(feature = "encryption")]
impl<A, B, F, BD, K> Dispatcher<A, B, F, BD, K>
where
    A: PhysicalChannel,
    B: PhysicalChannel,
    F: Flash,
    BD: Board,
    K: KeyStorage,
{
    pub fn new(first: A, second: B, flash: F, mut key_storage: K) -> Self {
        let key_state = keystate::validate_key(&mut key_storage);
        let cipher = match key_state {
            KeyState::Valid => Some(AesKey::new(&key_bytes(&mut key_storage))),
            KeyState::Invalid => None,
        };
        Self {
            mux: ChannelMux::new(first, second),
            flash,
            prog: FlashProgrammer::new::<BD>(),
            _board: PhantomData,
            enc: EncState {
                key_storage,
                key_state,
                cipher,
                iv: [0u8; 16],
                declared_length: 0,
                declared_crc: 0,
            },
        }
    }

    pub fn write_cursor(&self) -> u32 {
        self.prog.write_cursor()
    }

    pub fn run(&mut self, timers: &Timers, timeout_ms: u32, mut poll: impl FnMut()) -> ExitReason {
        let mut session_timeout_enabled = timeout_ms > 0;
        if session_timeout_enabled {
            timers.load(TimerId::SessionWait, timeout_ms);
        }

        loop {
            if session_timeout_enabled && timers.expired(TimerId::SessionWait) {
                log::debug!("session timeout expired with no successful command");
                return ExitReason::SessionTimeout;
            }

            let Ok(opcode_byte) = read_byte(&mut self.mux, timers, timeout_ms::IDLE_POLL, &mut poll) else {
                poll();
                continue;
            };

            let Some(opcode) = Opcode::from_byte(opcode_byte) else {
                continue;
            };

            log::trace!("dispatching opcode {:#04x}", opcode_byte);
            let result = self.dispatch(opcode, timers, &mut poll);
            let status = match &result {
                Ok(_) => Status::Ok,
                Err(fault) => Status::for_fault(*fault),
            };

            if status == Status::Ok {
                self.mux.pin_if_unset();
                session_timeout_enabled = false;
                timers.clear(TimerId::SessionWait);
            }

            let data = result.as_ref().map(ReplyData::as_slice).unwrap_or(&[]);
            emit(&mut self.mux, data, status);

            if status == Status::Ok && opcode == Opcode::Boot {
                crate::timer::delay(timers, 100, &mut poll);
                return ExitReason::Booted;
            }
        }
    }

    fn dispatch(&mut self, opcode: Opcode, timers: &Timers, mut poll: impl FnMut()) -> HandlerResult {
        match opcode {
            Opcode::GetSync => {
                read_simple_eoc(&mut self.mux, timers, &mut poll)?;
                ok_empty()
            }
            Opcode::GetDevice => handle_get_device::<_, _, BD, _>(&mut self.mux, timers, &mut self.flash, poll),
            Opcode::ChipErase => {
                handle_chip_erase::<_, _, BD, _>(&mut self.mux, timers, &mut self.flash, &mut self.prog, poll)
            }
            Opcode::ProgMulti => {
                let outcome = handle_prog_multi::<_, _, BD, _>(
                    &mut self.mux,
                    timers,
                    &mut self.flash,
                    &mut self.prog,
                    poll,
                )?;
                // Invariant 6: any successful unencrypted write zeroes the
                // key before the reply goes out.
                log::warn!("unencrypted PROG_MULTI succeeded: zeroing cipher key");
                keystate::zero_key(&mut self.enc.key_storage).map_err(|_| Fault::Flash)?;
                self.enc.key_state = KeyState::Invalid;
                self.enc.cipher = None;
                Ok(outcome)
            }
            Opcode::GetCrc => {
                read_simple_eoc(&mut self.mux, timers, &mut poll)?;
                handle_get_crc(&mut self.flash, &mut self.prog, BD::FW_SIZE)
            }
            Opcode::GetOtp => handle_get_otp::<_, _, BD>(&mut self.mux, timers, poll),
            Opcode::GetSn => handle_get_sn::<_, _, BD>(&mut self.mux, timers, poll),
            Opcode::GetChip => {
                read_simple_eoc(&mut self.mux, timers, &mut poll)?;
                ok_u32(BD::CHIP_ID)
            }
            Opcode::SetDelay => handle_set_delay::<_, _, BD>(&mut self.mux, timers, poll),
            Opcode::GetChipDes => {
                read_simple_eoc(&mut self.mux, timers, &mut poll)?;
                handle_get_chip_des::<BD>()
            }
            Opcode::Boot => handle_boot(&mut self.mux, timers, &mut self.flash, &mut self.prog, poll),
            Opcode::Debug => {
                read_simple_eoc(&mut self.mux, timers, &mut poll)?;
                ok_empty()
            }
            Opcode::SetIv => handle_set_iv(&mut self.mux, timers, &mut self.enc.iv, poll),
            Opcode::ProgMultiEncrypted => handle_prog_multi_encrypted::<_, _, BD, _, _>(
                &mut self.mux,
                timers,
                &mut self.flash,
                &mut self.prog,
                &mut self.enc,
                poll,
            ),
            Opcode::CheckCrc => {
                read_simple_eoc(&mut self.mux, timers, &mut poll)?;
                handle_check_crc::<_, BD>(
                    &mut self.flash,
                    &mut self.prog,
                    self.enc.declared_length,
                    self.enc.declared_crc,
                )
            }
            Opcode::CheckKey => {
                read_simple_eoc(&mut self.mux, timers, &mut poll)?;
                handle_check_key(self.enc.key_state)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::mock::{MockBoard, MockChannel, MockFlash};

    #[test]
    fn full_unencrypted_upload_matches_wire_contract() {
        let a = MockChannel::new(&[
            0x23, 0x20, // CHIP_ERASE
            0x27, 0x08, 0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22, 0x33, 0x44, 0x20, // PROG_MULTI, 2 words
            0x29, 0x20, // GET_CRC
            0x30, 0x20, // BOOT
        ]);
        let b = MockChannel::new(&[]);
        let timers = Timers::new();
        let mut d = Dispatcher::<_, _, _, MockBoard>::new(&a, &b, MockFlash::new());

        let exit = d.run(&timers, 0, || timers.tick());

        assert_eq!(exit, ExitReason::Booted);
        let sent = a.sent();
        assert_eq!(&sent[0..2], &[0x12, 0x10]); // erase ok
        assert_eq!(&sent[2..4], &[0x12, 0x10]); // prog_multi ok
        assert_eq!(&sent[8..10], &[0x12, 0x10]); // crc reply trailer (4 crc bytes precede it)
        assert_eq!(&sent[10..12], &[0x12, 0x10]); // boot ok
        assert_eq!(d.write_cursor(), 8);
    }

    #[test]
    fn bad_length_prog_multi_replies_invalid_then_resyncs() {
        let a = MockChannel::new(&[
            0x21, 0x20, // GET_SYNC: pins the channel
            0x27, 0x03, 0x01, 0x02, 0x03, 0x20, // PROG_MULTI with a bad (non-multiple-of-4) length
            0x30, 0x20, // BOOT: the unknown-opcode bytes above get silently skipped first
        ]);
        let b = MockChannel::new(&[]);
        let timers = Timers::new();
        let mut d = Dispatcher::<_, _, _, MockBoard>::new(&a, &b, MockFlash::new());

        let exit = d.run(&timers, 0, || timers.tick());

        assert_eq!(exit, ExitReason::Booted);
        assert_eq!(
            a.sent(),
            std::vec![0x12, 0x10, /* sync ok */ 0x12, 0x13, /* invalid */ 0x12, 0x10 /* boot ok */]
        );
    }

    #[test]
    fn missing_eoc_after_pin_is_invalid_not_silently_dropped() {
        let a = MockChannel::new(&[
            0x21, 0x20, // GET_SYNC: pins the channel
            0x21, 0x30, 0x20, // GET_SYNC again, but the next byte isn't EOC
            0x30, 0x20, // BOOT, to end the run deterministically
        ]);
        let b = MockChannel::new(&[]);
        let timers = Timers::new();
        let mut d = Dispatcher::<_, _, _, MockBoard>::new(&a, &b, MockFlash::new());

        let exit = d.run(&timers, 0, || timers.tick());

        assert_eq!(exit, ExitReason::Booted);
        assert_eq!(
            a.sent(),
            std::vec![0x12, 0x10, /* sync ok */ 0x12, 0x13, /* invalid: bad eoc */ 0x12, 0x10 /* boot ok */]
        );
    }

    #[test]
    fn no_command_ever_arrives_times_out_the_session() {
        let a = MockChannel::new(&[]);
        let b = MockChannel::new(&[]);
        let timers = Timers::new();
        let mut d = Dispatcher::<_, _, _, MockBoard>::new(&a, &b, MockFlash::new());

        let exit = d.run(&timers, 5, || timers.tick());

        assert_eq!(exit, ExitReason::SessionTimeout);
        assert!(a.sent().is_empty());
    }
}
