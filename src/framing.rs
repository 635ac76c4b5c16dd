//! Framing primitives (component C): read a byte, a little-endian word, or
//! assert the end-of-command sentinel, each under a caller-supplied
//! millisecond timeout (spec §4.C).
//!
//! Every per-byte timeout in the wire contract (spec §4.C's table) is a
//! constant here, named after the context it gates, so the dispatcher
//! never hand-writes a magic number.

use crate::board::PhysicalChannel;
use crate::channel::ChannelMux;
use crate::fault::Fault;
use crate::timer::{TimerId, Timers};

/// `EOC`: end-of-command sentinel terminating every host to device frame.
pub const EOC: u8 = 0x20;

pub mod timeout_ms {
    pub const IDLE_POLL: u32 = 0;
    pub const GET_DEVICE_ARG: u32 = 1000;
    pub const EOC_AFTER_SIMPLE: u32 = 2;
    pub const EOC_AFTER_PROG_MULTI: u32 = 200;
    pub const EOC_AFTER_BOOT: u32 = 1000;
    pub const PROG_MULTI_LEN: u32 = 50;
    pub const PROG_MULTI_BYTE: u32 = 1000;
    pub const SET_DELAY_ARG: u32 = 100;
    pub const OTP_OR_SN_ADDR: u32 = 100;
}

/// Read one byte, polling `mux` until it yields one or `timers[COMMAND_READ]`
/// reaches zero. `poll` is invoked once per empty iteration; on hardware
/// it's a no-op spin (the tick ISR runs independently), in tests it
/// advances the fake clock.
pub fn read_byte<A, B>(
    mux: &mut ChannelMux<A, B>,
    timers: &Timers,
    timeout_ms: u32,
    mut poll: impl FnMut(),
) -> Result<u8, Fault>
where
    A: PhysicalChannel,
    B: PhysicalChannel,
{
    timers.load(TimerId::CommandRead, timeout_ms);
    loop {
        if let Some(b) = mux.try_read_byte() {
            timers.pulse_activity();
            return Ok(b);
        }
        if timers.expired(TimerId::CommandRead) {
            return Err(Fault::Framing);
        }
        poll();
    }
}

/// Four `read_byte` calls, little-endian assembly. Each byte independently
/// gets the *full* `timeout_ms` budget — this is lenient by design and is
/// preserved verbatim from the source bootloader (spec §9, Open Question).
pub fn read_word_le<A, B>(
    mux: &mut ChannelMux<A, B>,
    timers: &Timers,
    timeout_ms: u32,
    mut poll: impl FnMut(),
) -> Result<u32, Fault>
where
    A: PhysicalChannel,
    B: PhysicalChannel,
{
    let mut word = 0u32;
    for i in 0..4 {
        let byte = read_byte(mux, timers, timeout_ms, &mut poll)?;
        word |= (byte as u32) << (i * 8);
    }
    Ok(word)
}

/// Read one byte under `timeout_ms` and assert it is [`EOC`].
pub fn expect_eoc<A, B>(
    mux: &mut ChannelMux<A, B>,
    timers: &Timers,
    timeout_ms: u32,
    poll: impl FnMut(),
) -> Result<(), Fault>
where
    A: PhysicalChannel,
    B: PhysicalChannel,
{
    match read_byte(mux, timers, timeout_ms, poll)? {
        EOC => Ok(()),
        _ => Err(Fault::Framing),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::mock::MockChannel;

    fn mux_of<'a>(a: &'a MockChannel, b: &'a MockChannel) -> ChannelMux<&'a MockChannel, &'a MockChannel> {
        ChannelMux::new(a, b)
    }

    #[test]
    fn read_byte_returns_immediately_available_byte() {
        let a = MockChannel::new(&[0x99]);
        let b = MockChannel::new(&[]);
        let mut mux = mux_of(&a, &b);
        let timers = Timers::new();

        let byte = read_byte(&mut mux, &timers, 10, || {}).unwrap();
        assert_eq!(byte, 0x99);
    }

    #[test]
    fn read_byte_pulses_the_activity_led() {
        let a = MockChannel::new(&[0x99]);
        let b = MockChannel::new(&[]);
        let mut mux = mux_of(&a, &b);
        let timers = Timers::new();
        timers.set_led_mode(crate::timer::LedMode::Blink);

        read_byte(&mut mux, &timers, 10, || {}).unwrap();
        assert!(timers.led_is_on());
    }

    #[test]
    fn read_byte_times_out_with_no_data() {
        let a = MockChannel::new(&[]);
        let b = MockChannel::new(&[]);
        let mut mux = mux_of(&a, &b);
        let timers = Timers::new();

        let err = read_byte(&mut mux, &timers, 3, || timers.tick()).unwrap_err();
        assert_eq!(err, Fault::Framing);
    }

    #[test]
    fn read_word_le_assembles_little_endian() {
        let a = MockChannel::new(&[0x78, 0x56, 0x34, 0x12]);
        let b = MockChannel::new(&[]);
        let mut mux = mux_of(&a, &b);
        let timers = Timers::new();

        let word = read_word_le(&mut mux, &timers, 100, || {}).unwrap();
        assert_eq!(word, 0x1234_5678);
    }

    #[test]
    fn expect_eoc_accepts_only_the_sentinel() {
        let a = MockChannel::new(&[0x20]);
        let b = MockChannel::new(&[]);
        let mut mux = mux_of(&a, &b);
        let timers = Timers::new();
        assert!(expect_eoc(&mut mux, &timers, 2, || {}).is_ok());

        let a2 = MockChannel::new(&[0xFF]);
        let b2 = MockChannel::new(&[]);
        let mut mux2 = mux_of(&a2, &b2);
        let timers2 = Timers::new();
        assert_eq!(
            expect_eoc(&mut mux2, &timers2, 2, || {}).unwrap_err(),
            Fault::Framing
        );
    }
}
