//! Response emitter (component D): the five canonical two-byte replies and
//! raw data replies, all prefixed by `INSYNC` (spec §4.D, §6).

use crate::board::PhysicalChannel;
use crate::channel::ChannelMux;
use crate::fault::Fault;

pub const INSYNC: u8 = 0x12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0x10,
    Failed = 0x11,
    Invalid = 0x13,
    BadSilicon = 0x14,
    BadKey = 0x15,
}

impl Status {
    /// The wire-level reply dictated by spec §7's error-classification
    /// table for a given [`Fault`].
    pub fn for_fault(fault: Fault) -> Status {
        match fault {
            Fault::Framing | Fault::Argument => Status::Invalid,
            Fault::Flash | Fault::Integrity => Status::Failed,
            Fault::Silicon => Status::BadSilicon,
            Fault::Key => Status::BadKey,
        }
    }
}

/// Emit data bytes followed by the `INSYNC`/status trailer. Data-bearing
/// commands always emit their payload before the status (spec §4.D).
pub fn emit<A, B>(mux: &mut ChannelMux<A, B>, data: &[u8], status: Status)
where
    A: PhysicalChannel,
    B: PhysicalChannel,
{
    if !data.is_empty() {
        mux.write_bytes(data);
    }
    mux.write_bytes(&[INSYNC, status as u8]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::mock::MockChannel;

    #[test]
    fn plain_status_is_two_bytes() {
        let a = MockChannel::new(&[]);
        let b = MockChannel::new(&[]);
        let mut mux = ChannelMux::new(&a, &b);
        // pin so writes aren't swallowed
        let _ = mux.try_read_byte();
        a.feed(&[0]);
        mux.try_read_byte();
        mux.pin_if_unset();

        emit(&mut mux, &[], Status::Ok);
        assert_eq!(a.sent(), std::vec![INSYNC, Status::Ok as u8]);
    }

    #[test]
    fn data_bearing_reply_puts_payload_before_status() {
        let a = MockChannel::new(&[0]);
        let b = MockChannel::new(&[]);
        let mut mux = ChannelMux::new(&a, &b);
        mux.try_read_byte();
        mux.pin_if_unset();

        emit(&mut mux, &[0x07, 0x00, 0x00, 0x00], Status::Ok);
        assert_eq!(
            a.sent(),
            std::vec![0x07, 0x00, 0x00, 0x00, INSYNC, Status::Ok as u8]
        );
    }

    #[test]
    fn fault_mapping_matches_wire_contract() {
        assert_eq!(Status::for_fault(Fault::Framing), Status::Invalid);
        assert_eq!(Status::for_fault(Fault::Argument), Status::Invalid);
        assert_eq!(Status::for_fault(Fault::Flash), Status::Failed);
        assert_eq!(Status::for_fault(Fault::Integrity), Status::Failed);
        assert_eq!(Status::for_fault(Fault::Silicon), Status::BadSilicon);
        assert_eq!(Status::for_fault(Fault::Key), Status::BadKey);
    }
}
