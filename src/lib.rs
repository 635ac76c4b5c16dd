#![cfg_attr(not(test), no_std)]

//! A serial firmware-update bootloader protocol engine: a command
//! dispatcher that speaks a two-channel, INSYNC-framed wire protocol to
//! erase, program, checksum, and boot an application image held in MCU
//! flash.
//!
//! Every module here is a contract the integrating board crate fulfils:
//! [`board::PhysicalChannel`] for byte I/O, [`board::Flash`] for the flash
//! controller, [`board::Board`] for identification data, and, under the
//! `encryption` feature, [`keystate::KeyStorage`] for the embedded cipher
//! key. Nothing in this crate names a concrete MCU or transport.
//!
//! [`dispatcher::Dispatcher`] is the entry point: construct one from the
//! board's channels and flash HAL, then call
//! [`dispatcher::Dispatcher::run`] from the reset handler, before jumping
//! to the application.

pub mod board;
pub mod channel;
pub mod crc32;
pub mod dispatcher;
pub mod fault;
pub mod flash;
pub mod framing;
pub mod response;
pub mod timer;

#[cfg(feature = "encryption")]
pub mod decrypt;
#[cfg(feature = "encryption")]
pub mod keystate;

pub use dispatcher::{Dispatcher, ExitReason, Opcode};
pub use fault::{Fault, FwResult};
