//! The crate-wide fault taxonomy (spec §7) and its mapping to wire-level
//! replies.
//!
//! Every fallible operation below the dispatcher returns `Result<T, Fault>`
//! rather than a panic or a board-specific error type. This mirrors the
//! teacher crate's opaque reason-enum idiom, widened to the classification
//! spec.md's error-handling table requires. No `Display`/`core::error::Error`
//! impl is provided: nothing in this crate formats an error for a human,
//! and adding one would pull in formatting machinery this `no_std`,
//! size-budgeted crate has no other use for.

/// What a failed command should answer on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Timeout, missing EOC, bad length → `INVALID`.
    Framing,
    /// Out-of-range address, non-multiple-of-4 length, unknown sub-arg →
    /// `INVALID`.
    Argument,
    /// Read-back mismatch, erase-verify failure → `FAILED`.
    Flash,
    /// `CHECK_CRC` mismatch, missing boot-delay signature,
    /// `declared_length > fw_size` → `FAILED`.
    Integrity,
    /// Errata-affected silicon revision → `BAD_SILICON`.
    Silicon,
    /// Encrypted write attempted, or `CHECK_KEY` queried, with a zeroed key
    /// → `BAD_KEY`.
    Key,
}

pub type FwResult<T> = Result<T, Fault>;
