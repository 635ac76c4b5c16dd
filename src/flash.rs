//! Flash-programming pipeline (component G): erase-verify, append-with-
//! read-back, and the deferred-first-word commit protocol (spec §4.G).
//!
//! The deferred first word is a safety invariant, not an optimization: it
//! lets the bootloader tell "application fully written" apart from
//! "application partially written" across a power loss (spec §9). Word 0
//! of the region is only ever written from [`FlashProgrammer::finalize`],
//! called exclusively by the `BOOT` handler.

use crate::board::{Board, Flash};
use crate::crc32::Crc32;
use crate::fault::Fault;

/// Sentinel for "no deferred word pending" / "no app present" (spec §3, §6).
pub const ERASED_WORD: u32 = 0xFFFF_FFFF;

pub struct FlashProgrammer {
    /// Byte offset of the next word to be written. Append-only: a write
    /// may only land at `write_cursor`, and `write_cursor` only advances.
    write_cursor: u32,
    /// The deferred value for offset 0, or `ERASED_WORD` if none pending.
    first_word: u32,
    crc: Crc32,
}

impl FlashProgrammer {
    pub const fn new<B: Board>() -> Self {
        Self {
            write_cursor: B::FW_SIZE,
            first_word: ERASED_WORD,
            crc: Crc32::new(),
        }
    }

    pub fn write_cursor(&self) -> u32 {
        self.write_cursor
    }

    pub fn has_deferred_word(&self) -> bool {
        self.first_word != ERASED_WORD
    }

    /// Erase every sector in `F::SECTORS`, then verify the whole region
    /// reads back as `ERASED_WORD`. On success, resets the append cursor
    /// and clears any deferred word (spec invariant 3).
    ///
    /// `on_verify_start` fires once, after the last sector erase and before
    /// the read-back loop begins — the dispatcher's hook for the LED
    /// policy's "OFF during erase-verify" state (spec §4.I), distinct from
    /// the solid-ON state held for the erase itself.
    pub fn erase_all<F: Flash, B: Board>(
        &mut self,
        flash: &mut F,
        mut on_verify_start: impl FnMut(),
    ) -> Result<(), Fault> {
        log::debug!("erase_all: erasing {} sector(s)", F::SECTORS.len());
        for sector in F::SECTORS {
            if sector.is_terminator() {
                break;
            }
            flash
                .erase_sector(sector.base)
                .map_err(|_| Fault::Flash)?;
        }

        on_verify_start();

        let words = B::FW_SIZE / 4;
        for i in 0..words {
            let offset = i * 4;
            let word = flash.read_word(offset).map_err(|_| Fault::Flash)?;
            if word != ERASED_WORD {
                log::warn!("erase_all: verify failed at offset {offset}");
                return Err(Fault::Flash);
            }
        }

        self.write_cursor = 0;
        self.first_word = ERASED_WORD;
        Ok(())
    }

    /// Append `words` at the current cursor, read-back verifying each one.
    /// If the cursor is at offset 0, `words[0]` is deferred into RAM
    /// (spec invariant 2) instead of being written immediately.
    pub fn append<F: Flash, B: Board>(
        &mut self,
        flash: &mut F,
        words: &[u32],
    ) -> Result<(), Fault> {
        let span = words.len() as u32 * 4;
        if self.write_cursor.checked_add(span).is_none_or(|end| end > B::FW_SIZE) {
            return Err(Fault::Argument);
        }

        for (i, &word) in words.iter().enumerate() {
            let offset = self.write_cursor + (i as u32) * 4;
            let to_write = if offset == 0 {
                self.first_word = word;
                ERASED_WORD
            } else {
                word
            };

            flash.write_word(offset, to_write).map_err(|_| Fault::Flash)?;
            let read_back = flash.read_word(offset).map_err(|_| Fault::Flash)?;
            if read_back != to_write {
                log::warn!("append: read-back mismatch at offset {offset}");
                return Err(Fault::Flash);
            }
        }

        self.write_cursor += span;
        Ok(())
    }

    /// Commit the deferred first word, if any. Only the `BOOT` handler
    /// calls this (spec invariant 2).
    pub fn finalize<F: Flash>(&mut self, flash: &mut F) -> Result<(), Fault> {
        if self.first_word == ERASED_WORD {
            return Ok(());
        }

        flash.write_word(0, self.first_word).map_err(|_| Fault::Flash)?;
        let read_back = flash.read_word(0).map_err(|_| Fault::Flash)?;
        if read_back != self.first_word {
            log::warn!("finalize: read-back mismatch at offset 0");
            return Err(Fault::Flash);
        }

        self.first_word = ERASED_WORD;
        Ok(())
    }

    /// CRC32 over flash bytes `[0, length)`, substituting the deferred
    /// first word for offset 0 when one is pending (spec §4.G).
    pub fn checksum<F: Flash>(&mut self, flash: &mut F, length: u32) -> Result<u32, Fault> {
        let mut crc = 0u32;
        let mut offset = 0u32;
        while offset < length {
            let word = if offset == 0 && self.first_word != ERASED_WORD {
                self.first_word
            } else {
                flash.read_word(offset).map_err(|_| Fault::Flash)?
            };
            let bytes = word.to_le_bytes();
            let take = (length - offset).min(4) as usize;
            crc = self.crc.checksum(&bytes[..take], crc);
            offset += 4;
        }
        Ok(crc)
    }
}
