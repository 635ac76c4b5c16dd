//! Decryption adapter (component H, `encryption` feature): CBC-chained
//! 128-bit block decryption of received 16-byte groups, with per-block IV
//! update and header extraction on the first payload (spec §4.H).
//!
//! The source bootloader manually re-copies the IV after every 16-byte
//! block because the block-cipher routine it calls doesn't chain
//! internally (spec §9). [`Block128`] is called exactly the same way here,
//! one block at a time, so swapping the concrete cipher never has to
//! touch this chaining logic.

use crate::fault::Fault;

/// A 128-bit block cipher capable of decrypting one block in place.
/// Implemented for `aes::Aes128` below; kept as a trait so the chaining
/// logic in [`decrypt_cbc`] doesn't depend on which RustCrypto cipher
/// backs it.
pub trait Block128 {
    fn decrypt_block(&self, block: &mut [u8; 16]);
}

pub struct AesKey(aes::Aes128);

impl AesKey {
    pub fn new(key: &[u8; 16]) -> Self {
        use aes::cipher::KeyInit;
        Self(aes::Aes128::new_from_slice(key).expect("16-byte key"))
    }
}

impl Block128 for AesKey {
    fn decrypt_block(&self, block: &mut [u8; 16]) {
        use aes::cipher::BlockDecrypt;
        let generic = aes::cipher::generic_array::GenericArray::from_mut_slice(block);
        self.0.decrypt_block(generic);
    }
}

/// Maximum `PROG_MULTI_ENCRYPTED` payload length, exclusive (spec §9, Open
/// Question: the source enforces `<`, not `<=`, excluding a valid
/// 240-byte max-aligned payload's upper boundary; preserved verbatim).
pub const MAX_ENCRYPTED_LEN: usize = 255;

/// Decrypt `ciphertext` in place under CBC using `cipher` and `iv`,
/// updating `iv` to chain into the next call. `ciphertext.len()` must be a
/// multiple of 16 and strictly less than [`MAX_ENCRYPTED_LEN`]; violating
/// either fails with `Fault::Argument` without touching `iv` or the data
/// (spec §4.H).
pub fn decrypt_cbc<C: Block128>(cipher: &C, iv: &mut [u8; 16], ciphertext: &mut [u8]) -> Result<(), Fault> {
    if ciphertext.len() >= MAX_ENCRYPTED_LEN || ciphertext.len() % 16 != 0 {
        return Err(Fault::Argument);
    }

    for block in ciphertext.chunks_exact_mut(16) {
        let block: &mut [u8; 16] = block.try_into().expect("chunks_exact_mut(16)");
        let chained_ciphertext = *block;

        cipher.decrypt_block(block);
        for i in 0..16 {
            block[i] ^= iv[i];
        }

        *iv = chained_ciphertext;
    }

    Ok(())
}

/// The first four plaintext words of the first encrypted payload (spec
/// §3, §4.H).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptedHeader {
    pub declared_length: u32,
    pub declared_crc: u32,
}

/// Parse the 16-byte header prefix of the first decrypted payload. Caller
/// guarantees `plaintext.len() >= 16`.
pub fn parse_header(plaintext: &[u8]) -> EncryptedHeader {
    EncryptedHeader {
        declared_length: u32::from_le_bytes(plaintext[0..4].try_into().unwrap()),
        declared_crc: u32::from_le_bytes(plaintext[4..8].try_into().unwrap()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct XorCipher(u8);
    impl Block128 for XorCipher {
        fn decrypt_block(&self, block: &mut [u8; 16]) {
            for b in block.iter_mut() {
                *b ^= self.0;
            }
        }
    }

    #[test]
    fn rejects_non_multiple_of_16() {
        let cipher = XorCipher(0);
        let mut iv = [0u8; 16];
        let mut data = [0u8; 17];
        assert_eq!(
            decrypt_cbc(&cipher, &mut iv, &mut data[..17]).unwrap_err(),
            Fault::Argument
        );
    }

    #[test]
    fn rejects_length_at_or_above_max() {
        let cipher = XorCipher(0);
        let mut iv = [0u8; 16];
        let mut data = vec![0u8; MAX_ENCRYPTED_LEN + 1];
        // round down to a multiple of 16 at/above the boundary
        let len = ((MAX_ENCRYPTED_LEN / 16) + 1) * 16;
        data.resize(len, 0);
        assert_eq!(decrypt_cbc(&cipher, &mut iv, &mut data).unwrap_err(), Fault::Argument);
    }

    #[test]
    fn chains_iv_across_blocks() {
        let cipher = XorCipher(0xAA);
        let mut iv = [0x11u8; 16];
        let mut data = [0x22u8; 32];
        let original = data;

        decrypt_cbc(&cipher, &mut iv, &mut data).unwrap();

        // Block 0: decrypt(0x22) ^ iv(0x11) = (0x22^0xAA) ^ 0x11
        let expect0 = (0x22u8 ^ 0xAA) ^ 0x11;
        assert!(data[0..16].iter().all(|&b| b == expect0));

        // Block 1 chains on block 0's *ciphertext*, not its plaintext.
        let expect1 = (0x22u8 ^ 0xAA) ^ original[0];
        assert!(data[16..32].iter().all(|&b| b == expect1));
    }

    #[test]
    fn header_round_trip() {
        let mut plaintext = [0u8; 16];
        plaintext[0..4].copy_from_slice(&123u32.to_le_bytes());
        plaintext[4..8].copy_from_slice(&0xDEAD_BEEFu32.to_le_bytes());

        let header = parse_header(&plaintext);
        assert_eq!(header.declared_length, 123);
        assert_eq!(header.declared_crc, 0xDEAD_BEEF);
    }
}
