//! AES-128-CBC block engine for the encapsulation unlock handshake.
//!
//! The controller's unlock exchange needs precise control over CBC chaining:
//! single-block operations either finalize (returning the chain to the
//! original IV) or keep chaining for streaming use. Buffer operations
//! encrypt block-by-block with a finalize after each block, so every block
//! is chained against the IV rather than the previous ciphertext. The
//! controller firmware expects exactly this, so the buffer helpers must not
//! be "fixed" into conventional CBC.

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use tracing::warn;

use crate::error::{LinkError, Result};

/// AES block and key size in bytes.
pub const BLOCK_SIZE: usize = 16;

/// AES-128-CBC engine with explicit chaining control.
pub struct BlockCrypto {
    cipher: Aes128,
    iv: [u8; BLOCK_SIZE],
    enc_chain: [u8; BLOCK_SIZE],
    dec_chain: [u8; BLOCK_SIZE],
}

impl std::fmt::Debug for BlockCrypto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockCrypto").finish_non_exhaustive()
    }
}

impl BlockCrypto {
    /// Construct from a 128-bit key and 128-bit IV.
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self> {
        if key.len() != BLOCK_SIZE {
            return Err(LinkError::CipherError(format!(
                "key size must be {} bytes, got {}",
                BLOCK_SIZE,
                key.len()
            )));
        }
        if iv.len() != BLOCK_SIZE {
            return Err(LinkError::CipherError(format!(
                "iv size must be {} bytes, got {}",
                BLOCK_SIZE,
                iv.len()
            )));
        }
        let cipher = Aes128::new_from_slice(key)
            .map_err(|e| LinkError::CipherError(format!("cipher construction failed: {e}")))?;
        let mut iv_arr = [0u8; BLOCK_SIZE];
        iv_arr.copy_from_slice(iv);
        Ok(Self {
            cipher,
            iv: iv_arr,
            enc_chain: iv_arr,
            dec_chain: iv_arr,
        })
    }

    /// Reset both chains back to the original IV.
    pub fn restart(&mut self) {
        self.enc_chain = self.iv;
        self.dec_chain = self.iv;
    }

    /// Encrypt one block. With `finalize`, the encrypt chain is reset to
    /// the IV afterwards; otherwise the next call chains on this block's
    /// ciphertext.
    pub fn encrypt_block(&mut self, block: &[u8], finalize: bool) -> Result<[u8; BLOCK_SIZE]> {
        if block.len() != BLOCK_SIZE {
            return Err(LinkError::CipherError(format!(
                "encrypt block size mismatch: {}",
                block.len()
            )));
        }
        let mut buf = [0u8; BLOCK_SIZE];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = block[i] ^ self.enc_chain[i];
        }
        let mut ga = GenericArray::from(buf);
        self.cipher.encrypt_block(&mut ga);
        let ciphertext: [u8; BLOCK_SIZE] = ga.into();
        self.enc_chain = if finalize { self.iv } else { ciphertext };
        Ok(ciphertext)
    }

    /// Decrypt one block, with the same chaining rules as
    /// [`Self::encrypt_block`].
    pub fn decrypt_block(&mut self, block: &[u8], finalize: bool) -> Result<[u8; BLOCK_SIZE]> {
        if block.len() != BLOCK_SIZE {
            return Err(LinkError::CipherError(format!(
                "decrypt block size mismatch: {}",
                block.len()
            )));
        }
        let mut ga = GenericArray::clone_from_slice(block);
        self.cipher.decrypt_block(&mut ga);
        let mut plaintext: [u8; BLOCK_SIZE] = ga.into();
        for (i, b) in plaintext.iter_mut().enumerate() {
            *b ^= self.dec_chain[i];
        }
        if finalize {
            self.dec_chain = self.iv;
        } else {
            self.dec_chain.copy_from_slice(block);
        }
        Ok(plaintext)
    }

    /// Encrypt a buffer block-by-block, each block finalized against the IV.
    ///
    /// A trailing partial block is zero-padded to a full block when
    /// `pad_zero` is set, so the output can be larger than the input.
    /// Without `pad_zero` the trailing bytes are appended unencrypted and
    /// the output is not a clean multiple of the block size.
    pub fn encrypt_buffer(&mut self, data: &[u8], pad_zero: bool) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(LinkError::CipherError(
                "encrypt buffer is empty".to_string(),
            ));
        }
        if data.len() % BLOCK_SIZE != 0 {
            warn!("[Crypto] Encrypt buffer is not a multiple of the block size");
        }
        let mut out = Vec::with_capacity(data.len() + BLOCK_SIZE);
        for chunk in data.chunks(BLOCK_SIZE) {
            if chunk.len() == BLOCK_SIZE {
                out.extend_from_slice(&self.encrypt_block(chunk, true)?);
            } else if pad_zero {
                let mut padded = [0u8; BLOCK_SIZE];
                padded[..chunk.len()].copy_from_slice(chunk);
                out.extend_from_slice(&self.encrypt_block(&padded, true)?);
            } else {
                out.extend_from_slice(chunk);
            }
        }
        Ok(out)
    }

    /// Decrypt a buffer block-by-block, mirroring
    /// [`Self::encrypt_buffer`].
    pub fn decrypt_buffer(&mut self, data: &[u8], pad_zero: bool) -> Result<Vec<u8>> {
        if data.len() < BLOCK_SIZE {
            return Err(LinkError::CipherError(
                "decrypt buffer smaller than one block".to_string(),
            ));
        }
        if data.len() % BLOCK_SIZE != 0 {
            warn!("[Crypto] Decrypt buffer is not a multiple of the block size");
        }
        let mut out = Vec::with_capacity(data.len());
        for chunk in data.chunks(BLOCK_SIZE) {
            if chunk.len() == BLOCK_SIZE {
                out.extend_from_slice(&self.decrypt_block(chunk, true)?);
            } else if pad_zero {
                let mut padded = [0u8; BLOCK_SIZE];
                padded[..chunk.len()].copy_from_slice(chunk);
                out.extend_from_slice(&self.decrypt_block(&padded, true)?);
            } else {
                out.extend_from_slice(chunk);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // SP 800-38A CBC-AES128 vectors
    const KEY: &str = "2b7e151628aed2a6abf7158809cf4f3c";
    const IV: &str = "000102030405060708090a0b0c0d0e0f";
    const PT1: &str = "6bc1bee22e409f96e93d7e117393172a";
    const CT1: &str = "7649abac8119b246cee98e9b12e9197d";
    const PT2: &str = "ae2d8a571e03ac9c9eb76fac45af8e51";
    const CT2: &str = "5086cb9b507219ee95db113a917678b2";

    fn engine() -> BlockCrypto {
        BlockCrypto::new(&hex::decode(KEY).unwrap(), &hex::decode(IV).unwrap()).unwrap()
    }

    #[test]
    fn test_invalid_key_or_iv_size() {
        assert!(BlockCrypto::new(&[0u8; 8], &[0u8; 16]).is_err());
        assert!(BlockCrypto::new(&[0u8; 16], &[0u8; 8]).is_err());
    }

    #[test]
    fn test_single_block_known_vector() {
        let mut crypto = engine();
        let ct = crypto
            .encrypt_block(&hex::decode(PT1).unwrap(), true)
            .unwrap();
        assert_eq!(hex::encode(ct), CT1);
    }

    #[test]
    fn test_finalize_resets_chain() {
        let mut crypto = engine();
        let pt = hex::decode(PT1).unwrap();
        let first = crypto.encrypt_block(&pt, true).unwrap();
        let second = crypto.encrypt_block(&pt, true).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_streaming_chains_across_blocks() {
        let mut crypto = engine();
        let ct1 = crypto
            .encrypt_block(&hex::decode(PT1).unwrap(), false)
            .unwrap();
        let ct2 = crypto
            .encrypt_block(&hex::decode(PT2).unwrap(), false)
            .unwrap();
        assert_eq!(hex::encode(ct1), CT1);
        assert_eq!(hex::encode(ct2), CT2);
    }

    #[test]
    fn test_decrypt_round_trip() {
        let mut crypto = engine();
        let pt = hex::decode(PT1).unwrap();
        let ct = crypto.encrypt_block(&pt, true).unwrap();
        let back = crypto.decrypt_block(&ct, true).unwrap();
        assert_eq!(back.to_vec(), pt);
    }

    #[test]
    fn test_buffer_blocks_are_independent() {
        // Buffer encryption finalizes per block, so each block matches a
        // standalone single-block encryption.
        let mut crypto = engine();
        let pt1 = hex::decode(PT1).unwrap();
        let pt2 = hex::decode(PT2).unwrap();
        let mut buffer = pt1.clone();
        buffer.extend_from_slice(&pt2);
        let out = crypto.encrypt_buffer(&buffer, true).unwrap();

        let block1 = crypto.encrypt_block(&pt1, true).unwrap();
        let block2 = crypto.encrypt_block(&pt2, true).unwrap();
        assert_eq!(&out[..16], &block1);
        assert_eq!(&out[16..], &block2);
    }

    #[test]
    fn test_buffer_zero_padding() {
        let mut crypto = engine();
        let short = [0x9du8, 0x03, 0x00, 0x07, 0x00, 0x01, 0x34, 0xa9];
        let out = crypto.encrypt_buffer(&short, true).unwrap();
        assert_eq!(out.len(), BLOCK_SIZE);

        let mut padded = [0u8; BLOCK_SIZE];
        padded[..short.len()].copy_from_slice(&short);
        let expected = crypto.encrypt_block(&padded, true).unwrap();
        assert_eq!(out, expected.to_vec());
    }

    #[test]
    fn test_buffer_without_padding_passes_tail_through() {
        let mut crypto = engine();
        let mut data = hex::decode(PT1).unwrap();
        data.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let out = crypto.encrypt_buffer(&data, false).unwrap();
        assert_eq!(out.len(), 20);
        assert_eq!(&out[16..], &[0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(hex::encode(&out[..16]), CT1);
    }

    #[test]
    fn test_buffer_errors() {
        let mut crypto = engine();
        assert!(crypto.encrypt_buffer(&[], true).is_err());
        assert!(crypto.decrypt_buffer(&[0u8; 4], true).is_err());
    }

    #[test]
    fn test_buffer_round_trip() {
        let mut crypto = engine();
        let mut data = hex::decode(PT1).unwrap();
        data.extend_from_slice(&hex::decode(PT2).unwrap());
        let ct = crypto.encrypt_buffer(&data, true).unwrap();
        let pt = crypto.decrypt_buffer(&ct, true).unwrap();
        assert_eq!(pt, data);
    }
}
