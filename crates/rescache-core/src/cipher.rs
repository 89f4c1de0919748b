//! At-rest cipher used by the cache store
//!
//! The store only depends on the [`Cipher`] trait; [`AesCipher`] is the
//! implementation installed when an encryption key is configured.

use crate::error::CacheError;
use aes::Aes128;
use cbc::cipher::{
    block_padding::Pkcs7, generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut, KeyIvInit,
};
use sha2::{Digest, Sha256};
use std::io::{Read, Write};

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// AES block size in bytes.
const AES_BLOCK_SIZE: usize = 16;

/// Bytes read per step when sealing a stream; a multiple of the block size.
const SEAL_CHUNK: usize = 64 * 1024;

/// Symmetric transform applied to artifact bytes before they hit the disk
pub trait Cipher: Send + Sync {
    fn encrypt(&self, key: &str, data: &[u8]) -> Result<Vec<u8>, CacheError>;
    fn decrypt(&self, key: &str, data: &[u8]) -> Result<Vec<u8>, CacheError>;

    /// Encrypt everything `reader` yields into `writer`
    ///
    /// The output must be readable by [`decrypt`](Self::decrypt). The default
    /// buffers the whole input; implementations that can work in chunks
    /// should override it.
    fn encrypt_stream(
        &self,
        key: &str,
        reader: &mut dyn Read,
        writer: &mut dyn Write,
    ) -> Result<(), CacheError> {
        let mut plain = Vec::new();
        reader.read_to_end(&mut plain)?;
        writer.write_all(&self.encrypt(key, &plain)?)?;
        Ok(())
    }
}

/// AES-128-CBC with PKCS7 padding.
///
/// The 16-byte key is the truncated SHA-256 of the configured key string. A
/// fresh IV is generated per artifact and stored in front of the ciphertext.
#[derive(Debug, Default, Clone, Copy)]
pub struct AesCipher;

impl AesCipher {
    fn derive_key(key: &str) -> [u8; AES_BLOCK_SIZE] {
        let digest = Sha256::digest(key.as_bytes());
        let mut out = [0u8; AES_BLOCK_SIZE];
        out.copy_from_slice(&digest[..AES_BLOCK_SIZE]);
        out
    }
}

impl Cipher for AesCipher {
    fn encrypt(&self, key: &str, data: &[u8]) -> Result<Vec<u8>, CacheError> {
        let key = Self::derive_key(key);
        let iv = uuid::Uuid::new_v4().into_bytes();

        let ciphertext =
            Aes128CbcEnc::new(&key.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(data);

        let mut out = Vec::with_capacity(AES_BLOCK_SIZE + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, key: &str, data: &[u8]) -> Result<Vec<u8>, CacheError> {
        if data.len() < AES_BLOCK_SIZE * 2 || data.len() % AES_BLOCK_SIZE != 0 {
            return Err(CacheError::Cipher(format!(
                "ciphertext length {} is not a valid AES-CBC payload",
                data.len()
            )));
        }

        let key = Self::derive_key(key);
        let (iv, ciphertext) = data.split_at(AES_BLOCK_SIZE);
        let mut iv_block = [0u8; AES_BLOCK_SIZE];
        iv_block.copy_from_slice(iv);

        Aes128CbcDec::new(&key.into(), &iv_block.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|e| CacheError::Cipher(format!("PKCS7 unpad failed: {e}")))
    }

    fn encrypt_stream(
        &self,
        key: &str,
        reader: &mut dyn Read,
        writer: &mut dyn Write,
    ) -> Result<(), CacheError> {
        let key = Self::derive_key(key);
        let iv = uuid::Uuid::new_v4().into_bytes();
        let mut enc = Aes128CbcEnc::new(&key.into(), &iv.into());
        writer.write_all(&iv)?;

        // `buf[..filled]` holds input not yet encrypted; only the trailing
        // partial block survives a step.
        let mut buf = vec![0u8; SEAL_CHUNK + AES_BLOCK_SIZE];
        let mut filled = 0;
        loop {
            let n = reader.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;

            let whole = filled - filled % AES_BLOCK_SIZE;
            if whole < SEAL_CHUNK {
                continue;
            }
            for block in buf[..whole].chunks_exact_mut(AES_BLOCK_SIZE) {
                enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
            }
            writer.write_all(&buf[..whole])?;
            buf.copy_within(whole..filled, 0);
            filled -= whole;
        }

        let whole = filled - filled % AES_BLOCK_SIZE;
        for block in buf[..whole].chunks_exact_mut(AES_BLOCK_SIZE) {
            enc.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        writer.write_all(&buf[..whole])?;

        let rest = filled - whole;
        let mut last = [0u8; AES_BLOCK_SIZE];
        last[..rest].copy_from_slice(&buf[whole..filled]);
        let tail = enc
            .encrypt_padded_mut::<Pkcs7>(&mut last, rest)
            .map_err(|e| CacheError::Cipher(format!("PKCS7 pad failed: {e}")))?;
        writer.write_all(tail)?;
        Ok(())
    }
}
