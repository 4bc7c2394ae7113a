//! # Image Encryption
//!
//! Optional at-rest encryption for file-backed databases. The caller supplies
//! a 64-byte key: the first 32 bytes key AES-256-GCM, the second 32 bytes key
//! an HMAC-SHA-256 over each stored block.
//!
//! Encrypted databases do not memory-map the file. Instead the decrypted
//! image lives in a buffer and the on-disk file is a container:
//!
//! ```text
//! Offset  Size   Description
//! ------  -----  --------------------------------------------
//! 0       8      magic "CDBENC\0\0"
//! 8       4      container version (little-endian)
//! 12      8      image length in bytes (little-endian)
//! 20      12     reserved
//! 32      ...    encrypted blocks, 4156 bytes each
//! ```
//!
//! Each 4096-byte image block is stored as
//! `nonce(12) | ciphertext+tag(4112) | hmac(32)`. The block index is bound
//! into the GCM associated data and the HMAC input, so blocks cannot be
//! reordered without detection. Nonces are drawn fresh from the OS RNG on
//! every write.

use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, Key, KeyInit, Nonce};
use eyre::Result;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::error::{err, ErrorKind};

pub const KEY_SIZE: usize = 64;
pub const BLOCK_SIZE: usize = 4096;
pub const CONTAINER_HEADER_SIZE: usize = 32;

const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const MAC_SIZE: usize = 32;
/// nonce + ciphertext + tag + hmac
pub const STORED_BLOCK_SIZE: usize = NONCE_SIZE + BLOCK_SIZE + TAG_SIZE + MAC_SIZE;

const CONTAINER_MAGIC: &[u8; 8] = b"CDBENC\x00\x00";
const CONTAINER_VERSION: u32 = 1;

type HmacSha256 = Hmac<Sha256>;

pub struct PageCipher {
    aes: Aes256Gcm,
    mac_key: [u8; 32],
}

impl PageCipher {
    pub fn new(key: &[u8]) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(err(ErrorKind::ConfigInvalid(format!(
                "encryption key must be {} bytes, got {}",
                KEY_SIZE,
                key.len()
            ))));
        }
        let aes = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key[..32]));
        let mut mac_key = [0u8; 32];
        mac_key.copy_from_slice(&key[32..]);
        Ok(Self { aes, mac_key })
    }

    pub fn container_header(image_len: u64) -> [u8; CONTAINER_HEADER_SIZE] {
        let mut header = [0u8; CONTAINER_HEADER_SIZE];
        header[..8].copy_from_slice(CONTAINER_MAGIC);
        header[8..12].copy_from_slice(&CONTAINER_VERSION.to_le_bytes());
        header[12..20].copy_from_slice(&image_len.to_le_bytes());
        header
    }

    pub fn parse_container_header(header: &[u8]) -> Result<u64> {
        if header.len() < CONTAINER_HEADER_SIZE || &header[..8] != CONTAINER_MAGIC {
            return Err(err(ErrorKind::InvalidDatabase(
                "not an encrypted database container".into(),
            )));
        }
        let version = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        if version != CONTAINER_VERSION {
            return Err(err(ErrorKind::InvalidDatabase(format!(
                "unsupported container version {}",
                version
            ))));
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&header[12..20]);
        Ok(u64::from_le_bytes(raw))
    }

    /// File offset of encrypted block `index`.
    pub fn block_offset(index: u64) -> u64 {
        CONTAINER_HEADER_SIZE as u64 + index * STORED_BLOCK_SIZE as u64
    }

    /// Encrypts one 4096-byte image block into its stored form.
    pub fn encrypt_block(&self, index: u64, block: &[u8; BLOCK_SIZE]) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let aad = index.to_le_bytes();
        let ct = self
            .aes
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: block,
                    aad: &aad,
                },
            )
            .expect("AES-GCM encryption is infallible for in-memory buffers");

        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .expect("HMAC accepts any key length");
        mac.update(&aad);
        mac.update(&nonce);
        mac.update(&ct);
        let tag = mac.finalize().into_bytes();

        let mut out = Vec::with_capacity(STORED_BLOCK_SIZE);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        out.extend_from_slice(&tag);
        out
    }

    /// Verifies and decrypts one stored block.
    pub fn decrypt_block(&self, index: u64, stored: &[u8]) -> Result<[u8; BLOCK_SIZE]> {
        if stored.len() != STORED_BLOCK_SIZE {
            return Err(err(ErrorKind::InvalidDatabase(format!(
                "encrypted block {} truncated: {} bytes",
                index,
                stored.len()
            ))));
        }
        let nonce = &stored[..NONCE_SIZE];
        let ct = &stored[NONCE_SIZE..NONCE_SIZE + BLOCK_SIZE + TAG_SIZE];
        let stored_mac = &stored[NONCE_SIZE + BLOCK_SIZE + TAG_SIZE..];

        let aad = index.to_le_bytes();
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
            .expect("HMAC accepts any key length");
        mac.update(&aad);
        mac.update(nonce);
        mac.update(ct);
        if mac.verify_slice(stored_mac).is_err() {
            return Err(err(ErrorKind::InvalidDatabase(format!(
                "HMAC verification failed for block {}",
                index
            ))));
        }

        let pt = self
            .aes
            .decrypt(Nonce::from_slice(nonce), Payload { msg: ct, aad: &aad })
            .map_err(|_| {
                err(ErrorKind::InvalidDatabase(format!(
                    "decryption failed for block {}",
                    index
                )))
            })?;

        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(&pt);
        Ok(block)
    }

    /// Encrypts a whole image into container bytes.
    pub fn encrypt_image(&self, image: &[u8]) -> Vec<u8> {
        let block_count = image.len().div_ceil(BLOCK_SIZE);
        let mut out = Vec::with_capacity(CONTAINER_HEADER_SIZE + block_count * STORED_BLOCK_SIZE);
        out.extend_from_slice(&Self::container_header(image.len() as u64));
        let mut block = [0u8; BLOCK_SIZE];
        for i in 0..block_count {
            let start = i * BLOCK_SIZE;
            let end = (start + BLOCK_SIZE).min(image.len());
            block.fill(0);
            block[..end - start].copy_from_slice(&image[start..end]);
            out.extend_from_slice(&self.encrypt_block(i as u64, &block));
        }
        out
    }

    /// Decrypts a whole container back into the image.
    pub fn decrypt_image(&self, container: &[u8]) -> Result<Vec<u8>> {
        let image_len = Self::parse_container_header(container)? as usize;
        let block_count = image_len.div_ceil(BLOCK_SIZE);
        let mut image = vec![0u8; block_count * BLOCK_SIZE];
        for i in 0..block_count {
            let start = CONTAINER_HEADER_SIZE + i * STORED_BLOCK_SIZE;
            let end = start + STORED_BLOCK_SIZE;
            if end > container.len() {
                return Err(err(ErrorKind::InvalidDatabase(format!(
                    "encrypted container truncated at block {}",
                    i
                ))));
            }
            let block = self.decrypt_block(i as u64, &container[start..end])?;
            image[i * BLOCK_SIZE..(i + 1) * BLOCK_SIZE].copy_from_slice(&block);
        }
        image.truncate(image_len);
        Ok(image)
    }
}
