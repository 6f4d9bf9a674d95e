//! Page transforms: CRC32 stamping and AES-128-CBC encryption
//!
//! On the write path the payload is encrypted first and the CRC is computed
//! last, over the bytes that actually hit the disk. On the read path the CRC
//! is verified before decryption, so corruption is detected without a key.
//! Page payloads are whole multiples of the AES block size, so CBC needs no
//! padding; the IV is derived from the page id and the environment salt.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::error::{Error, ErrorKind, Result};
use crate::storage::encoding::{read_u32, write_u32};
use crate::storage::page::{OFF_CRC, PAGE_HEADER_SIZE};
use crate::types::PageId;

const AES_BLOCK: usize = 16;

/// Offset where encryption starts on the header page; the magic, version,
/// salt and key-check fields before it must stay readable without a key.
pub const HEADER_PAGE_PLAIN: usize = 96;

/// Transform applied to every page crossing the device boundary.
pub struct PageTransform {
    crc_enabled: bool,
    cipher: Option<Aes128>,
    salt: [u8; 16],
}

impl PageTransform {
    pub fn new(crc_enabled: bool, key: Option<&[u8; 16]>, salt: [u8; 16]) -> Self {
        PageTransform {
            crc_enabled,
            cipher: key.map(|k| Aes128::new(GenericArray::from_slice(k))),
            salt,
        }
    }

    pub fn crc_enabled(&self) -> bool {
        self.crc_enabled
    }

    pub fn encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    /// Produce the on-disk image of a page: encrypt the payload in `data`
    /// (already a copy of the in-memory page) and stamp the CRC.
    pub fn seal(&self, id: PageId, data: &mut [u8]) {
        if let Some(cipher) = &self.cipher {
            let start = payload_start(id);
            cbc_encrypt(cipher, self.iv(id), &mut data[start..]);
        }
        if self.crc_enabled {
            let crc = crc_of(data);
            write_u32(data, OFF_CRC, crc);
        }
    }

    /// Verify and decrypt a page image read from the device.
    pub fn open(&self, id: PageId, data: &mut [u8]) -> Result<()> {
        if self.crc_enabled {
            let stored = read_u32(data, OFF_CRC);
            let actual = crc_of(data);
            if stored != actual {
                return Err(Error::with_detail(
                    ErrorKind::IntegrityViolated,
                    format!("page {id}: crc mismatch (stored {stored:#010x}, actual {actual:#010x})"),
                ));
            }
        }
        if let Some(cipher) = &self.cipher {
            let start = payload_start(id);
            cbc_decrypt(cipher, self.iv(id), &mut data[start..]);
        }
        Ok(())
    }

    /// Encrypt one block with the page-0 IV; used for the header key-check
    /// token that detects a wrong key at open time.
    pub fn key_check_token(&self, plain: &[u8; 16]) -> Option<[u8; 16]> {
        let cipher = self.cipher.as_ref()?;
        let mut block = *plain;
        let iv = self.iv(0);
        for i in 0..AES_BLOCK {
            block[i] ^= iv[i];
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(&mut block));
        Some(block)
    }

    fn iv(&self, id: PageId) -> [u8; 16] {
        let mut iv = self.salt;
        let id_bytes = id.to_le_bytes();
        for i in 0..8 {
            iv[i] ^= id_bytes[i];
        }
        iv
    }
}

/// Encryption skips the common header, and on the header page also the
/// plaintext identification fields.
fn payload_start(id: PageId) -> usize {
    if id == 0 {
        HEADER_PAGE_PLAIN
    } else {
        PAGE_HEADER_SIZE
    }
}

fn crc_of(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&data[OFF_CRC + 4..]);
    hasher.finalize()
}

fn cbc_encrypt(cipher: &Aes128, iv: [u8; 16], data: &mut [u8]) {
    debug_assert_eq!(data.len() % AES_BLOCK, 0);
    let mut prev = iv;
    for chunk in data.chunks_exact_mut(AES_BLOCK) {
        for i in 0..AES_BLOCK {
            chunk[i] ^= prev[i];
        }
        cipher.encrypt_block(GenericArray::from_mut_slice(chunk));
        prev.copy_from_slice(chunk);
    }
}

fn cbc_decrypt(cipher: &Aes128, iv: [u8; 16], data: &mut [u8]) {
    debug_assert_eq!(data.len() % AES_BLOCK, 0);
    let mut prev = iv;
    for chunk in data.chunks_exact_mut(AES_BLOCK) {
        let mut saved = [0u8; AES_BLOCK];
        saved.copy_from_slice(chunk);
        cipher.decrypt_block(GenericArray::from_mut_slice(chunk));
        for i in 0..AES_BLOCK {
            chunk[i] ^= prev[i];
        }
        prev = saved;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::{Page, PageKind};

    fn sample_page(id: PageId) -> Vec<u8> {
        let mut page = Page::new(id, 1024, PageKind::BtreeLeaf, 3);
        for (i, byte) in page.data.iter_mut().enumerate().skip(PAGE_HEADER_SIZE) {
            *byte = (i % 251) as u8;
        }
        page.data
    }

    #[test]
    fn test_crc_detects_flipped_byte() {
        let transform = PageTransform::new(true, None, [0u8; 16]);
        let mut data = sample_page(5);
        transform.seal(5, &mut data);
        transform.open(5, &mut data.clone()).unwrap();

        for victim in [4usize, 200, 1023] {
            let mut corrupted = data.clone();
            corrupted[victim] ^= 0x40;
            let err = transform.open(5, &mut corrupted).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::IntegrityViolated);
        }
    }

    #[test]
    fn test_encrypt_roundtrip() {
        let key = *b"0123456789abcdef";
        let transform = PageTransform::new(true, Some(&key), [9u8; 16]);
        let plain = sample_page(7);

        let mut sealed = plain.clone();
        transform.seal(7, &mut sealed);
        assert_ne!(&sealed[PAGE_HEADER_SIZE..], &plain[PAGE_HEADER_SIZE..]);

        transform.open(7, &mut sealed).unwrap();
        assert_eq!(sealed, plain);
    }

    #[test]
    fn test_same_payload_distinct_pages_differ() {
        let key = *b"0123456789abcdef";
        let transform = PageTransform::new(false, Some(&key), [1u8; 16]);
        let mut a = sample_page(1);
        let mut b = sample_page(2);
        // Make payloads identical; the ids (and thus IVs) differ.
        let payload: Vec<u8> = a[PAGE_HEADER_SIZE..].to_vec();
        b[PAGE_HEADER_SIZE..].copy_from_slice(&payload);

        transform.seal(1, &mut a);
        transform.seal(2, &mut b);
        assert_ne!(&a[PAGE_HEADER_SIZE..], &b[PAGE_HEADER_SIZE..]);
    }

    #[test]
    fn test_wrong_key_garbles_payload() {
        let transform = PageTransform::new(false, Some(b"0123456789abcdef"), [0u8; 16]);
        let other = PageTransform::new(false, Some(b"fedcba9876543210"), [0u8; 16]);
        let plain = sample_page(3);

        let mut sealed = plain.clone();
        transform.seal(3, &mut sealed);
        other.open(3, &mut sealed).unwrap();
        assert_ne!(sealed, plain);
    }

    #[test]
    fn test_key_check_token_is_key_dependent() {
        let a = PageTransform::new(false, Some(b"0123456789abcdef"), [2u8; 16]);
        let b = PageTransform::new(false, Some(b"fedcba9876543210"), [2u8; 16]);
        let plain = *b"burrowdbkeycheck";
        assert_ne!(a.key_check_token(&plain), b.key_check_token(&plain));
        assert!(PageTransform::new(false, None, [2u8; 16]).key_check_token(&plain).is_none());
    }
}
