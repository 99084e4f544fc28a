//! Incremental AES-256-GCM
//!
//! ring only offers one-shot sealing, which would force whole documents into
//! memory. This builds GCM (NIST SP 800-38D, 96-bit IV, no AAD) from the AES
//! block cipher, a 32-bit big-endian CTR keystream and GHASH so ciphertext can
//! be produced and consumed in arbitrarily sized pieces.

use crate::crypto::{IV_SIZE, KEY_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::{Aes256, Block};
use ghash::universal_hash::UniversalHash;
use ghash::GHash;
use subtle::ConstantTimeEq;
use zeroize::Zeroize;

type Aes256Ctr32 = ctr::Ctr32BE<Aes256>;

const BLOCK_SIZE: usize = 16;

/// Largest plaintext GCM can protect under one IV: 2^39 - 256 bits
pub(crate) const MAX_MESSAGE_LEN: u64 = (1 << 36) - 32;

/// Running GCM state for one (key, IV) pair
pub(crate) struct Gcm {
    keystream: Aes256Ctr32,
    ghash: GHash,
    /// E(K, J0), XORed into the GHASH output to form the tag
    tag_mask: [u8; TAG_SIZE],
    /// Ciphertext bytes not yet absorbed as a full GHASH block
    partial: [u8; BLOCK_SIZE],
    partial_len: usize,
    processed: u64,
}

impl Gcm {
    pub(crate) fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        let cipher = Aes256::new(GenericArray::from_slice(key));

        let mut hash_key = Block::default();
        cipher.encrypt_block(&mut hash_key);

        let mut j0 = [0u8; BLOCK_SIZE];
        j0[..IV_SIZE].copy_from_slice(iv);
        j0[BLOCK_SIZE - 1] = 1;

        let mut mask = Block::clone_from_slice(&j0);
        cipher.encrypt_block(&mut mask);
        let mut tag_mask = [0u8; TAG_SIZE];
        tag_mask.copy_from_slice(&mask);
        mask.as_mut_slice().zeroize();

        // Payload keystream starts at inc32(J0)
        let mut first_counter = j0;
        first_counter[BLOCK_SIZE - 1] = 2;
        let keystream = Aes256Ctr32::new(
            GenericArray::from_slice(key),
            GenericArray::from_slice(&first_counter),
        );

        let ghash = GHash::new(&hash_key);
        hash_key.as_mut_slice().zeroize();

        Gcm {
            keystream,
            ghash,
            tag_mask,
            partial: [0u8; BLOCK_SIZE],
            partial_len: 0,
            processed: 0,
        }
    }

    /// Encrypt `buf` in place and fold the resulting ciphertext into the tag
    pub(crate) fn encrypt(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reserve(buf.len())?;
        self.keystream.apply_keystream(buf);
        self.absorb(buf);
        Ok(())
    }

    /// Fold ciphertext `buf` into the tag, then decrypt it in place
    pub(crate) fn decrypt(&mut self, buf: &mut [u8]) -> Result<()> {
        self.reserve(buf.len())?;
        self.absorb(buf);
        self.keystream.apply_keystream(buf);
        Ok(())
    }

    /// Compute the authentication tag over everything processed so far
    pub(crate) fn tag(&self) -> [u8; TAG_SIZE] {
        let mut ghash = self.ghash.clone();
        if self.partial_len > 0 {
            ghash.update_padded(&self.partial[..self.partial_len]);
        }

        // len(A) = 0 || len(C), both in bits
        let mut lengths = [0u8; BLOCK_SIZE];
        lengths[8..].copy_from_slice(&(self.processed * 8).to_be_bytes());
        ghash.update(&[Block::clone_from_slice(&lengths)]);

        let digest = ghash.finalize();
        let mut tag = [0u8; TAG_SIZE];
        for (out, (d, m)) in tag.iter_mut().zip(digest.iter().zip(self.tag_mask.iter())) {
            *out = d ^ m;
        }
        tag
    }

    /// Constant-time comparison of the computed tag against `expected`
    pub(crate) fn verify(&self, expected: &[u8; TAG_SIZE]) -> bool {
        let mut computed = self.tag();
        let ok: bool = computed[..].ct_eq(&expected[..]).into();
        computed.zeroize();
        ok
    }

    fn reserve(&mut self, len: usize) -> Result<()> {
        let total = self
            .processed
            .checked_add(len as u64)
            .filter(|total| *total <= MAX_MESSAGE_LEN)
            .ok_or(Error::MessageTooLong)?;
        self.processed = total;
        Ok(())
    }

    fn absorb(&mut self, mut data: &[u8]) {
        if self.partial_len > 0 {
            let take = (BLOCK_SIZE - self.partial_len).min(data.len());
            self.partial[self.partial_len..self.partial_len + take].copy_from_slice(&data[..take]);
            self.partial_len += take;
            data = &data[take..];

            if self.partial_len < BLOCK_SIZE {
                return;
            }
            self.ghash.update(&[Block::clone_from_slice(&self.partial)]);
            self.partial_len = 0;
        }

        let mut blocks = data.chunks_exact(BLOCK_SIZE);
        for block in &mut blocks {
            self.ghash.update(&[Block::clone_from_slice(block)]);
        }

        let rest = blocks.remainder();
        self.partial[..rest.len()].copy_from_slice(rest);
        self.partial_len = rest.len();
    }
}

// The AES key schedule, CTR state and GHASH key wipe themselves on drop
impl Drop for Gcm {
    fn drop(&mut self) {
        self.tag_mask.zeroize();
        self.partial.zeroize();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        hex::decode(s).unwrap()
    }

    #[test]
    fn test_block_cipher_wipes_on_drop() {
        fn wipes_on_drop<T: zeroize::ZeroizeOnDrop>() {}
        wipes_on_drop::<Aes256>();
    }

    // NIST GCM test vectors, AES-256 with 96-bit IV and no AAD
    #[test]
    fn test_nist_empty_plaintext() {
        let key = [0u8; KEY_SIZE];
        let iv = [0u8; IV_SIZE];
        let gcm = Gcm::new(&key, &iv);
        assert_eq!(gcm.tag().to_vec(), unhex("530f8afbc74536b9a963b4f1c4cb738b"));
    }

    #[test]
    fn test_nist_single_block() {
        let key = [0u8; KEY_SIZE];
        let iv = [0u8; IV_SIZE];
        let mut gcm = Gcm::new(&key, &iv);

        let mut buf = [0u8; 16];
        gcm.encrypt(&mut buf).unwrap();
        assert_eq!(buf.to_vec(), unhex("cea7403d4d606b6e074ec5d3baf39d18"));
        assert_eq!(gcm.tag().to_vec(), unhex("d0d1c8a799996bf0265b98b5d48ab919"));
    }

    #[test]
    fn test_nist_multi_block() {
        let key: [u8; KEY_SIZE] =
            unhex("feffe9928665731c6d6a8f9467308308feffe9928665731c6d6a8f9467308308")
                .try_into()
                .unwrap();
        let iv: [u8; IV_SIZE] = unhex("cafebabefacedbaddecaf888").try_into().unwrap();
        let plaintext = unhex(
            "d9313225f88406e5a55909c5aff5269a86a7a9531534f7da2e4c303d8a318a72\
             1c3c0c95956809532fcf0e2449a6b525b16aedf5aa0de657ba637b391aafd255",
        );
        let expected_ct = unhex(
            "522dc1f099567d07f47f37a32a84427d643a8cdcbfe5c0c97598a2bd2555d1aa\
             8cb08e48590dbb3da7b08b1056828838c5f61e6393ba7a0abcc9f662898015ad",
        );

        let mut gcm = Gcm::new(&key, &iv);
        let mut buf = plaintext.clone();
        gcm.encrypt(&mut buf).unwrap();
        assert_eq!(buf, expected_ct);
        assert_eq!(gcm.tag().to_vec(), unhex("b094dac5d93471bdec1a502270e3cc6c"));
    }

    #[test]
    fn test_split_updates_match_single_update() {
        let key = [7u8; KEY_SIZE];
        let iv = [9u8; IV_SIZE];
        let plaintext: Vec<u8> = (0..=200u8).collect();

        let mut whole = Gcm::new(&key, &iv);
        let mut expected = plaintext.clone();
        whole.encrypt(&mut expected).unwrap();

        for split in [1usize, 3, 15, 16, 17, 33] {
            let mut gcm = Gcm::new(&key, &iv);
            let mut out = Vec::new();
            for piece in plaintext.chunks(split) {
                let mut piece = piece.to_vec();
                gcm.encrypt(&mut piece).unwrap();
                out.extend_from_slice(&piece);
            }
            assert_eq!(out, expected, "split {}", split);
            assert_eq!(gcm.tag(), whole.tag(), "split {}", split);
        }
    }

    #[test]
    fn test_decrypt_inverts_encrypt() {
        let key = [1u8; KEY_SIZE];
        let iv = [2u8; IV_SIZE];
        let mut sealer = Gcm::new(&key, &iv);
        let mut buf = b"streaming gcm roundtrip".to_vec();
        sealer.encrypt(&mut buf).unwrap();
        let tag = sealer.tag();

        let mut opener = Gcm::new(&key, &iv);
        opener.decrypt(&mut buf).unwrap();
        assert_eq!(buf, b"streaming gcm roundtrip");
        assert!(opener.verify(&tag));

        let mut bad = tag;
        bad[0] ^= 1;
        assert!(!opener.verify(&bad));
    }

    #[test]
    fn test_message_limit() {
        let mut gcm = Gcm::new(&[0u8; KEY_SIZE], &[0u8; IV_SIZE]);
        gcm.processed = MAX_MESSAGE_LEN - 1;
        let mut two = [0u8; 2];
        assert!(matches!(gcm.encrypt(&mut two), Err(Error::MessageTooLong)));
        let mut one = [0u8; 1];
        assert!(gcm.encrypt(&mut one).is_ok());
    }
}
