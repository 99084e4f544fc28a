//! One-shot AES-256-GCM envelopes
//!
//! Whole-buffer counterparts of the streaming transforms. `seal_buffer` and
//! `open_buffer` use the same `IV || ciphertext || tag` layout as the
//! streams. `open_legacy` reads records written before streaming existed,
//! which placed the tag ahead of the ciphertext: `IV || tag || ciphertext`.

use crate::crypto::{DataKey, IV_SIZE, MIN_ENVELOPE_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};

fn aead_key(key: &DataKey) -> Result<LessSafeKey> {
    let unbound_key = UnboundKey::new(&AES_256_GCM, key.as_bytes())
        .map_err(|_| Error::KeyOperation("Failed to create AES-256-GCM key".to_string()))?;
    Ok(LessSafeKey::new(unbound_key))
}

fn split_iv(envelope: &[u8]) -> Result<(Nonce, &[u8])> {
    if envelope.len() < MIN_ENVELOPE_SIZE {
        return Err(Error::StreamTooShort {
            received: envelope.len() as u64,
        });
    }

    let mut iv = [0u8; IV_SIZE];
    iv.copy_from_slice(&envelope[..IV_SIZE]);
    Ok((Nonce::assume_unique_for_key(iv), &envelope[IV_SIZE..]))
}

/// Encrypt `plaintext` into a complete envelope with a fresh random IV
pub fn seal_buffer(key: &DataKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let sealing_key = aead_key(key)?;

    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);

    let mut in_out = plaintext.to_vec();
    in_out.reserve(TAG_SIZE);
    sealing_key
        .seal_in_place_append_tag(Nonce::assume_unique_for_key(iv), Aad::empty(), &mut in_out)
        .map_err(|_| Error::MessageTooLong)?;

    let mut envelope = Vec::with_capacity(IV_SIZE + in_out.len());
    envelope.extend_from_slice(&iv);
    envelope.extend_from_slice(&in_out);
    Ok(envelope)
}

/// Decrypt and verify a complete `IV || ciphertext || tag` envelope
pub fn open_buffer(key: &DataKey, envelope: &[u8]) -> Result<Vec<u8>> {
    let (nonce, body) = split_iv(envelope)?;
    let opening_key = aead_key(key)?;

    let mut in_out = body.to_vec();
    let plaintext = opening_key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| Error::Integrity)?;
    Ok(plaintext.to_vec())
}

/// Decrypt and verify a legacy `IV || tag || ciphertext` record
pub fn open_legacy(key: &DataKey, record: &[u8]) -> Result<Vec<u8>> {
    let (nonce, body) = split_iv(record)?;
    let opening_key = aead_key(key)?;

    let (tag, ciphertext) = body.split_at(TAG_SIZE);
    let mut in_out = Vec::with_capacity(body.len());
    in_out.extend_from_slice(ciphertext);
    in_out.extend_from_slice(tag);

    let plaintext = opening_key
        .open_in_place(nonce, Aad::empty(), &mut in_out)
        .map_err(|_| Error::Integrity)?;
    Ok(plaintext.to_vec())
}

/// Produce a legacy-layout record, for exercising the read path
#[cfg(test)]
pub(crate) fn seal_legacy(key: &DataKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let envelope = seal_buffer(key, plaintext)?;
    let (iv, rest) = envelope.split_at(IV_SIZE);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);

    let mut record = Vec::with_capacity(envelope.len());
    record.extend_from_slice(iv);
    record.extend_from_slice(tag);
    record.extend_from_slice(ciphertext);
    Ok(record)
}
