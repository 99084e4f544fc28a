//! Cryptography module for docvault
//!
//! Two-tier key hierarchy: an RSA-OAEP master keypair wraps a fresh
//! AES-256-GCM data key per document. Document bodies are sealed into
//! envelopes of the form `IV || ciphertext || tag` by streaming transforms
//! that never hold more than an IV or tag worth of envelope bytes.

mod encryption;
mod gcm;
mod keys;
mod stream;

pub use encryption::{open_buffer, open_legacy, seal_buffer};
pub use keys::{
    generate_pem_pair, normalize_pem, DataKey, DataKeyFactory, KeyManager, MasterKeySource,
    PemKeyPair, WrappedKey,
};
pub use stream::{decrypt_stream, encrypt_stream, EnvelopeOpener, EnvelopeSealer};

#[cfg(test)]
pub(crate) use encryption::seal_legacy;
#[cfg(test)]
pub(crate) use keys::test_pem_pair;

/// Size of AES-256 key in bytes
pub const KEY_SIZE: usize = 32;

/// Size of GCM nonce in bytes
pub const IV_SIZE: usize = 12;

/// Size of GCM authentication tag in bytes
pub const TAG_SIZE: usize = 16;

/// Smallest possible envelope: IV and tag around an empty ciphertext
pub const MIN_ENVELOPE_SIZE: usize = IV_SIZE + TAG_SIZE;

/// Minimum accepted RSA modulus size in bits
pub const MIN_RSA_BITS: usize = 2048;
