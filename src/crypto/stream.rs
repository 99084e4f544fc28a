//! Streaming envelope encryption
//!
//! Envelope layout: `IV (12) || ciphertext (n) || tag (16)`.
//!
//! The opener releases plaintext as soon as it is known not to be part of
//! the trailing tag, holding back at most 16 bytes. Plaintext already handed
//! downstream cannot be recalled when the tag later fails to verify, so a
//! consumer must treat the stream as untrusted until it ends without error.

use crate::crypto::gcm::Gcm;
use crate::crypto::{DataKey, IV_SIZE, TAG_SIZE};
use crate::error::{Error, Result};
use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use rand::RngCore;
use std::pin::Pin;
use tracing::debug;
use zeroize::Zeroize;

/// Incremental encryptor for a single envelope
pub struct EnvelopeSealer {
    iv: [u8; IV_SIZE],
    gcm: Gcm,
}

impl EnvelopeSealer {
    /// Start a new envelope under `key` with a fresh random IV
    pub fn new(key: &DataKey) -> Self {
        let mut iv = [0u8; IV_SIZE];
        rand::thread_rng().fill_bytes(&mut iv);
        Self::with_iv(key, iv)
    }

    fn with_iv(key: &DataKey, iv: [u8; IV_SIZE]) -> Self {
        EnvelopeSealer {
            iv,
            gcm: Gcm::new(key.as_bytes(), &iv),
        }
    }

    /// Leading envelope bytes, emitted before any ciphertext
    pub fn header(&self) -> [u8; IV_SIZE] {
        self.iv
    }

    /// Encrypt the next plaintext chunk
    pub fn update(&mut self, plaintext: &[u8]) -> Result<Bytes> {
        let mut buf = BytesMut::from(plaintext);
        self.gcm.encrypt(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Finish the envelope and return the trailing tag
    pub fn finish(self) -> [u8; TAG_SIZE] {
        self.gcm.tag()
    }
}

enum OpenerState {
    AwaitingIv {
        iv: [u8; IV_SIZE],
        filled: usize,
    },
    Decrypting {
        gcm: Gcm,
        /// Most recent bytes seen; the tag once input ends
        tail: [u8; TAG_SIZE],
        tail_len: usize,
    },
    Failed,
}

/// Incremental decryptor for a single envelope
///
/// Input may be split at any byte boundary. Retains at most an IV's worth of
/// bytes while waiting for the header and a tag's worth afterwards.
pub struct EnvelopeOpener {
    key: DataKey,
    state: OpenerState,
    received: u64,
}

impl EnvelopeOpener {
    pub fn new(key: &DataKey) -> Self {
        EnvelopeOpener {
            key: key.clone(),
            state: OpenerState::AwaitingIv {
                iv: [0u8; IV_SIZE],
                filled: 0,
            },
            received: 0,
        }
    }

    /// Total envelope bytes consumed so far
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Feed the next envelope chunk, returning whatever plaintext it releases
    pub fn update(&mut self, mut chunk: &[u8]) -> Result<Bytes> {
        self.received += chunk.len() as u64;

        let result = match &mut self.state {
            OpenerState::AwaitingIv { iv, filled } => {
                let take = (IV_SIZE - *filled).min(chunk.len());
                iv[*filled..*filled + take].copy_from_slice(&chunk[..take]);
                *filled += take;
                chunk = &chunk[take..];

                if *filled < IV_SIZE {
                    return Ok(Bytes::new());
                }

                let mut gcm = Gcm::new(self.key.as_bytes(), iv);
                iv.zeroize();
                let mut tail = [0u8; TAG_SIZE];
                let mut tail_len = 0;
                let released = Self::release(&mut gcm, &mut tail, &mut tail_len, chunk);
                self.state = OpenerState::Decrypting {
                    gcm,
                    tail,
                    tail_len,
                };
                released
            }
            OpenerState::Decrypting {
                gcm,
                tail,
                tail_len,
            } => Self::release(gcm, tail, tail_len, chunk),
            OpenerState::Failed => Err(Error::Integrity),
        };

        if result.is_err() {
            self.state = OpenerState::Failed;
        }
        result
    }

    /// Decrypt everything except the last 16 bytes of `tail || chunk`
    fn release(
        gcm: &mut Gcm,
        tail: &mut [u8; TAG_SIZE],
        tail_len: &mut usize,
        chunk: &[u8],
    ) -> Result<Bytes> {
        let combined = *tail_len + chunk.len();
        if combined <= TAG_SIZE {
            tail[*tail_len..combined].copy_from_slice(chunk);
            *tail_len = combined;
            return Ok(Bytes::new());
        }

        let release = combined - TAG_SIZE;
        let from_tail = release.min(*tail_len);
        let from_chunk = release - from_tail;

        let mut out = BytesMut::with_capacity(release);
        out.extend_from_slice(&tail[..from_tail]);
        out.extend_from_slice(&chunk[..from_chunk]);
        gcm.decrypt(&mut out)?;

        // Exactly TAG_SIZE bytes remain: the unreleased part of the old tail
        // followed by the rest of the chunk
        let kept = *tail_len - from_tail;
        tail.copy_within(from_tail..*tail_len, 0);
        tail[kept..].copy_from_slice(&chunk[from_chunk..]);
        *tail_len = TAG_SIZE;

        Ok(out.freeze())
    }

    /// Signal end of input and verify the tag
    pub fn finish(mut self) -> Result<()> {
        let state = std::mem::replace(&mut self.state, OpenerState::Failed);
        match state {
            OpenerState::Decrypting {
                gcm,
                tail,
                tail_len,
            } if tail_len == TAG_SIZE => {
                if gcm.verify(&tail) {
                    Ok(())
                } else {
                    Err(Error::Integrity)
                }
            }
            OpenerState::Failed => Err(Error::Integrity),
            _ => Err(Error::StreamTooShort {
                received: self.received,
            }),
        }
    }
}

impl Drop for EnvelopeOpener {
    fn drop(&mut self) {
        if let OpenerState::Decrypting { tail, .. } = &mut self.state {
            tail.zeroize();
        }
    }
}

type BoxedSource<S> = Pin<Box<S>>;

enum SealStage<S> {
    Header(BoxedSource<S>, EnvelopeSealer),
    Body(BoxedSource<S>, EnvelopeSealer),
    Done,
}

/// Encrypt a plaintext stream into an envelope stream
///
/// Yields the IV, then ciphertext per non-empty input chunk, then the tag.
/// If the source fails, its error is yielded and the stream ends without a
/// tag, so a truncated envelope never verifies.
pub fn encrypt_stream<S, E>(key: &DataKey, source: S) -> impl Stream<Item = Result<Bytes>>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: Into<Error>,
{
    let sealer = EnvelopeSealer::new(key);

    stream::unfold(SealStage::Header(Box::pin(source), sealer), |stage| async move {
        match stage {
            SealStage::Header(source, sealer) => {
                let iv = Bytes::copy_from_slice(&sealer.header());
                Some((Ok(iv), SealStage::Body(source, sealer)))
            }
            SealStage::Body(mut source, mut sealer) => loop {
                match source.next().await {
                    Some(Ok(chunk)) if chunk.is_empty() => continue,
                    Some(Ok(chunk)) => {
                        return match sealer.update(&chunk) {
                            Ok(ciphertext) => Some((Ok(ciphertext), SealStage::Body(source, sealer))),
                            Err(e) => Some((Err(e), SealStage::Done)),
                        };
                    }
                    Some(Err(e)) => {
                        debug!("Plaintext source failed, envelope left without tag");
                        let err: Error = e.into();
                        return Some((Err(err), SealStage::Done));
                    }
                    None => {
                        let tag = Bytes::copy_from_slice(&sealer.finish());
                        return Some((Ok(tag), SealStage::Done));
                    }
                }
            },
            SealStage::Done => None,
        }
    })
}

enum OpenStage<S> {
    Running(BoxedSource<S>, EnvelopeOpener),
    Done,
}

/// Decrypt an envelope stream back into plaintext
///
/// Ends cleanly only after the tag verified. Integrity and length failures
/// are yielded as the final item. Dropping the stream early never verifies.
pub fn decrypt_stream<S, E>(key: &DataKey, source: S) -> impl Stream<Item = Result<Bytes>>
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: Into<Error>,
{
    let opener = EnvelopeOpener::new(key);

    stream::unfold(OpenStage::Running(Box::pin(source), opener), |stage| async move {
        let (mut source, mut opener) = match stage {
            OpenStage::Running(source, opener) => (source, opener),
            OpenStage::Done => return None,
        };

        loop {
            match source.next().await {
                Some(Ok(chunk)) => match opener.update(&chunk) {
                    Ok(plaintext) if plaintext.is_empty() => continue,
                    Ok(plaintext) => return Some((Ok(plaintext), OpenStage::Running(source, opener))),
                    Err(e) => return Some((Err(e), OpenStage::Done)),
                },
                Some(Err(e)) => {
                    let err: Error = e.into();
                    return Some((Err(err), OpenStage::Done));
                }
                None => {
                    let received = opener.received();
                    return match opener.finish() {
                        Ok(()) => {
                            debug!("Envelope verified ({} bytes)", received);
                            None
                        }
                        Err(e) => Some((Err(e), OpenStage::Done)),
                    };
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{open_buffer, seal_buffer, KEY_SIZE, MIN_ENVELOPE_SIZE};
    use futures::executor::block_on;
    use futures::TryStreamExt;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn zero_key() -> DataKey {
        DataKey::from_bytes([0u8; KEY_SIZE])
    }

    fn chunks_of(data: &[u8], size: usize) -> Vec<io::Result<Bytes>> {
        data.chunks(size.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect()
    }

    fn encrypt_all(key: &DataKey, plaintext: &[u8], chunk: usize) -> Vec<u8> {
        let source = stream::iter(chunks_of(plaintext, chunk));
        let parts: Vec<Bytes> = block_on(encrypt_stream(key, source).try_collect()).unwrap();
        parts.concat()
    }

    fn decrypt_all(key: &DataKey, envelope: &[u8], chunk: usize) -> Result<Vec<u8>> {
        let source = stream::iter(chunks_of(envelope, chunk));
        let parts: Vec<Bytes> = block_on(decrypt_stream(key, source).try_collect())?;
        Ok(parts.concat())
    }

    #[test]
    fn test_sample_document() {
        let key = zero_key();
        let plaintext = b"Sample document content";

        let envelope = encrypt_all(&key, plaintext, 8);
        assert_eq!(envelope.len(), plaintext.len() + MIN_ENVELOPE_SIZE);
        assert_eq!(decrypt_all(&key, &envelope, 5).unwrap(), plaintext);
    }

    #[test]
    fn test_empty_plaintext() {
        let key = zero_key();
        let envelope = encrypt_all(&key, b"", 1);
        assert_eq!(envelope.len(), MIN_ENVELOPE_SIZE);
        assert!(decrypt_all(&key, &envelope, 3).unwrap().is_empty());
    }

    #[test]
    fn test_chunk_boundary_independence() {
        let key = DataKey::from_bytes([0x42; KEY_SIZE]);
        let plaintext: Vec<u8> = (0..1000u32).map(|i| (i * 31 % 251) as u8).collect();
        let envelope = encrypt_all(&key, &plaintext, 100);

        for size in [1, 7, 12, 13, 16, 17, 28, 29, envelope.len()] {
            assert_eq!(decrypt_all(&key, &envelope, size).unwrap(), plaintext, "chunk {}", size);
        }
    }

    #[test]
    fn test_fresh_iv_per_envelope() {
        let key = zero_key();
        let a = encrypt_all(&key, b"same", 4);
        let b = encrypt_all(&key, b"same", 4);
        assert_ne!(a[..IV_SIZE], b[..IV_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_every_bit_flip_detected() {
        let key = zero_key();
        let envelope = encrypt_all(&key, b"integrity matters", 4);

        for byte in IV_SIZE..envelope.len() {
            for bit in 0..8 {
                let mut tampered = envelope.clone();
                tampered[byte] ^= 1 << bit;
                let result = decrypt_all(&key, &tampered, 7);
                assert!(
                    matches!(result, Err(Error::Integrity)),
                    "byte {} bit {} accepted",
                    byte,
                    bit
                );
            }
        }
    }

    #[test]
    fn test_wrong_key_fails() {
        let envelope = encrypt_all(&zero_key(), b"secret", 6);
        let other = DataKey::from_bytes([1u8; KEY_SIZE]);
        assert!(matches!(decrypt_all(&other, &envelope, 6), Err(Error::Integrity)));
    }

    #[test]
    fn test_short_envelopes_rejected() {
        let key = zero_key();
        let envelope = encrypt_all(&key, b"", 1);

        for len in 0..MIN_ENVELOPE_SIZE {
            let result = decrypt_all(&key, &envelope[..len], 1);
            match result {
                Err(Error::StreamTooShort { received }) => assert_eq!(received, len as u64),
                other => panic!("length {} gave {:?}", len, other.map(|v| v.len())),
            }
        }
    }

    #[test]
    fn test_truncated_tail_fails() {
        let key = zero_key();
        let envelope = encrypt_all(&key, b"a longer message than one tag", 4);
        let truncated = &envelope[..envelope.len() - 1];
        assert!(matches!(decrypt_all(&key, truncated, 4), Err(Error::Integrity)));
    }

    #[test]
    fn test_source_error_suppresses_tag() {
        let key = zero_key();
        let source = stream::iter(vec![
            Ok(Bytes::from_static(b"first chunk")),
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "upstream gone")),
            Ok(Bytes::from_static(b"never read")),
        ]);

        let items: Vec<Result<Bytes>> = block_on(encrypt_stream(&key, source).collect());
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].as_ref().unwrap().len(), IV_SIZE);
        assert_eq!(items[1].as_ref().unwrap().len(), b"first chunk".len());
        match &items[2] {
            Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("expected upstream error, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn test_empty_chunks_skipped() {
        let key = zero_key();
        let source = stream::iter(vec![
            Ok::<_, io::Error>(Bytes::new()),
            Ok(Bytes::from_static(b"abc")),
            Ok(Bytes::new()),
        ]);
        let items: Vec<Bytes> = block_on(encrypt_stream(&key, source).try_collect()).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(decrypt_all(&key, &items.concat(), 2).unwrap(), b"abc");
    }

    #[test]
    fn test_opener_retains_at_most_a_tag() {
        let key = zero_key();
        let envelope = encrypt_all(&key, &[9u8; 64], 64);

        let mut opener = EnvelopeOpener::new(&key);
        let mut released = 0usize;
        for (i, byte) in envelope.iter().enumerate() {
            released += opener.update(std::slice::from_ref(byte)).unwrap().len();
            let seen = i + 1;
            let expected = seen.saturating_sub(MIN_ENVELOPE_SIZE);
            assert_eq!(released, expected);
        }
        opener.finish().unwrap();
        assert_eq!(released, 64);
    }

    #[test]
    fn test_chunk_completing_iv_releases_body() {
        let key = zero_key();
        let envelope = encrypt_all(&key, &[3u8; 40], 40);

        // IV split across updates, then the rest of the envelope at once
        let mut opener = EnvelopeOpener::new(&key);
        assert!(opener.update(&envelope[..5]).unwrap().is_empty());
        let released = opener.update(&envelope[5..]).unwrap();
        assert_eq!(released.as_ref(), &[3u8; 40][..]);
        opener.finish().unwrap();

        // Whole envelope in a single update
        let mut opener = EnvelopeOpener::new(&key);
        assert_eq!(opener.update(&envelope).unwrap().len(), 40);
        assert_eq!(opener.received(), envelope.len() as u64);
        opener.finish().unwrap();
    }

    #[test]
    fn test_opener_poisoned_after_failure() {
        let key = zero_key();
        let mut opener = EnvelopeOpener::new(&key);
        opener.state = OpenerState::Failed;
        assert!(opener.update(b"more").is_err());
        assert!(matches!(opener.finish(), Err(Error::Integrity)));
    }

    #[test]
    fn test_cancellation_never_finalizes() {
        let key = zero_key();
        let plaintext = vec![7u8; 4096];
        let envelope = encrypt_all(&key, &plaintext, 512);

        let mut tampered = envelope.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xFF;

        let chunks = chunks_of(&tampered, 512);
        let total_chunks = chunks.len();
        let pulled = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pulled);
        let source = stream::iter(chunks).inspect(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        // Reading only the first plaintext chunk and dropping the stream
        // stops reading and never surfaces a verdict
        let first: Vec<Result<Bytes>> = block_on(decrypt_stream(&key, source).take(1).collect());
        assert_eq!(first.len(), 1);
        assert!(first[0].is_ok());
        assert_eq!(pulled.load(Ordering::SeqCst), 1);
        assert!(total_chunks > 1);

        // Reading to the end does reach the verdict
        assert!(matches!(decrypt_all(&key, &tampered, 512), Err(Error::Integrity)));
    }

    #[test]
    fn test_interop_with_one_shot_gcm() {
        let key = DataKey::from_bytes([0x5A; KEY_SIZE]);
        let plaintext: Vec<u8> = (0..777u32).map(|i| i as u8).collect();

        let streamed = encrypt_all(&key, &plaintext, 50);
        assert_eq!(open_buffer(&key, &streamed).unwrap(), plaintext);

        let sealed = seal_buffer(&key, &plaintext).unwrap();
        assert_eq!(decrypt_all(&key, &sealed, 33).unwrap(), plaintext);
    }

    #[test]
    fn test_deterministic_iv_matches_one_shot() {
        let key = zero_key();
        let iv = [3u8; IV_SIZE];
        let mut sealer = EnvelopeSealer::with_iv(&key, iv);

        let mut envelope = sealer.header().to_vec();
        envelope.extend_from_slice(&sealer.update(b"hello ").unwrap());
        envelope.extend_from_slice(&sealer.update(b"world").unwrap());
        envelope.extend_from_slice(&sealer.finish());

        assert_eq!(&envelope[..IV_SIZE], &iv);
        assert_eq!(open_buffer(&key, &envelope).unwrap(), b"hello world");
    }
}
