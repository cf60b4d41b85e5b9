//! Chunked AES-GCM streams used by encrypted buckets.
//!
//! # Stream Format
//!
//! Every encrypted stream consists of:
//! - **Stream nonce (12 bytes)**: random per stream, bound into every chunk's AAD
//! - **Content chunks (up to 32,796 bytes each)**: 12-byte nonce + ≤32KB ciphertext + 16-byte tag
//!
//! Each chunk is independently encrypted with AES-GCM. The AAD is
//! `chunk_number (8 bytes BE) || stream_nonce || final_flag (1 byte)`, so chunks
//! cannot be reordered, moved between streams, or dropped from the end. A stream
//! always ends with exactly one chunk flagged final, which may be empty.
//!
//! Authentication of the whole stream is only established once the final chunk
//! has been read. A reader abandoned before EOF has verified the chunks it
//! returned but has not proven the stream was not truncated.

use std::fmt;
use std::io::{self, Read, Write};

use aead::Payload;
use aes::Aes192;
use aes_gcm::{
    Aes128Gcm, Aes256Gcm, AesGcm, Nonce,
    aead::{Aead, KeyInit, consts::U12},
};
use rand::RngCore;
use tracing::{debug, trace, warn};
use zeroize::Zeroizing;

use super::{CryptoError, KeySize};

// ============================================================================
// Constants
// ============================================================================

/// Size of the per-stream nonce written at the start of every stream.
pub const STREAM_NONCE_SIZE: usize = 12;

/// Size of the per-chunk nonce.
pub const CHUNK_NONCE_SIZE: usize = 12;

/// Size of the GCM authentication tag.
pub const TAG_SIZE: usize = 16;

/// Maximum plaintext size per chunk (32 KB).
pub const CHUNK_PLAINTEXT_SIZE: usize = 32768;

/// Overhead per chunk (nonce + tag).
pub const CHUNK_OVERHEAD: usize = CHUNK_NONCE_SIZE + TAG_SIZE;

/// Maximum encrypted chunk size (nonce + ciphertext + tag).
pub const CHUNK_ENCRYPTED_SIZE: usize = CHUNK_PLAINTEXT_SIZE + CHUNK_OVERHEAD;

const AAD_SIZE: usize = 8 + STREAM_NONCE_SIZE + 1;

// ============================================================================
// Size Math
// ============================================================================

/// Number of chunks used to encrypt `plaintext_size` bytes.
#[inline]
pub fn chunk_count(plaintext_size: u64) -> u64 {
    plaintext_size.div_ceil(CHUNK_PLAINTEXT_SIZE as u64).max(1)
}

/// Physical size of a stream carrying `plaintext_size` bytes.
pub fn plaintext_to_encrypted_size(plaintext_size: u64) -> u64 {
    STREAM_NONCE_SIZE as u64 + plaintext_size + chunk_count(plaintext_size) * CHUNK_OVERHEAD as u64
}

/// Plaintext size of a stream that is `encrypted_size` bytes long.
///
/// Returns `None` if no complete stream has that length.
pub fn encrypted_to_plaintext_size(encrypted_size: u64) -> Option<u64> {
    if encrypted_size < (STREAM_NONCE_SIZE + CHUNK_OVERHEAD) as u64 {
        return None;
    }
    let content = encrypted_size - STREAM_NONCE_SIZE as u64;
    let chunks = content.div_ceil(CHUNK_ENCRYPTED_SIZE as u64);
    let last_chunk = content - (chunks - 1) * CHUNK_ENCRYPTED_SIZE as u64;
    if last_chunk < CHUNK_OVERHEAD as u64 {
        return None;
    }
    Some(content - chunks * CHUNK_OVERHEAD as u64)
}

// ============================================================================
// Cipher
// ============================================================================

type Aes192Gcm = AesGcm<Aes192, U12>;

/// AES-GCM instance for one of the three supported key sizes.
pub(crate) enum ChunkCipher {
    Aes128(Box<Aes128Gcm>),
    Aes192(Box<Aes192Gcm>),
    Aes256(Box<Aes256Gcm>),
}

impl fmt::Debug for ChunkCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChunkCipher::Aes128(_) => "AES-128-GCM",
            ChunkCipher::Aes192(_) => "AES-192-GCM",
            ChunkCipher::Aes256(_) => "AES-256-GCM",
        };
        f.write_str(name)
    }
}

impl ChunkCipher {
    pub(crate) fn new(key: &[u8]) -> Result<Self, CryptoError> {
        let invalid = |_| CryptoError::InvalidKeyLength { actual: key.len() };
        Ok(match KeySize::from_len(key.len())? {
            KeySize::Aes128 => ChunkCipher::Aes128(Box::new(
                Aes128Gcm::new_from_slice(key).map_err(invalid)?,
            )),
            KeySize::Aes192 => ChunkCipher::Aes192(Box::new(
                Aes192Gcm::new_from_slice(key).map_err(invalid)?,
            )),
            KeySize::Aes256 => ChunkCipher::Aes256(Box::new(
                Aes256Gcm::new_from_slice(key).map_err(invalid)?,
            )),
        })
    }

    fn encrypt(&self, nonce: &[u8; CHUNK_NONCE_SIZE], payload: Payload<'_, '_>) -> aead::Result<Vec<u8>> {
        let nonce = Nonce::<U12>::from_slice(nonce);
        match self {
            ChunkCipher::Aes128(c) => c.encrypt(nonce, payload),
            ChunkCipher::Aes192(c) => c.encrypt(nonce, payload),
            ChunkCipher::Aes256(c) => c.encrypt(nonce, payload),
        }
    }

    fn decrypt(&self, nonce: &[u8], payload: Payload<'_, '_>) -> aead::Result<Vec<u8>> {
        let nonce = Nonce::<U12>::from_slice(nonce);
        match self {
            ChunkCipher::Aes128(c) => c.decrypt(nonce, payload),
            ChunkCipher::Aes192(c) => c.decrypt(nonce, payload),
            ChunkCipher::Aes256(c) => c.decrypt(nonce, payload),
        }
    }
}

fn chunk_aad(chunk_number: u64, stream_nonce: &[u8; STREAM_NONCE_SIZE], is_final: bool) -> [u8; AAD_SIZE] {
    let mut aad = [0u8; AAD_SIZE];
    aad[..8].copy_from_slice(&chunk_number.to_be_bytes());
    aad[8..8 + STREAM_NONCE_SIZE].copy_from_slice(stream_nonce);
    aad[AAD_SIZE - 1] = u8::from(is_final);
    aad
}

fn integrity_error(err: CryptoError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

// ============================================================================
// AeadStreamWriter
// ============================================================================

/// Encrypting writer.
///
/// Buffers up to one chunk of plaintext. A chunk is only sealed once more data
/// follows it, so that [`finish`](Self::finish) can flag the last chunk final.
/// Dropping an unfinished writer finishes it best-effort.
pub struct AeadStreamWriter<W: Write> {
    inner: W,
    cipher: ChunkCipher,
    stream_nonce: [u8; STREAM_NONCE_SIZE],
    buffer: Zeroizing<Vec<u8>>,
    chunks_written: u64,
    header_written: bool,
    finished: bool,
}

impl<W: Write> fmt::Debug for AeadStreamWriter<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AeadStreamWriter")
            .field("cipher", &self.cipher)
            .field("chunks_written", &self.chunks_written)
            .field("buffer_len", &self.buffer.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl<W: Write> AeadStreamWriter<W> {
    /// Start a new encrypted stream with a fresh random stream nonce.
    pub fn new(inner: W, key: &[u8]) -> Result<Self, CryptoError> {
        let cipher = ChunkCipher::new(key)?;
        let mut stream_nonce = [0u8; STREAM_NONCE_SIZE];
        rand::rng().fill_bytes(&mut stream_nonce);

        Ok(Self {
            inner,
            cipher,
            stream_nonce,
            buffer: Zeroizing::new(Vec::with_capacity(CHUNK_PLAINTEXT_SIZE)),
            chunks_written: 0,
            header_written: false,
            finished: false,
        })
    }

    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    fn write_header(&mut self) -> io::Result<()> {
        if !self.header_written {
            self.inner.write_all(&self.stream_nonce)?;
            self.header_written = true;
        }
        Ok(())
    }

    fn write_chunk(&mut self, plaintext: &[u8], is_final: bool) -> io::Result<()> {
        let chunk_number = self.chunks_written;

        let mut chunk_nonce = [0u8; CHUNK_NONCE_SIZE];
        rand::rng().fill_bytes(&mut chunk_nonce);

        let aad = chunk_aad(chunk_number, &self.stream_nonce, is_final);
        let payload = Payload {
            msg: plaintext,
            aad: &aad,
        };

        let ciphertext = self.cipher.encrypt(&chunk_nonce, payload).map_err(|e| {
            io::Error::other(CryptoError::ChunkEncryptionFailed {
                chunk_number,
                reason: e.to_string(),
            })
        })?;

        self.inner.write_all(&chunk_nonce)?;
        self.inner.write_all(&ciphertext)?;

        self.chunks_written += 1;
        trace!(
            chunk = chunk_number,
            plaintext_size = plaintext.len(),
            is_final,
            "Chunk written"
        );
        Ok(())
    }

    /// Seal the remaining buffer as the final chunk.
    ///
    /// Idempotent. Does not close the inner writer.
    pub fn finish(&mut self) -> io::Result<()> {
        if self.finished {
            return Ok(());
        }
        self.write_header()?;

        let remaining = Zeroizing::new(std::mem::take(&mut *self.buffer));
        self.write_chunk(&remaining, true)?;
        self.finished = true;
        self.inner.flush()?;

        debug!(chunks = self.chunks_written, "Encrypted stream finished");
        Ok(())
    }
}

impl<W: Write> Write for AeadStreamWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.finished {
            return Err(io::Error::other("encrypted stream already finished"));
        }
        self.write_header()?;

        self.buffer.extend_from_slice(data);
        while self.buffer.len() > CHUNK_PLAINTEXT_SIZE {
            let chunk = Zeroizing::new(self.buffer.drain(..CHUNK_PLAINTEXT_SIZE).collect::<Vec<u8>>());
            self.write_chunk(&chunk, false)?;
        }

        Ok(data.len())
    }

    /// Flushes sealed chunks only; buffered plaintext stays until more data or
    /// [`finish`](Self::finish).
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> Drop for AeadStreamWriter<W> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("AeadStreamWriter dropped without finish()");
            if let Err(e) = self.finish() {
                warn!(error = %e, "Failed to finish encrypted stream on drop");
            }
        }
    }
}

// ============================================================================
// AeadStreamReader
// ============================================================================

/// Decrypting reader.
///
/// Returns plaintext one verified chunk at a time. Any authentication failure
/// surfaces as an [`io::ErrorKind::InvalidData`] error wrapping a
/// [`CryptoError`]; the failing chunk's plaintext is never returned.
pub struct AeadStreamReader<R: Read> {
    inner: R,
    cipher: ChunkCipher,
    stream_nonce: Option<[u8; STREAM_NONCE_SIZE]>,
    /// Encrypted bytes read ahead of the current chunk. One byte beyond a full
    /// chunk tells us whether the chunk is the last one.
    pending: Vec<u8>,
    plaintext: Zeroizing<Vec<u8>>,
    position: usize,
    chunk_number: u64,
    source_exhausted: bool,
    done: bool,
}

impl<R: Read> fmt::Debug for AeadStreamReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AeadStreamReader")
            .field("cipher", &self.cipher)
            .field("chunk_number", &self.chunk_number)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

impl<R: Read> AeadStreamReader<R> {
    pub fn new(inner: R, key: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            inner,
            cipher: ChunkCipher::new(key)?,
            stream_nonce: None,
            pending: Vec::with_capacity(CHUNK_ENCRYPTED_SIZE + 1),
            plaintext: Zeroizing::new(Vec::new()),
            position: 0,
            chunk_number: 0,
            source_exhausted: false,
            done: false,
        })
    }

    /// Whether the final chunk has been read and verified.
    pub fn is_complete(&self) -> bool {
        self.done
    }

    fn read_stream_nonce(&mut self) -> io::Result<[u8; STREAM_NONCE_SIZE]> {
        if let Some(nonce) = self.stream_nonce {
            return Ok(nonce);
        }
        let mut nonce = [0u8; STREAM_NONCE_SIZE];
        self.inner.read_exact(&mut nonce).map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                integrity_error(CryptoError::Truncated {
                    reason: "missing stream nonce".to_string(),
                })
            } else {
                e
            }
        })?;
        self.stream_nonce = Some(nonce);
        Ok(nonce)
    }

    fn fill_pending(&mut self) -> io::Result<()> {
        let want = CHUNK_ENCRYPTED_SIZE + 1;
        while self.pending.len() < want && !self.source_exhausted {
            let start = self.pending.len();
            self.pending.resize(want, 0);
            match self.inner.read(&mut self.pending[start..]) {
                Ok(0) => {
                    self.pending.truncate(start);
                    self.source_exhausted = true;
                }
                Ok(n) => self.pending.truncate(start + n),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => self.pending.truncate(start),
                Err(e) => {
                    self.pending.truncate(start);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn next_chunk(&mut self) -> io::Result<()> {
        let stream_nonce = self.read_stream_nonce()?;
        self.fill_pending()?;

        let chunk_number = self.chunk_number;
        let is_final = self.pending.len() <= CHUNK_ENCRYPTED_SIZE;
        let take = self.pending.len().min(CHUNK_ENCRYPTED_SIZE);

        if take < CHUNK_OVERHEAD {
            warn!(chunk = chunk_number, actual_size = take, "Incomplete chunk");
            return Err(integrity_error(CryptoError::Truncated {
                reason: format!(
                    "chunk {chunk_number}: expected at least {CHUNK_OVERHEAD} bytes, got {take}"
                ),
            }));
        }

        let encrypted: Vec<u8> = self.pending.drain(..take).collect();
        let aad = chunk_aad(chunk_number, &stream_nonce, is_final);
        let payload = Payload {
            msg: &encrypted[CHUNK_NONCE_SIZE..],
            aad: &aad,
        };

        let decrypted = self
            .cipher
            .decrypt(&encrypted[..CHUNK_NONCE_SIZE], payload)
            .map_err(|_| {
                warn!(
                    chunk = chunk_number,
                    "Chunk decryption failed - authentication tag mismatch"
                );
                integrity_error(CryptoError::ChunkDecryptionFailed { chunk_number })
            })?;

        trace!(chunk = chunk_number, decrypted_size = decrypted.len(), is_final, "Chunk decrypted");

        self.plaintext = Zeroizing::new(decrypted);
        self.position = 0;
        self.chunk_number += 1;
        if is_final {
            self.done = true;
        }
        Ok(())
    }
}

impl<R: Read> Read for AeadStreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if self.position < self.plaintext.len() {
                let n = buf.len().min(self.plaintext.len() - self.position);
                buf[..n].copy_from_slice(&self.plaintext[self.position..self.position + n]);
                self.position += n;
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }
            self.next_chunk()?;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
