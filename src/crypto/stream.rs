//! Chunked AEAD streams with random access in the plaintext domain.
//!
//! Plaintext is split into fixed 1 MiB chunks, each sealed independently
//! (AES-256-GCM for AES keys, ChaCha20-Poly1305 for ChaCha keys), so a seek
//! costs at most one chunk of decryption. On disk every chunk occupies
//! `CHUNK_SIZE + TAG_SIZE` bytes; the final chunk may be short.
//!
//! The 12-byte chunk nonce is `ctx[0..4] || BE64(chunk_index)`, with the
//! index starting at 1. The 4-byte context is supplied by the caller (the
//! container layer derives it from the file name), binding ciphertext to its
//! intended file and position.

use std::io::{self, Read, Seek, SeekFrom, Write};

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use zeroize::Zeroize;

use crate::error::{Result, StoreError};

/// Size of a plaintext chunk.
pub const CHUNK_SIZE: usize = 1 << 20;

/// Size of the AEAD authentication tag.
pub const TAG_SIZE: usize = 16;

/// Size of a sealed chunk on disk.
pub const SEALED_CHUNK_SIZE: usize = CHUNK_SIZE + TAG_SIZE;

const NONCE_SIZE: usize = 12;

/// The AEAD used to seal stream chunks.
pub(crate) enum StreamCipher {
    Aes(Box<Aes256Gcm>),
    ChaCha(Box<ChaCha20Poly1305>),
}

impl std::fmt::Debug for StreamCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Aes(_) => f.write_str("StreamCipher::Aes(..)"),
            Self::ChaCha(_) => f.write_str("StreamCipher::ChaCha(..)"),
        }
    }
}

impl StreamCipher {
    pub(crate) fn aes(key: &[u8; 32]) -> Self {
        Self::Aes(Box::new(Aes256Gcm::new(key.into())))
    }

    pub(crate) fn chacha(key: &[u8; 32]) -> Self {
        Self::ChaCha(Box::new(ChaCha20Poly1305::new(key.into())))
    }

    fn seal(&self, nonce: &[u8; NONCE_SIZE], plaintext: &[u8]) -> Result<Vec<u8>> {
        let sealed = match self {
            Self::Aes(c) => c.encrypt(aes_gcm::Nonce::from_slice(nonce), plaintext),
            Self::ChaCha(c) => c.encrypt(chacha20poly1305::Nonce::from_slice(nonce), plaintext),
        };
        sealed.map_err(|_| StoreError::EncryptFailed)
    }

    fn open(&self, nonce: &[u8; NONCE_SIZE], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let opened = match self {
            Self::Aes(c) => c.decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext),
            Self::ChaCha(c) => c.decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext),
        };
        opened.map_err(|_| {
            log::debug!("stream chunk failed authentication");
            StoreError::DecryptFailed
        })
    }
}

/// Nonce for chunk `index` (1-based) in a stream with context `ctx`.
fn chunk_nonce(ctx: [u8; 4], index: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&ctx);
    nonce[4..].copy_from_slice(&index.to_be_bytes());
    nonce
}

/// Reads into `buf` until it is full or the source reaches EOF.
fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = r.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

// =============================================================================
// StreamWriter
// =============================================================================

/// Append-only AEAD stream writer.
///
/// Incoming writes are buffered; a sealed chunk is emitted whenever a full
/// `CHUNK_SIZE` of plaintext accumulates. [`StreamWriter::finish`] seals the
/// final (possibly short) chunk and hands the underlying writer back. After
/// sealing, consumed plaintext is zeroed from the buffer.
///
/// Dropping the writer without calling `finish` loses the buffered tail.
#[derive(Debug)]
pub struct StreamWriter<W: Write> {
    cipher: StreamCipher,
    inner: W,
    ctx: [u8; 4],
    chunk_index: u64,
    buf: Vec<u8>,
}

impl<W: Write> StreamWriter<W> {
    pub(crate) fn new(cipher: StreamCipher, ctx: [u8; 4], inner: W) -> Self {
        Self {
            cipher,
            inner,
            ctx,
            chunk_index: 0,
            buf: Vec::new(),
        }
    }

    /// Seals `self.buf[..len]`, writes it out, and zeroes the consumed bytes.
    fn write_chunk(&mut self, len: usize) -> Result<()> {
        self.chunk_index += 1;
        let nonce = chunk_nonce(self.ctx, self.chunk_index);
        let sealed = self.cipher.seal(&nonce, &self.buf[..len])?;
        self.buf[..len].zeroize();
        self.buf.drain(..len);
        self.inner
            .write_all(&sealed)
            .map_err(|e| StoreError::io("stream write", e))
    }

    /// Seals the final chunk and returns the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        if !self.buf.is_empty() {
            let len = self.buf.len();
            self.write_chunk(len)?;
        }
        self.inner
            .flush()
            .map_err(|e| StoreError::io("stream flush", e))?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for StreamWriter<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while self.buf.len() >= CHUNK_SIZE {
            self.write_chunk(CHUNK_SIZE).map_err(io::Error::from)?;
        }
        Ok(data.len())
    }

    /// Flushes sealed bytes only; a partial chunk stays buffered until
    /// [`StreamWriter::finish`].
    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// =============================================================================
// StreamReader
// =============================================================================

/// Seekable AEAD stream reader.
///
/// `read` serves bytes from the decrypted residue of the current chunk; when
/// the residue is exhausted the next ciphertext chunk is read and opened.
/// `read` returns `Ok(n > 0)` while plaintext remains, then `Ok(0)` at the
/// end of the stream.
///
/// Seeking (available when the source is `Seek`) operates on plaintext
/// offsets. A target inside the current residue window is served by slicing;
/// anything else seeks the source to the containing chunk and decrypts it.
#[derive(Debug)]
pub struct StreamReader<R> {
    cipher: StreamCipher,
    inner: R,
    ctx: [u8; 4],
    /// Plaintext cursor.
    off: u64,
    /// Ciphertext bytes consumed from the source so far; `source position -
    /// consumed` recovers the stream start without a constructor-time seek.
    consumed: u64,
    buf: Vec<u8>,
    buf_pos: usize,
}

impl<R: Read> StreamReader<R> {
    pub(crate) fn new(cipher: StreamCipher, ctx: [u8; 4], inner: R) -> Self {
        Self {
            cipher,
            inner,
            ctx,
            off: 0,
            consumed: 0,
            buf: Vec::new(),
            buf_pos: 0,
        }
    }

    fn residue(&self) -> usize {
        self.buf.len() - self.buf_pos
    }

    /// Reads and decrypts the next chunk. Leaves the residue empty at a clean
    /// end of stream; a truncated chunk or a failed open is `DecryptFailed`.
    fn read_chunk(&mut self) -> Result<()> {
        let mut sealed = vec![0u8; SEALED_CHUNK_SIZE];
        let n = read_full(&mut self.inner, &mut sealed)
            .map_err(|e| StoreError::io("stream read", e))?;
        self.buf.clear();
        self.buf_pos = 0;
        if n == 0 {
            return Ok(());
        }
        self.consumed += n as u64;
        if n <= TAG_SIZE {
            log::debug!("stream read: short chunk of {n} bytes");
            return Err(StoreError::DecryptFailed);
        }
        let index = self.off / CHUNK_SIZE as u64 + 1;
        let nonce = chunk_nonce(self.ctx, index);
        self.buf = self.cipher.open(&nonce, &sealed[..n])?;
        Ok(())
    }
}

impl<R: Read> Read for StreamReader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        if self.residue() == 0 {
            self.read_chunk().map_err(io::Error::from)?;
            if self.residue() == 0 {
                return Ok(0);
            }
        }
        let n = out.len().min(self.residue());
        out[..n].copy_from_slice(&self.buf[self.buf_pos..self.buf_pos + n]);
        self.buf_pos += n;
        self.off += n as u64;
        Ok(n)
    }
}

impl<R: Read + Seek> Seek for StreamReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_off = match pos {
            SeekFrom::Start(p) => i64::try_from(p)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "offset overflow"))?,
            SeekFrom::Current(d) => self.off as i64 + d,
            SeekFrom::End(d) => {
                // The physical size determines the decrypted size: whole
                // chunks plus a short final chunk less its tag.
                let here = self.inner.stream_position()?;
                let start = here - self.consumed;
                let size = self.inner.seek(SeekFrom::End(0))?;
                self.inner.seek(SeekFrom::Start(here))?;
                let sealed = SEALED_CHUNK_SIZE as i64;
                let n_chunks = (size - start) as i64 / sealed;
                let mut last = (size - start) as i64 % sealed;
                if last > 0 {
                    last -= TAG_SIZE as i64;
                }
                if last < 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "invalid last chunk",
                    ));
                }
                n_chunks * CHUNK_SIZE as i64 + last + d
            }
        };
        if new_off < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "negative seek offset",
            ));
        }
        let new_off = new_off as u64;
        if new_off == self.off {
            return Ok(self.off);
        }

        // Fast path: the target is inside the decrypted residue.
        if new_off > self.off {
            let d = new_off - self.off;
            if d < self.residue() as u64 {
                self.buf_pos += d as usize;
                self.off = new_off;
                return Ok(self.off);
            }
        }

        // Slow path: seek the source to the containing chunk and decrypt it.
        let start = self.inner.stream_position()? - self.consumed;
        self.off = new_off;
        let chunk_offset = (self.off % CHUNK_SIZE as u64) as usize;
        let target = start + self.off / CHUNK_SIZE as u64 * SEALED_CHUNK_SIZE as u64;
        self.inner.seek(SeekFrom::Start(target))?;
        self.consumed = target - start;
        self.buf.clear();
        self.buf_pos = 0;
        self.read_chunk().map_err(io::Error::from)?;
        if chunk_offset < self.buf.len() {
            self.buf_pos = chunk_offset;
        } else {
            self.buf.clear();
            self.buf_pos = 0;
        }
        Ok(self.off)
    }
}
