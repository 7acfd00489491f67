//! Container file codec.
//!
//! Every file the store manages is a self-describing container:
//!
//! ```text
//! offset 0: magic = "KRIN"                                   (4 bytes)
//! offset 4: flags                                            (1 byte)
//!           [if encrypted] wrapped file subkey       (variant-dependent)
//!           [if encrypted] AEAD stream begins here
//!                          plaintext starts with magic+flags (5 bytes)
//!           [if padded]    padding length (i32 BE) + padding bytes
//!           [if compressed] gzip stream
//!           payload, encoded per the flags' encoding bits
//! ```
//!
//! The repeated magic+flags inside the encrypted stream anchors the
//! plaintext to the declared flags: an attacker cannot strip or alter the
//! outer flags without the anchor check failing.
//!
//! Flag bits: low nibble is the payload encoding; `0x10` encrypted, `0x20`
//! compressed, `0x40` padded.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rand::rngs::OsRng;
use rand::RngCore;
use sha1::{Digest, Sha1};

use crate::crypto::stream::{StreamReader, StreamWriter};
use crate::crypto::EncryptionKey;
use crate::error::{Result, StoreError};

pub(crate) const MAGIC: &[u8; 4] = b"KRIN";

const F_ENCODING_MASK: u8 = 0x0F;
pub(crate) const F_ENCRYPTED: u8 = 0x10;
pub(crate) const F_COMPRESSED: u8 = 0x20;
pub(crate) const F_PADDED: u8 = 0x40;

/// Upper bound on padding for data files.
pub(crate) const MAX_PADDING_DATA: usize = 64 * 1024;

/// Upper bound on padding for blobs.
pub(crate) const MAX_PADDING_BLOB: usize = 1024 * 1024;

/// Payload encoding, stored in the low nibble of the flags byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Encoding {
    /// Two-space indented JSON.
    Json = 0x01,
    /// Self-describing tagged binary (CBOR).
    Tagged = 0x02,
    /// The object's own binary marshalling (see `BinaryRecord`).
    Binary = 0x03,
    /// Raw bytes, written as-is.
    Raw = 0x04,
}

impl Encoding {
    pub(crate) fn from_flags(flags: u8) -> Result<Encoding> {
        match flags & F_ENCODING_MASK {
            0x01 => Ok(Encoding::Json),
            0x02 => Ok(Encoding::Tagged),
            0x03 => Ok(Encoding::Binary),
            0x04 => Ok(Encoding::Raw),
            other => Err(StoreError::WrongEncoding(other)),
        }
    }
}

/// Stream context for a file: the first four bytes of the SHA-1 of its name.
/// Mixed into every chunk nonce, it binds ciphertext to the file it was
/// written for.
pub(crate) fn file_context(name: &str) -> [u8; 4] {
    let digest = Sha1::digest(name.as_bytes());
    digest[..4].try_into().expect("SHA-1 output is 20 bytes")
}

// =============================================================================
// Writing
// =============================================================================

#[derive(Debug)]
enum WriterStage {
    Plain(File),
    Encrypted(StreamWriter<File>),
    Compressed(GzEncoder<File>),
    CompressedEncrypted(GzEncoder<StreamWriter<File>>),
}

/// An open container being written.
///
/// The layers (encoder, gzip, AEAD stream, file) are finalized in order by
/// [`ContainerWriter::close`]; dropping the writer without closing it leaves
/// the file incomplete, which for the store's write paths means an abandoned
/// temp file that never replaces the real one.
#[derive(Debug)]
pub struct ContainerWriter {
    stage: Option<WriterStage>,
}

impl ContainerWriter {
    /// Finalizes all layers and syncs the file.
    pub fn close(mut self) -> Result<()> {
        let file = match self.stage.take().expect("close is the only consumer") {
            WriterStage::Plain(f) => f,
            WriterStage::Encrypted(sw) => sw.finish()?,
            WriterStage::Compressed(gz) => {
                gz.finish().map_err(|e| StoreError::io("gzip finish", e))?
            }
            WriterStage::CompressedEncrypted(gz) => gz
                .finish()
                .map_err(|e| StoreError::io("gzip finish", e))?
                .finish()?,
        };
        file.sync_all()
            .map_err(|e| StoreError::io("sync container", e))
    }
}

impl Write for ContainerWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.stage.as_mut().expect("writer is open") {
            WriterStage::Plain(w) => w.write(buf),
            WriterStage::Encrypted(w) => w.write(buf),
            WriterStage::Compressed(w) => w.write(buf),
            WriterStage::CompressedEncrypted(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.stage.as_mut().expect("writer is open") {
            WriterStage::Plain(w) => w.flush(),
            WriterStage::Encrypted(w) => w.flush(),
            WriterStage::Compressed(w) => w.flush(),
            WriterStage::CompressedEncrypted(w) => w.flush(),
        }
    }
}

/// Creates `full_path` exclusively and stacks the write pipeline dictated by
/// `flags`. The caller supplies the stream context of the *final* file name,
/// not the temp name.
pub(crate) fn open_write_stream(
    master_key: Option<&EncryptionKey>,
    full_path: &Path,
    flags: u8,
    ctx: [u8; 4],
    max_padding: usize,
) -> Result<ContainerWriter> {
    let mut f = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(full_path)
        .map_err(|e| StoreError::io(format!("create {}", full_path.display()), e))?;

    let header = [MAGIC[0], MAGIC[1], MAGIC[2], MAGIC[3], flags];
    f.write_all(&header)
        .map_err(|e| StoreError::io("write header", e))?;

    let stage = if flags & F_ENCRYPTED != 0 {
        let key = master_key.ok_or(StoreError::NoMasterKey)?;
        let mut subkey = key.new_subkey()?;
        subkey.write_wrapped_subkey(&mut f)?;
        let mut w = subkey.start_writer(ctx, f)?;
        subkey.wipe();
        // Re-emit the header inside the stream as the integrity anchor.
        w.write_all(&header)
            .map_err(|e| StoreError::io("write anchor", e))?;
        if flags & F_PADDED != 0 {
            add_padding(&mut w, max_padding)?;
        }
        if flags & F_COMPRESSED != 0 {
            WriterStage::CompressedEncrypted(GzEncoder::new(w, Compression::fast()))
        } else {
            WriterStage::Encrypted(w)
        }
    } else if flags & F_COMPRESSED != 0 {
        WriterStage::Compressed(GzEncoder::new(f, Compression::fast()))
    } else {
        WriterStage::Plain(f)
    };

    Ok(ContainerWriter { stage: Some(stage) })
}

/// Writes a random-sized padding in `[0, max)` at the current position,
/// introduced by a big-endian `i32` length.
pub(crate) fn add_padding<W: Write>(w: &mut W, max: usize) -> Result<()> {
    let mut b = [0u8; 3];
    OsRng.fill_bytes(&mut b);
    let n = ((usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2])) % max;
    w.write_all(&(n as i32).to_be_bytes())
        .map_err(|e| StoreError::io("write padding length", e))?;

    let pattern: Vec<u8> = b.iter().copied().cycle().take(3 * 1000).collect();
    let mut remaining = n;
    while remaining > 0 {
        let l = remaining.min(pattern.len());
        w.write_all(&pattern[..l])
            .map_err(|e| StoreError::io("write padding", e))?;
        remaining -= l;
    }
    Ok(())
}

/// Skips the padding written by [`add_padding`].
pub(crate) fn skip_padding<R: Read + Seek>(r: &mut R) -> Result<()> {
    let mut len_bytes = [0u8; 4];
    r.read_exact(&mut len_bytes)?;
    let n = i32::from_be_bytes(len_bytes);
    if n < 0 {
        return Err(StoreError::InvalidPadding);
    }
    r.seek(SeekFrom::Current(i64::from(n)))?;
    Ok(())
}

// =============================================================================
// Reading
// =============================================================================

/// The read side of the pipeline: positioned at the payload (or the gzip
/// stream) after [`open_container`] returns.
#[derive(Debug)]
pub(crate) enum ContainerReader {
    Plain(File),
    Encrypted(StreamReader<File>),
}

impl Read for ContainerReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::Encrypted(r) => r.read(buf),
        }
    }
}

impl Seek for ContainerReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::Plain(r) => r.seek(pos),
            Self::Encrypted(r) => r.seek(pos),
        }
    }
}

/// A container opened for reading.
#[derive(Debug)]
pub(crate) struct OpenContainer {
    pub(crate) flags: u8,
    pub(crate) encoding: Encoding,
    pub(crate) reader: ContainerReader,
}

impl OpenContainer {
    pub(crate) fn is_compressed(&self) -> bool {
        self.flags & F_COMPRESSED != 0
    }

    /// Reads the remaining payload, decompressing when the container is
    /// compressed.
    pub(crate) fn read_payload(&mut self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        if self.is_compressed() {
            GzDecoder::new(&mut self.reader)
                .read_to_end(&mut buf)
                .map_err(StoreError::from)?;
        } else {
            self.reader.read_to_end(&mut buf).map_err(StoreError::from)?;
        }
        Ok(buf)
    }
}

/// Opens a container, validates its framing, and unwraps the encryption
/// layer. `name` is the store-relative file name the stream context is
/// derived from.
pub(crate) fn open_container(
    master_key: Option<&EncryptionKey>,
    name: &str,
    full_path: &Path,
) -> Result<OpenContainer> {
    let mut f = File::open(full_path)
        .map_err(|e| StoreError::io(format!("open {}", full_path.display()), e))?;

    let mut hdr = [0u8; 5];
    f.read_exact(&mut hdr)
        .map_err(|e| StoreError::io("read header", e))?;
    if &hdr[..4] != MAGIC {
        return Err(StoreError::WrongMagic);
    }
    let flags = hdr[4];
    let encoding = Encoding::from_flags(flags)?;

    let reader = if flags & F_ENCRYPTED != 0 {
        let key = master_key.ok_or(StoreError::NoMasterKey)?;
        let mut subkey = key.read_wrapped_subkey(&mut f)?;
        let mut r = subkey.start_reader(file_context(name), f)?;
        subkey.wipe();

        let mut anchor = [0u8; 5];
        r.read_exact(&mut anchor).map_err(StoreError::from)?;
        if anchor != hdr {
            return Err(StoreError::HeaderMismatch);
        }
        if flags & F_PADDED != 0 {
            skip_padding(&mut r)?;
        }
        ContainerReader::Encrypted(r)
    } else {
        ContainerReader::Plain(f)
    };

    Ok(OpenContainer {
        flags,
        encoding,
        reader,
    })
}
