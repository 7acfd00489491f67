//! Streaming blob access.
//!
//! Blobs are raw-byte containers written through the stream cipher, so they
//! can be produced incrementally and read back with random access. A blob is
//! written under a temporary name; the caller renames it into place when the
//! content is complete, which keeps half-written blobs invisible.

use std::io::{self, Read, Seek, SeekFrom};

use crate::error::{Result, StoreError};

use super::container::{
    file_context, open_container, open_write_stream, ContainerReader, ContainerWriter, Encoding,
    F_ENCRYPTED, F_PADDED, MAX_PADDING_BLOB,
};
use super::Store;

impl Store {
    /// Opens a blob for writing at `write_name`.
    ///
    /// `final_name` is the name the caller will rename the file to once the
    /// write is complete; the stream context (and therefore the chunk
    /// nonces) are bound to it, not to the temporary name. Close the
    /// returned writer before renaming.
    pub fn open_blob_write(
        &self,
        write_name: &str,
        final_name: &str,
    ) -> Result<ContainerWriter> {
        let path = self.full_path(write_name);
        self.create_parent_if_missing(&path)?;
        let mut flags = Encoding::Raw as u8;
        if self.master_key().is_some() {
            flags |= F_ENCRYPTED | F_PADDED;
        }
        open_write_stream(
            self.master_key(),
            &path,
            flags,
            file_context(final_name),
            MAX_PADDING_BLOB,
        )
    }

    /// Opens a blob for reading.
    ///
    /// The returned reader's offsets are relative to the start of the
    /// payload: seeking to 0 lands on the first content byte, past the
    /// container framing and padding.
    pub fn open_blob_read(&self, name: &str) -> Result<BlobReader> {
        let mut container = open_container(self.master_key(), name, &self.full_path(name))?;
        if container.encoding != Encoding::Raw || container.is_compressed() {
            return Err(StoreError::WrongEncoding(container.flags));
        }
        let start = container
            .reader
            .stream_position()
            .map_err(StoreError::from)?;
        Ok(BlobReader {
            inner: container.reader,
            start,
        })
    }
}

/// A seekable reader over a blob's content, with offsets relative to the
/// start of the payload.
pub struct BlobReader {
    inner: ContainerReader,
    start: u64,
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Seek for BlobReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let absolute = match pos {
            SeekFrom::Start(p) => self.inner.seek(SeekFrom::Start(self.start + p))?,
            other => self.inner.seek(other)?,
        };
        absolute.checked_sub(self.start).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the blob",
            )
        })
    }
}
