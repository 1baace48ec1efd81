//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Smtpkit.
//
// Smtpkit is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published by  the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Smtpkit is distributed  in the hope that it will  be useful, but WITHOUT
// ANY WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or
// FITNESS FOR  A PARTICULAR  PURPOSE. See  the GNU General Public  License
// for more details.
//
// You should have received a copy of the GNU General Public License along
// with Smtpkit. If not, see <http://www.gnu.org/licenses/>.

//! Byte buffers shared by the protocol engines.
//!
//! `ByteBuf` is what makes the engines sans-I/O: parsers read from an input
//! `ByteBuf` and renderers append to an output `ByteBuf`, while something
//! else entirely is responsible for moving bytes between the buffers and
//! the outside world.
//!
//! `BodyWriter`/`BodyReader` are the write-once-read-once spool used as the
//! default sink for message bodies, which spills to an anonymous temporary
//! file once it exceeds a maximum in-memory size.

use std::fs;
use std::io::{self, Read, Seek, Write};
use std::mem;
use std::path::PathBuf;

/// Terminal status of one half of a byte stream.
///
/// Distinguishes a clean end-of-stream from a fatal transport failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Finality {
    /// More bytes may still arrive.
    Open,
    /// The stream ended cleanly; no more bytes will ever appear.
    Eof,
    /// The stream failed fatally; no more bytes will ever appear.
    Error(io::ErrorKind),
}

impl Finality {
    pub fn is_open(self) -> bool {
        matches!(self, Finality::Open)
    }

    pub fn is_eof(self) -> bool {
        matches!(self, Finality::Eof)
    }

    pub fn is_error(self) -> bool {
        matches!(self, Finality::Error(_))
    }
}

/// An append-only byte buffer with a consumed-position cursor.
///
/// Writers `append` at the end; the reader inspects `unread()` and moves
/// the cursor forward with `advance()`. Once more than half the stored
/// bytes have been consumed, the buffer compacts itself by shifting the
/// unconsumed tail down and discarding the prefix.
///
/// The buffer also carries the `Finality` flag for its half of the stream.
/// Once the flag leaves `Open` it never changes again and nothing further
/// is appended.
#[derive(Debug)]
pub struct ByteBuf {
    data: Vec<u8>,
    consumed: usize,
    finality: Finality,
}

impl Default for ByteBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl ByteBuf {
    pub fn new() -> Self {
        ByteBuf {
            data: Vec::new(),
            consumed: 0,
            finality: Finality::Open,
        }
    }

    /// The bytes that have been appended but not yet consumed.
    pub fn unread(&self) -> &[u8] {
        &self.data[self.consumed..]
    }

    pub fn has_unread(&self) -> bool {
        self.consumed < self.data.len()
    }

    /// Whether every appended byte has been consumed.
    pub fn is_drained(&self) -> bool {
        self.consumed == self.data.len()
    }

    /// Appends `bytes` at the end of the buffer.
    pub fn append(&mut self, bytes: &[u8]) {
        debug_assert!(self.finality.is_open());
        self.data.extend_from_slice(bytes);
    }

    /// Moves the consumed cursor forward by `n` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `n` exceeds the unread length; that is always a caller
    /// bug, never a wire condition.
    pub fn advance(&mut self, n: usize) {
        assert!(
            n <= self.data.len() - self.consumed,
            "advanced past the end of the buffer",
        );
        self.consumed += n;
        self.compact();
    }

    /// Discards the consumed prefix if it has grown past half the buffer.
    ///
    /// Called internally by `advance()`; harmless to call at any time.
    pub fn compact(&mut self) {
        if self.consumed > self.data.len() / 2 {
            let len = self.data.len();
            self.data.copy_within(self.consumed..len, 0);
            self.data.truncate(len - self.consumed);
            self.consumed = 0;
        }
    }

    /// Reads up to `hint` bytes from `src`, appending whatever arrives.
    ///
    /// The error from `src` is returned verbatim; the buffer is unchanged
    /// on error.
    pub fn read_from(
        &mut self,
        src: &mut impl Read,
        hint: usize,
    ) -> io::Result<usize> {
        debug_assert!(self.finality.is_open());

        let old_len = self.data.len();
        self.data.resize(old_len + hint, 0);
        let result = src.read(&mut self.data[old_len..]);
        let appended = *result.as_ref().unwrap_or(&0);
        self.data.truncate(old_len + appended);
        result
    }

    pub fn finality(&self) -> Finality {
        self.finality
    }

    /// Marks the buffer's half of the stream terminated.
    ///
    /// The first non-`Open` value sticks; later calls are ignored.
    pub fn set_finality(&mut self, finality: Finality) {
        if self.finality.is_open() {
            self.finality = finality;
        }
    }
}

/// Default number of body bytes held in memory before spilling to disk.
pub const DEFAULT_SPILL_THRESHOLD: usize = 65536;

/// Write-once-read-once spool for a message body.
///
/// Bodies below the threshold live in memory; larger ones are written
/// through to an unlinked temporary file in the configured directory.
pub struct BodyWriter {
    tmp_dir: PathBuf,
    spill_threshold: usize,
    buf: Vec<u8>,
    len: u64,
    file: Option<fs::File>,
}

pub struct BodyReader {
    buf: Vec<u8>,
    off: usize,
    len: u64,
    file: Option<fs::File>,
}

impl BodyWriter {
    /// Creates a new, empty spool.
    pub fn new(tmp_dir: PathBuf, spill_threshold: usize) -> Self {
        BodyWriter {
            tmp_dir,
            spill_threshold,
            buf: Vec::new(),
            len: 0,
            file: None,
        }
    }

    /// Returns the length, in bytes, of the body written so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len
    }

    /// "Flips" the spool, making it readable from the start.
    pub fn flip(mut self) -> io::Result<BodyReader> {
        if let Some(ref mut file) = self.file {
            file.seek(io::SeekFrom::Start(0))?;
        }

        Ok(BodyReader {
            buf: self.buf,
            off: 0,
            len: self.len,
            file: self.file,
        })
    }
}

impl Write for BodyWriter {
    fn write(&mut self, src: &[u8]) -> io::Result<usize> {
        if self.file.is_none()
            && src.len() + self.buf.len() > self.spill_threshold
        {
            let spill = mem::take(&mut self.buf);
            self.file = Some(tempfile::tempfile_in(&self.tmp_dir)?);
            self.len = 0;
            self.write_all(&spill)?;
        }

        if let Some(ref mut file) = self.file {
            file.write_all(src)?;
        } else {
            self.buf.extend_from_slice(src);
        }

        self.len += src.len() as u64;

        Ok(src.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl BodyReader {
    /// Directly create a `BodyReader` from the given data.
    ///
    /// Mainly used for testing.
    pub fn new(data: Vec<u8>) -> Self {
        BodyReader {
            len: data.len() as u64,
            buf: data,
            off: 0,
            file: None,
        }
    }

    /// Returns the length, in bytes, of the body.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        0 == self.len
    }
}

impl Read for BodyReader {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if let Some(ref mut file) = self.file {
            file.read(dst)
        } else {
            let len = dst.len().min(self.buf.len() - self.off);
            dst[..len].copy_from_slice(&self.buf[self.off..self.off + len]);
            self.off += len;
            Ok(len)
        }
    }
}
