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

//! The DATA framing codec.
//!
//! Outgoing bodies are dot-stuffed: an extra `.` is inserted at the start
//! of any line that begins with `.`, so that the `<CRLF>.<CRLF>` terminator
//! stays unambiguous. Line terminators are normalised to CRLF along the
//! way, no matter how the caller fragments its writes.
//!
//! Incoming bodies are processed a whole line at a time: stuffed dots are
//! stripped, the terminator line ends the body, and everything else is
//! delivered to the transaction's body sink byte-for-byte.

use std::io::{self, Write};

use memchr::{memchr, memchr2};

use crate::support::buffer::ByteBuf;
use crate::support::error::Error;

/// Line position of the outgoing encoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum LineState {
    StartOfLine,
    MidLine,
    /// A CR has been seen but not yet emitted; its fate depends on the
    /// next byte.
    SawCr,
}

/// Encodes an outgoing message body for the DATA phase.
///
/// Feeding the body in any partition of chunks produces the same byte
/// stream as feeding it whole.
pub struct DataEncoder {
    line_state: LineState,
}

impl Default for DataEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DataEncoder {
    pub fn new() -> Self {
        DataEncoder {
            line_state: LineState::StartOfLine,
        }
    }

    /// Whether the body encoded so far ends on a line boundary.
    pub fn at_line_start(&self) -> bool {
        LineState::StartOfLine == self.line_state
    }

    /// Encodes `input`, appending the stuffed form to `out`.
    pub fn encode(&mut self, input: &[u8], out: &mut ByteBuf) {
        let mut input = input;
        while !input.is_empty() {
            match self.line_state {
                LineState::SawCr => {
                    // The withheld CR's line is over either way; emit the
                    // full terminator and re-process anything that wasn't
                    // its LF.
                    out.append(b"\r\n");
                    self.line_state = LineState::StartOfLine;
                    if b'\n' == input[0] {
                        input = &input[1..];
                    }
                },

                LineState::StartOfLine => match input[0] {
                    b'.' => {
                        out.append(b"..");
                        self.line_state = LineState::MidLine;
                        input = &input[1..];
                    },
                    b'\r' => {
                        self.line_state = LineState::SawCr;
                        input = &input[1..];
                    },
                    b'\n' => {
                        out.append(b"\r\n");
                        input = &input[1..];
                    },
                    _ => {
                        // Plain text; the MidLine arm bulk-copies it.
                        self.line_state = LineState::MidLine;
                    },
                },

                LineState::MidLine => match memchr2(b'\r', b'\n', input) {
                    None => {
                        out.append(input);
                        input = &[];
                    },
                    Some(ix) => {
                        out.append(&input[..ix]);
                        if b'\r' == input[ix] {
                            self.line_state = LineState::SawCr;
                        } else {
                            out.append(b"\r\n");
                            self.line_state = LineState::StartOfLine;
                        }
                        input = &input[ix + 1..];
                    },
                },
            }
        }
    }

    /// Appends the end-of-data terminator.
    ///
    /// The body must end on a line boundary; anything else is a caller
    /// bug surfaced as `IncompleteMailData`.
    pub fn finish(&mut self, out: &mut ByteBuf) -> Result<(), Error> {
        if !self.at_line_start() {
            return Err(Error::IncompleteMailData);
        }

        out.append(b".\r\n");
        Ok(())
    }

    /// Appends the end-of-data terminator, first completing any partial
    /// final line.
    ///
    /// Used for preloaded bodies, where an unterminated final line is
    /// closed rather than rejected.
    pub fn terminate(&mut self, out: &mut ByteBuf) {
        match self.line_state {
            LineState::StartOfLine => (),
            LineState::MidLine | LineState::SawCr => out.append(b"\r\n"),
        }
        self.line_state = LineState::StartOfLine;
        out.append(b".\r\n");
    }
}

/// Result of one decoder pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// More body lines may follow.
    Pending,
    /// The terminator line was consumed; the body is complete.
    Finished,
}

/// Decodes the incoming DATA stream.
///
/// Operates on the input buffer a whole line at a time, leaving any
/// partial trailing line for a later fetch.
pub struct DataDecoder {
    delivered: u64,
}

impl Default for DataDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl DataDecoder {
    pub fn new() -> Self {
        DataDecoder { delivered: 0 }
    }

    /// Total decoded bytes delivered to the sink so far.
    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Consumes as many complete lines from `input` as are buffered,
    /// delivering their decoded form to `sink`.
    pub fn decode(
        &mut self,
        input: &mut ByteBuf,
        sink: &mut impl Write,
    ) -> io::Result<DecodeOutcome> {
        loop {
            let line_len = match memchr(b'\n', input.unread()) {
                None => return Ok(DecodeOutcome::Pending),
                Some(ix) => ix + 1,
            };

            let line = &input.unread()[..line_len];
            if b".\r\n" == line || b".\n" == line {
                input.advance(line_len);
                return Ok(DecodeOutcome::Finished);
            }

            // A stuffed dot is stripped; the terminator is preserved.
            let payload = if line.starts_with(b".") { &line[1..] } else { line };
            sink.write_all(payload)?;
            self.delivered += payload.len() as u64;
            input.advance(line_len);
        }
    }
}
