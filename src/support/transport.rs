//-
// Copyright (c) 2024, 2025, Jason Lingle
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

//! The buffered transport layer between the protocol engines and the
//! outside world.
//!
//! The engines only ever touch a pair of `ByteBuf`s. `BufferedTransport`
//! binds those buffers to a `SessionIo` source/sink: `fetch` appends
//! incoming bytes to the input buffer and `flush` drains the output buffer
//! to the sink. Blocking handles, non-blocking handles, in-memory pipes and
//! TLS wrappers all fit behind `SessionIo`; the engines cannot tell them
//! apart.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io;
use std::net;
use std::os::unix::net::UnixStream;
use std::rc::Rc;

use super::buffer::{ByteBuf, Finality};

/// Default number of bytes `fetch` asks the source for.
pub const DEFAULT_FETCH_HINT: usize = 65536;

/// A raw byte source/sink a `BufferedTransport` binds to.
///
/// Non-blocking implementations report `WouldBlock` when no progress is
/// possible; a TLS implementation multiplexes its handshake records across
/// `read`/`write` and is otherwise indistinguishable to the engines.
pub trait SessionIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Closes the write half, signalling EOF to the peer.
    ///
    /// Transports with no notion of half-close may ignore this.
    fn shutdown_write(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SessionIo for net::TcpStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(self, buf)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown(net::Shutdown::Write)
    }
}

impl SessionIo for UnixStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        io::Read::read(self, buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::Write::write(self, buf)
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.shutdown(net::Shutdown::Write)
    }
}

/// The buffered byte interface the protocol engines drive.
pub trait Transport {
    /// Reads from the underlying source, appending to the input buffer.
    ///
    /// Returns the number of bytes appended. A true zero-byte read marks
    /// the input `Eof`; transient conditions (`Interrupted`, `WouldBlock`)
    /// return 0 without changing finality; other errors mark the input
    /// `Error` and return 0.
    fn fetch(&mut self, hint: Option<usize>) -> usize;

    /// Writes pending output to the sink, dropping the flushed bytes.
    ///
    /// Returns the number of bytes written. With `eof`, once the output
    /// buffer drains the transport write-shuts-down the sink and the
    /// output finality becomes `Eof`; if bytes remain, the shutdown is
    /// deferred to the next `flush` that drains.
    fn flush(&mut self, eof: bool) -> usize;

    fn input(&mut self) -> &mut ByteBuf;
    fn output(&mut self) -> &mut ByteBuf;
    fn input_finality(&self) -> Finality;
    fn output_finality(&self) -> Finality;
}

/// Adapts a `SessionIo`'s `read` to `std::io::Read` for `ByteBuf::read_from`.
struct SessionIoReader<'a, S: ?Sized>(&'a mut S);

impl<S: SessionIo + ?Sized> io::Read for SessionIoReader<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock,
    )
}

/// The standard `Transport`: a pair of `ByteBuf`s bound to a `SessionIo`.
pub struct BufferedTransport<S> {
    io: S,
    input: ByteBuf,
    output: ByteBuf,
    shutdown_on_drain: bool,
}

impl<S: SessionIo> BufferedTransport<S> {
    pub fn new(io: S) -> Self {
        BufferedTransport {
            io,
            input: ByteBuf::new(),
            output: ByteBuf::new(),
            shutdown_on_drain: false,
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.io
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.io
    }
}

impl<S: SessionIo> Transport for BufferedTransport<S> {
    fn fetch(&mut self, hint: Option<usize>) -> usize {
        let hint = hint.unwrap_or(DEFAULT_FETCH_HINT);
        if 0 == hint || !self.input.finality().is_open() {
            return 0;
        }

        match self
            .input
            .read_from(&mut SessionIoReader(&mut self.io), hint)
        {
            Ok(0) => {
                self.input.set_finality(Finality::Eof);
                0
            },
            Ok(n) => n,
            Err(ref e) if is_transient(e) => 0,
            Err(e) => {
                self.input.set_finality(Finality::Error(e.kind()));
                0
            },
        }
    }

    fn flush(&mut self, eof: bool) -> usize {
        if eof {
            self.shutdown_on_drain = true;
        }

        let mut flushed = 0;
        while self.output.finality().is_open() && self.output.has_unread() {
            match self.io.write(self.output.unread()) {
                Ok(0) => break,
                Ok(n) => {
                    self.output.advance(n);
                    flushed += n;
                },
                Err(ref e) if is_transient(e) => break,
                Err(e) => {
                    self.output.set_finality(Finality::Error(e.kind()));
                    return flushed;
                },
            }
        }

        if self.shutdown_on_drain
            && self.output.is_drained()
            && self.output.finality().is_open()
        {
            // Shutdown failures on non-socket sinks are not session errors.
            let _ = self.io.shutdown_write();
            self.output.set_finality(Finality::Eof);
        }

        flushed
    }

    fn input(&mut self) -> &mut ByteBuf {
        &mut self.input
    }

    fn output(&mut self) -> &mut ByteBuf {
        &mut self.output
    }

    fn input_finality(&self) -> Finality {
        self.input.finality()
    }

    fn output_finality(&self) -> Finality {
        self.output.finality()
    }
}

/// Creates a connected pair of in-memory byte pipes.
///
/// Bytes written to one end become readable at the other. The pipes are
/// single-threaded (the engines are cooperative); a read from an empty,
/// open pipe reports `WouldBlock`, a read from a closed, drained pipe
/// reports EOF, and a write to a closed pipe reports `BrokenPipe`.
pub fn pipe() -> (PipeIo, PipeIo) {
    let a = Rc::new(RefCell::new(PipeHalf::default()));
    let b = Rc::new(RefCell::new(PipeHalf::default()));
    (
        PipeIo {
            incoming: Rc::clone(&a),
            outgoing: Rc::clone(&b),
        },
        PipeIo {
            incoming: b,
            outgoing: a,
        },
    )
}

#[derive(Default)]
struct PipeHalf {
    data: VecDeque<u8>,
    closed: bool,
}

/// One end of an in-memory pipe pair; see `pipe()`.
pub struct PipeIo {
    incoming: Rc<RefCell<PipeHalf>>,
    outgoing: Rc<RefCell<PipeHalf>>,
}

impl SessionIo for PipeIo {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut half = self.incoming.borrow_mut();
        if half.data.is_empty() {
            return if half.closed {
                Ok(0)
            } else {
                Err(io::ErrorKind::WouldBlock.into())
            };
        }

        let n = buf.len().min(half.data.len());
        for slot in &mut buf[..n] {
            *slot = half.data.pop_front().unwrap_or(0);
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut half = self.outgoing.borrow_mut();
        if half.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }

        half.data.extend(buf);
        Ok(buf.len())
    }

    fn shutdown_write(&mut self) -> io::Result<()> {
        self.outgoing.borrow_mut().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    /// Wraps a `PipeIo`, accepting only `budget` bytes until topped up.
    struct Throttled {
        io: PipeIo,
        budget: usize,
    }

    impl SessionIo for Throttled {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.io.read(buf)
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if 0 == self.budget {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let n = buf.len().min(self.budget);
            let written = self.io.write(&buf[..n])?;
            self.budget -= written;
            Ok(written)
        }

        fn shutdown_write(&mut self) -> io::Result<()> {
            self.io.shutdown_write()
        }
    }

    #[test]
    fn fetch_moves_bytes_and_reports_eof() {
        let (a, mut b) = pipe();
        let mut transport = BufferedTransport::new(a);

        // Nothing to read yet; WouldBlock leaves the input open.
        assert_eq!(0, transport.fetch(None));
        assert!(transport.input_finality().is_open());

        b.write(b"220 hi\r\n").unwrap();
        assert_eq!(8, transport.fetch(None));
        assert_eq!(b"220 hi\r\n", transport.input().unread());

        b.shutdown_write().unwrap();
        assert_eq!(0, transport.fetch(None));
        assert!(transport.input_finality().is_eof());
    }

    #[test]
    fn flush_moves_bytes() {
        let (a, mut b) = pipe();
        let mut transport = BufferedTransport::new(a);

        transport.output().append(b"EHLO x\r\n");
        assert_eq!(8, transport.flush(false));
        assert!(transport.output().is_drained());
        assert!(transport.output_finality().is_open());

        let mut read_buf = [0u8; 16];
        assert_eq!(8, b.read(&mut read_buf).unwrap());
        assert_eq!(b"EHLO x\r\n", &read_buf[..8]);
    }

    #[test]
    fn flush_eof_shuts_down_once_drained() {
        let (a, mut b) = pipe();
        let mut transport = BufferedTransport::new(a);

        transport.output().append(b"221 bye\r\n");
        transport.flush(true);
        assert!(transport.output_finality().is_eof());

        let mut read_buf = [0u8; 16];
        assert_eq!(9, b.read(&mut read_buf).unwrap());
        // Drained and closed: the peer now sees EOF.
        assert_eq!(0, b.read(&mut read_buf).unwrap());
    }

    #[test]
    fn flush_eof_deferred_until_drained() {
        let (a, _b) = pipe();
        let mut transport = BufferedTransport::new(Throttled {
            io: a,
            budget: 0,
        });

        transport.output().append(b"221 bye\r\n");
        assert_eq!(0, transport.flush(true));
        // Not drained, so the shutdown is deferred.
        assert!(transport.output_finality().is_open());

        transport.get_mut().budget = 4;
        assert_eq!(4, transport.flush(false));
        assert!(transport.output_finality().is_open());

        transport.get_mut().budget = 100;
        assert_eq!(5, transport.flush(false));
        assert!(transport.output_finality().is_eof());
    }

    #[test]
    fn write_after_peer_close_is_fatal() {
        let (a, mut b) = pipe();
        let mut transport = BufferedTransport::new(a);

        // Closing b's *read* side is modelled by closing a's outgoing half
        // from the other end: shut down b's incoming by dropping it is not
        // possible, so close via the peer's shutdown of its read mirror.
        b.incoming.borrow_mut().closed = true;

        transport.output().append(b"MAIL FROM:<>\r\n");
        assert_eq!(0, transport.flush(false));
        assert_eq!(
            Finality::Error(io::ErrorKind::BrokenPipe),
            transport.output_finality(),
        );
    }
}
