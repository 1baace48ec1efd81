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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A malformed command or response.
    ///
    /// `code` is the SMTP numeric code the server half replies with.
    #[error("{message}")]
    Grammar { code: u16, message: String },
    /// The stream ended while the session was still in progress.
    #[error("Connection closed before the session completed")]
    UnexpectedEof,
    /// The source or sink failed fatally.
    #[error("Transport failure: {0:?}")]
    Transport(io::ErrorKind),
    /// An engine method was called in a session state that forbids it.
    ///
    /// This is a synchronous failure at the call site, never a wire event.
    #[error("{0} is not legal in the current session state")]
    BadCallState(&'static str),
    /// `end_data` was called somewhere other than a line boundary.
    #[error("Mail data ended with an incomplete line")]
    IncompleteMailData,
    #[error(transparent)]
    Io(#[from] io::Error),
}
