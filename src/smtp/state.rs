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

//! The session state vocabulary shared by both engines.

/// The overall state of one SMTP session.
///
/// Both engines walk the same state set: the server advances when it
/// accepts a command, the client when it correlates a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// No bytes exchanged yet.
    Connect,
    /// Greeting sent/received; awaiting HELO or EHLO.
    Handshake,
    /// The greeting was a rejection; only QUIT is permitted.
    Reject,
    /// Handshake complete; MAIL may be issued.
    Ready,
    /// MAIL accepted; RCPT and DATA are permitted.
    Mail,
    /// DATA accepted; body bytes are flowing.
    Data,
    /// The body terminator was seen; awaiting the final response.
    DataComplete,
    /// Graceful termination issued.
    Quit,
    /// Unrecoverable; the connection must be torn down.
    Abort,
}

impl SessionState {
    /// Whether the session can make no further progress.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Quit | SessionState::Abort)
    }
}

use SessionState::*;

// The states in which each verb is accepted. Out-of-state commands draw
// 503 from the server and a `BadCallState` error from the client.
pub(crate) static HELO_STATES: &[SessionState] = &[Handshake, Ready, Mail, Data];
pub(crate) static MAIL_STATES: &[SessionState] = &[Ready];
pub(crate) static RCPT_STATES: &[SessionState] = &[Mail];
pub(crate) static DATA_STATES: &[SessionState] = &[Mail];
pub(crate) static RSET_STATES: &[SessionState] = &[Handshake, Ready, Mail];
pub(crate) static NOOP_STATES: &[SessionState] = &[Handshake, Ready, Mail];
pub(crate) static QUIT_STATES: &[SessionState] = &[Handshake, Reject, Ready, Mail];
