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

//! The client half of an SMTP session.
//!
//! `ClientEngine` renders commands into its output buffer and correlates
//! responses to requests purely by position: the pending queue is FIFO,
//! seeded with a sentinel entry that absorbs the server's initial
//! greeting. Completions are surfaced as engine-owned values the caller
//! drains with `next_completed`; the engine holds no pointers into caller
//! state.

use std::collections::{BTreeMap, VecDeque};

use log::{info, warn};

use super::config::{EhloValue, SmtpConfig};
use super::data::DataEncoder;
use super::route::EnvelopeRoute;
use super::state::SessionState;
use super::syntax::{self, Command, Response};
use crate::support::buffer::Finality;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::transport::Transport;

/// Identifies one queued request, for correlating completions.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

/// A finished request: the response that answered it, or the error that
/// ended it.
#[derive(Debug)]
pub struct CompletedRequest {
    pub id: RequestId,
    /// The command this answers; `None` for the server greeting.
    pub command: Option<Command>,
    pub result: Result<Response, Error>,
}

struct PendingRequest {
    id: RequestId,
    command: Option<Command>,
    /// Body to stream automatically once DATA draws its 354.
    body: Option<Vec<u8>>,
    /// The entry was re-queued after the 354 and now awaits the final
    /// response.
    awaiting_final: bool,
}

/// The client half of an SMTP session, bound to a transport.
pub struct ClientEngine<T> {
    transport: T,
    config: SmtpConfig,
    log_prefix: LogPrefix,
    state: SessionState,
    pending: VecDeque<PendingRequest>,
    completed: VecDeque<CompletedRequest>,
    encoder: DataEncoder,
    server_greeting: Option<String>,
    server_helo: Option<String>,
    server_ehlo_keywords: BTreeMap<String, EhloValue>,
    next_id: u64,
}

impl<T: Transport> ClientEngine<T> {
    pub fn new(transport: T, config: SmtpConfig) -> Self {
        let log_prefix = LogPrefix::new("smtp-client".to_owned());
        if !config.server_address.is_empty() {
            log_prefix.set_peer(config.server_address.clone());
        }

        // The sentinel that absorbs the server's initial greeting.
        let mut pending = VecDeque::new();
        pending.push_back(PendingRequest {
            id: RequestId(0),
            command: None,
            body: None,
            awaiting_final: false,
        });

        ClientEngine {
            transport,
            config,
            log_prefix,
            state: SessionState::Connect,
            pending,
            completed: VecDeque::new(),
            encoder: DataEncoder::new(),
            server_greeting: None,
            server_helo: None,
            server_ehlo_keywords: BTreeMap::new(),
            next_id: 1,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The greeting text, once the 220 has arrived. Multi-line greetings
    /// are joined with `\n`.
    pub fn server_greeting(&self) -> Option<&str> {
        self.server_greeting.as_deref()
    }

    /// The name the server announced in its HELO/EHLO reply.
    pub fn server_helo(&self) -> Option<&str> {
        self.server_helo.as_deref()
    }

    /// Keywords harvested from the EHLO response.
    pub fn server_ehlo_keywords(&self) -> &BTreeMap<String, EhloValue> {
        &self.server_ehlo_keywords
    }

    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    /// The next finished request, in issue order.
    pub fn next_completed(&mut self) -> Option<CompletedRequest> {
        self.completed.pop_front()
    }

    /// Sends HELO. `domain` defaults from the configuration.
    pub fn helo(&mut self, domain: Option<&str>) -> Result<RequestId, Error> {
        let domain = self.helo_argument(domain);
        self.submit(Command::Helo(domain), None)
    }

    /// Sends EHLO. `domain` defaults from the configuration.
    pub fn ehlo(&mut self, domain: Option<&str>) -> Result<RequestId, Error> {
        let domain = self.helo_argument(domain);
        self.submit(Command::Ehlo(domain), None)
    }

    pub fn mail_from(
        &mut self,
        reverse_path: EnvelopeRoute,
    ) -> Result<RequestId, Error> {
        self.submit(Command::MailFrom(reverse_path), None)
    }

    pub fn rcpt_to(
        &mut self,
        forward_path: EnvelopeRoute,
    ) -> Result<RequestId, Error> {
        self.submit(Command::RcptTo(forward_path), None)
    }

    /// Sends DATA. On the 354 the caller streams the body itself with
    /// `write_data`/`end_data`.
    pub fn data(&mut self) -> Result<RequestId, Error> {
        self.submit(Command::Data, None)
    }

    /// Sends DATA with a preloaded body, streamed automatically when the
    /// server answers 354. The completion carries the final response.
    pub fn send_message(
        &mut self,
        body: impl Into<Vec<u8>>,
    ) -> Result<RequestId, Error> {
        self.submit(Command::Data, Some(body.into()))
    }

    pub fn rset(&mut self) -> Result<RequestId, Error> {
        self.submit(Command::Rset, None)
    }

    pub fn noop(&mut self) -> Result<RequestId, Error> {
        self.submit(Command::Noop, None)
    }

    pub fn quit(&mut self) -> Result<RequestId, Error> {
        self.submit(Command::Quit, None)
    }

    fn helo_argument(&self, domain: Option<&str>) -> String {
        match domain {
            Some(domain) => domain.to_owned(),
            None => self.config.effective_client_helo().to_owned(),
        }
    }

    fn submit(
        &mut self,
        command: Command,
        body: Option<Vec<u8>>,
    ) -> Result<RequestId, Error> {
        let spec = command.spec();
        if !spec.legal_in(self.state) {
            return Err(Error::BadCallState(spec.name));
        }

        info!("{} >> {}", self.log_prefix, spec.name);
        command.render(self.transport.output());

        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.pending.push_back(PendingRequest {
            id,
            command: Some(command),
            body,
            awaiting_final: false,
        });

        // Allow synchronous progress when the transport is blocking.
        self.handle_io()?;
        Ok(id)
    }

    /// Streams body bytes during the DATA phase.
    ///
    /// Chunks may be arbitrarily fragmented; dot-stuffing and terminator
    /// normalisation come out right regardless of where the boundaries
    /// fall.
    pub fn write_data(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if SessionState::Data != self.state {
            return Err(Error::BadCallState("write_data"));
        }

        self.encoder.encode(bytes, self.transport.output());
        self.transport.flush(false);
        Ok(())
    }

    /// Terminates the DATA phase. The body must end on a line boundary.
    ///
    /// Returns the request that will complete with the server's final
    /// verdict on the message.
    pub fn end_data(&mut self) -> Result<RequestId, Error> {
        if SessionState::Data != self.state {
            return Err(Error::BadCallState("end_data"));
        }

        self.encoder.finish(self.transport.output())?;
        self.state = SessionState::DataComplete;

        let id = RequestId(self.next_id);
        self.next_id += 1;
        self.pending.push_back(PendingRequest {
            id,
            command: Some(Command::Data),
            body: None,
            awaiting_final: true,
        });

        self.transport.flush(false);
        self.handle_io()?;
        Ok(id)
    }

    /// Drives the session as far as the buffered bytes allow.
    ///
    /// Returns whether any forward progress was made.
    pub fn handle_io(&mut self) -> Result<bool, Error> {
        let mut progress = false;

        if self.transport.flush(false) > 0 {
            progress = true;
        }

        if !self.pending.is_empty() {
            if self.transport.fetch(None) > 0 {
                progress = true;
            }

            while !self.pending.is_empty() {
                match syntax::parse_response(self.transport.input()) {
                    None => {
                        if self.transport.input_finality().is_open() {
                            break;
                        }

                        // EOF or failure with requests outstanding: the
                        // head request can never complete.
                        let Some(entry) = self.pending.pop_front() else {
                            break;
                        };
                        let error = match self.transport.input_finality() {
                            Finality::Error(kind) => Error::Transport(kind),
                            _ => Error::UnexpectedEof,
                        };
                        self.completed.push_back(CompletedRequest {
                            id: entry.id,
                            command: entry.command,
                            result: Err(error),
                        });
                        progress = true;
                    },

                    Some(Err(e)) => {
                        warn!(
                            "{} Malformed response: {}",
                            self.log_prefix, e.message,
                        );
                        let Some(entry) = self.pending.pop_front() else {
                            break;
                        };
                        self.completed.push_back(CompletedRequest {
                            id: entry.id,
                            command: entry.command,
                            result: Err(e.into()),
                        });
                        self.state = SessionState::Abort;
                        progress = true;
                        break;
                    },

                    Some(Ok(response)) => {
                        progress = true;
                        self.process_response(response);
                    },
                }
            }
        }

        if let Finality::Error(kind) = self.transport.output_finality() {
            self.state = SessionState::Abort;
            return Err(Error::Transport(kind));
        }
        if let Finality::Error(kind) = self.transport.input_finality() {
            self.state = SessionState::Abort;
            return Err(Error::Transport(kind));
        }

        if self.transport.input_finality().is_eof()
            && !self.transport.input().has_unread()
            && !self.state.is_terminal()
        {
            self.state = SessionState::Abort;
            progress = true;
        }

        Ok(progress)
    }

    fn process_response(&mut self, response: Response) {
        let Some(mut entry) = self.pending.pop_front() else {
            return;
        };

        let requeued = self.update_state(&mut entry, &response);
        if requeued {
            self.pending.push_front(entry);
        } else {
            info!("{} << {}", self.log_prefix, response.code);
            self.completed.push_back(CompletedRequest {
                id: entry.id,
                command: entry.command,
                result: Ok(response),
            });
        }
    }

    /// Applies the state transition `response` calls for. Returns whether
    /// the entry was re-queued to await a further response.
    fn update_state(
        &mut self,
        entry: &mut PendingRequest,
        response: &Response,
    ) -> bool {
        if 421 == response.code {
            // Server-initiated shutdown.
            warn!("{} Server requested shutdown", self.log_prefix);
            self.state = SessionState::Quit;
            return false;
        }

        match entry.command {
            None => {
                if 220 == response.code {
                    self.server_greeting = Some(response.lines.join("\n"));
                    self.state = SessionState::Handshake;
                } else {
                    warn!(
                        "{} Greeting rejected with {}",
                        self.log_prefix, response.code,
                    );
                    self.state = SessionState::Reject;
                }
            },

            Some(Command::Helo(_)) | Some(Command::Ehlo(_)) => {
                if 250 == response.code {
                    self.server_helo = response.lines.first().cloned();
                    if let Some(Command::Ehlo(_)) = entry.command {
                        self.harvest_ehlo_keywords(&response.lines[1..]);
                    }
                    self.state = SessionState::Ready;
                }
            },

            Some(Command::MailFrom(_)) => {
                if 250 == response.code {
                    self.state = SessionState::Mail;
                }
            },

            Some(Command::RcptTo(_)) => {},

            Some(Command::Data) => {
                if entry.awaiting_final {
                    self.state = SessionState::Ready;
                } else if 354 == response.code
                    && SessionState::Mail == self.state
                {
                    self.state = SessionState::Data;
                    self.encoder = DataEncoder::new();

                    if let Some(body) = entry.body.take() {
                        // Preloaded body: stream it whole and hold the
                        // entry for the final response.
                        self.encoder
                            .encode(&body, self.transport.output());
                        self.encoder.terminate(self.transport.output());
                        entry.awaiting_final = true;
                        self.state = SessionState::DataComplete;
                        self.transport.flush(false);
                        return true;
                    }
                }
            },

            Some(Command::Rset) => {
                if 250 == response.code {
                    self.state = if self.server_helo.is_some() {
                        SessionState::Ready
                    } else {
                        SessionState::Handshake
                    };
                }
            },

            Some(Command::Noop) => {},

            Some(Command::Quit) => {
                if 221 == response.code {
                    self.state = SessionState::Quit;
                    // Answer the server's half-close with our own.
                    self.transport.flush(true);
                }
            },
        }

        false
    }

    fn harvest_ehlo_keywords(&mut self, lines: &[String]) {
        self.server_ehlo_keywords.clear();
        for line in lines {
            match line.split_once(' ') {
                None => {
                    self.server_ehlo_keywords.insert(
                        line.clone(),
                        EhloValue::Value(String::new()),
                    );
                },
                Some((keyword, params)) => {
                    self.server_ehlo_keywords.insert(
                        keyword.to_owned(),
                        EhloValue::Value(params.to_owned()),
                    );
                },
            }
        }
    }
}
