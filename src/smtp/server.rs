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

//! The server half of an SMTP session.
//!
//! `ServerEngine` owns no socket: it parses whatever is in its transport's
//! input buffer, dispatches by session state, and renders responses into
//! the output buffer. The surrounding driver moves bytes whenever its own
//! event source says the connection is ready, then calls `handle_io` again.

use log::{info, warn};

use super::codes::*;
use super::config::SmtpConfig;
use super::data::{DataDecoder, DecodeOutcome};
use super::route::EnvelopeRoute;
use super::state::SessionState;
use super::syntax::{self, Command, CommandTable, ParsedCommand, Response};
use super::transaction::Transaction;
use crate::support::buffer::Finality;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::transport::Transport;

/// Reply returned by a transaction handler.
pub struct Reply {
    pub code: u16,
    pub text: String,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Reply {
            code,
            text: text.into(),
        }
    }
}

/// Details of an accepted HELO/EHLO, passed to the handshake listener.
pub struct HandshakeInfo<'a> {
    /// The name the client announced.
    pub client_helo: &'a str,
    /// Whether the extended form (EHLO) was used.
    pub extended: bool,
}

type HandshakeListener = Box<dyn FnMut(&HandshakeInfo<'_>)>;
type TransactionHandler = Box<dyn FnMut(Transaction) -> Reply>;

/// The server half of an SMTP session, bound to a transport.
pub struct ServerEngine<T> {
    transport: T,
    config: SmtpConfig,
    table: CommandTable,
    log_prefix: LogPrefix,
    state: SessionState,
    reject_greeting: Option<String>,
    client_helo: Option<String>,
    transaction: Option<Transaction>,
    decoder: DataDecoder,
    discarding_line: bool,
    on_handshake: Option<HandshakeListener>,
    on_transaction: Option<TransactionHandler>,
}

enum NextCommand {
    /// No complete line buffered.
    Incomplete,
    /// Bytes were consumed or an error response sent; nothing to dispatch.
    Progress,
    Command(ParsedCommand),
}

impl<T: Transport> ServerEngine<T> {
    pub fn new(transport: T, config: SmtpConfig) -> Self {
        Self::with_table(transport, config, CommandTable::full())
    }

    /// Creates the engine with a custom verb table; verbs absent from the
    /// table draw 502.
    pub fn with_table(
        transport: T,
        config: SmtpConfig,
        table: CommandTable,
    ) -> Self {
        let log_prefix = LogPrefix::new("smtp-server".to_owned());
        if !config.client_address.is_empty() {
            log_prefix.set_peer(config.client_address.clone());
        }

        ServerEngine {
            transport,
            config,
            table,
            log_prefix,
            state: SessionState::Connect,
            reject_greeting: None,
            client_helo: None,
            transaction: None,
            decoder: DataDecoder::new(),
            discarding_line: false,
            on_handshake: None,
            on_transaction: None,
        }
    }

    /// Makes the greeting a 554 rejection. The session then accepts only
    /// QUIT.
    pub fn reject_all(mut self, message: impl Into<String>) -> Self {
        self.reject_greeting = Some(message.into());
        self
    }

    /// Registers a listener invoked after each accepted HELO/EHLO.
    pub fn on_handshake(
        &mut self,
        listener: impl FnMut(&HandshakeInfo<'_>) + 'static,
    ) {
        self.on_handshake = Some(Box::new(listener));
    }

    /// Registers the handler invoked with each completed transaction.
    ///
    /// The handler's reply answers the end-of-data; without one, every
    /// message draws 554.
    pub fn on_transaction(
        &mut self,
        handler: impl FnMut(Transaction) -> Reply + 'static,
    ) {
        self.on_transaction = Some(Box::new(handler));
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The transaction in progress, if MAIL has been accepted.
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    pub fn transport(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Drives the session as far as the buffered bytes allow.
    ///
    /// Returns whether any forward progress was made. Callers loop until
    /// quiescent, then wait for their transport to become ready again.
    pub fn handle_io(&mut self) -> Result<bool, Error> {
        let mut progress = false;

        if SessionState::Connect == self.state {
            self.send_greeting();
            progress = true;
        }

        if self.transport.flush(false) > 0 {
            progress = true;
        }
        if self.transport.fetch(None) > 0 {
            progress = true;
        }

        loop {
            if self.state.is_terminal() {
                break;
            }

            if SessionState::Data == self.state {
                if self.drive_data()? {
                    progress = true;
                }
                if SessionState::Data == self.state {
                    // Waiting for more of the body.
                    break;
                }
                continue;
            }

            match self.next_command() {
                NextCommand::Incomplete => break,
                NextCommand::Progress => progress = true,
                NextCommand::Command(parsed) => {
                    progress = true;
                    self.dispatch(parsed);
                },
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

        if self.transport.input_finality().is_eof() && !self.state.is_terminal()
        {
            warn!("{} Unexpected EOF from client", self.log_prefix);
            self.send_response(&Response::new(
                pc::BadSequenceOfCommands as u16,
                "Unexpected EOF, terminating connection",
            ));
            self.state = SessionState::Abort;
            progress = true;
        }

        Ok(progress)
    }

    fn send_greeting(&mut self) {
        match self.reject_greeting.take() {
            Some(message) => {
                info!("{} Rejecting connection", self.log_prefix);
                let response =
                    Response::new(pc::TransactionFailed as u16, &message);
                self.send_response(&response);
                self.state = SessionState::Reject;
            },
            None => {
                let greeting = self.config.greeting_line();
                let response =
                    Response::new(pc::ServiceReady as u16, &greeting);
                self.send_response(&response);
                self.state = SessionState::Handshake;
            },
        }
    }

    fn next_command(&mut self) -> NextCommand {
        if self.discarding_line {
            let unread_len = {
                let input = self.transport.input();
                match memchr::memchr(b'\n', input.unread()) {
                    Some(ix) => {
                        input.advance(ix + 1);
                        self.discarding_line = false;
                        return NextCommand::Progress;
                    },
                    None => input.unread().len(),
                }
            };

            if 0 == unread_len {
                return NextCommand::Incomplete;
            }
            self.transport.input().advance(unread_len);
            return NextCommand::Progress;
        }

        match syntax::parse_command(&self.table, self.transport.input()) {
            None => {
                let unread_len = self.transport.input().unread().len();
                if unread_len > self.config.line_length_limit as usize {
                    warn!("{} Over-long command line", self.log_prefix);
                    self.transport.input().advance(unread_len);
                    self.discarding_line = true;
                    self.send_response(&Response::new(
                        pc::CommandSyntaxError as u16,
                        "Command line too long",
                    ));
                    NextCommand::Progress
                } else {
                    NextCommand::Incomplete
                }
            },

            Some(Err(e)) => {
                warn!("{} Rejected command: {}", self.log_prefix, e.message);
                self.send_response(&Response::new(e.code as u16, &e.message));
                NextCommand::Progress
            },

            Some(Ok(parsed)) => NextCommand::Command(parsed),
        }
    }

    fn dispatch(&mut self, parsed: ParsedCommand) {
        for warning in &parsed.warnings {
            warn!("{} {}", self.log_prefix, warning);
        }

        if !parsed.command.spec().legal_in(self.state) {
            self.send_response(&Response::new(
                pc::BadSequenceOfCommands as u16,
                "Bad sequence of commands",
            ));
            return;
        }

        match parsed.command {
            Command::Helo(domain) => self.cmd_helo(domain, false),
            Command::Ehlo(domain) => self.cmd_helo(domain, true),
            Command::MailFrom(route) => self.cmd_mail(route),
            Command::RcptTo(route) => self.cmd_rcpt(route),
            Command::Data => self.cmd_data(),
            Command::Rset => self.cmd_rset(),
            Command::Noop => self.cmd_noop(),
            Command::Quit => self.cmd_quit(),
        }
    }

    fn cmd_helo(&mut self, domain: String, extended: bool) {
        self.log_prefix.set_helo(domain.clone());
        info!(
            "{} {}",
            self.log_prefix,
            if extended { "EHLO" } else { "HELO" },
        );

        self.transaction = None;
        if let Some(ref mut listener) = self.on_handshake {
            listener(&HandshakeInfo {
                client_helo: &domain,
                extended,
            });
        }
        self.client_helo = Some(domain);

        let mut lines = vec![self.config.effective_server_helo().to_owned()];
        if extended {
            for (keyword, value) in &self.config.server_ehlo_keywords {
                lines.push(value.render(keyword));
            }
        }

        self.send_response(&Response {
            code: pc::Ok as u16,
            lines,
        });
        self.state = SessionState::Ready;
    }

    fn cmd_mail(&mut self, reverse_path: EnvelopeRoute) {
        info!("{} Start mail transaction", self.log_prefix);
        self.transaction = Some(Transaction::new(
            &self.config,
            self.client_helo.as_deref(),
            reverse_path,
        ));
        self.send_response(&Response::new(pc::Ok as u16, "OK"));
        self.state = SessionState::Mail;
    }

    fn cmd_rcpt(&mut self, forward_path: EnvelopeRoute) {
        let accepted = match self.transaction {
            // MAIL is the only entry into the mail state, so the
            // transaction is always present here.
            None => false,
            Some(ref mut tx) => {
                if tx.forward_paths.len()
                    < self.config.recipient_limit as usize
                {
                    tx.forward_paths.push(forward_path);
                    true
                } else {
                    false
                }
            },
        };

        if accepted {
            self.send_response(&Response::new(pc::Ok as u16, "OK"));
        } else {
            self.send_response(&Response::new(
                pc::InsufficientStorage as u16,
                "Too many recipients",
            ));
        }
    }

    fn cmd_data(&mut self) {
        let has_recipients = self
            .transaction
            .as_ref()
            .is_some_and(|tx| !tx.forward_paths.is_empty());
        if !has_recipients {
            self.send_response(&Response::new(
                pc::TransactionFailed as u16,
                "No valid recipients",
            ));
            return;
        }

        info!("{} Begin data transfer", self.log_prefix);
        self.decoder = DataDecoder::new();
        // The 354 itself moves the state to Data.
        self.send_response(&Response::new(
            pc::StartMailInput as u16,
            "Go ahead",
        ));
    }

    fn cmd_rset(&mut self) {
        self.transaction = None;
        let next = if SessionState::Handshake == self.state {
            SessionState::Handshake
        } else {
            SessionState::Ready
        };
        self.send_response(&Response::new(pc::Ok as u16, "OK"));
        self.state = next;
    }

    fn cmd_noop(&mut self) {
        self.send_response(&Response::new(pc::Ok as u16, "OK"));
    }

    fn cmd_quit(&mut self) {
        info!("{} Quit", self.log_prefix);
        // The 221 flushes with EOF, closing our write half.
        self.send_response(&Response::new(
            pc::ServiceClosing as u16,
            "Goodbye",
        ));
        self.state = SessionState::Quit;
    }

    /// Feeds buffered body bytes through the decoder, completing the
    /// transaction if the terminator is reached.
    fn drive_data(&mut self) -> Result<bool, Error> {
        let outcome = {
            let ServerEngine {
                ref mut transport,
                ref mut transaction,
                ref mut decoder,
                ..
            } = *self;

            let Some(tx) = transaction.as_mut() else {
                // Unreachable through the state machine.
                self.state = SessionState::Abort;
                return Err(Error::BadCallState("DATA"));
            };

            let before = transport.input().unread().len();
            match decoder.decode(transport.input(), &mut tx.data) {
                Ok(outcome) => (
                    outcome,
                    before != transport.input().unread().len(),
                ),
                Err(e) => {
                    self.state = SessionState::Abort;
                    return Err(Error::Io(e));
                },
            }
        };

        match outcome {
            (DecodeOutcome::Pending, advanced) => Ok(advanced),
            (DecodeOutcome::Finished, _) => {
                self.state = SessionState::DataComplete;
                self.finish_transaction();
                Ok(true)
            },
        }
    }

    fn finish_transaction(&mut self) {
        let Some(tx) = self.transaction.take() else {
            return;
        };

        let reply = if tx.data.len() > self.config.message_size_limit {
            warn!(
                "{} Message of {} bytes exceeds size limit",
                self.log_prefix,
                tx.data.len(),
            );
            Reply::new(
                pc::ExceededStorageAllocation as u16,
                "Message exceeds fixed maximum message size",
            )
        } else if let Some(ref mut handler) = self.on_transaction {
            handler(tx)
        } else {
            Reply::new(
                pc::TransactionFailed as u16,
                "Message handler not implemented",
            )
        };

        info!("{} Completed data transfer", self.log_prefix);
        self.send_response(&Response::new(reply.code, &reply.text));
        self.state = SessionState::Ready;
    }

    /// Renders `response` into the output buffer and applies the flush
    /// rule its code calls for.
    fn send_response(&mut self, response: &Response) {
        if !self.transport.output_finality().is_open() {
            return;
        }

        response.render(self.transport.output());
        match response.code {
            354 => {
                self.state = SessionState::Data;
                self.transport.flush(false);
            },
            221 | 421 => {
                self.transport.flush(true);
            },
            _ => {
                self.transport.flush(false);
            },
        }
    }
}
