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

//! Smtpkit is a transport-agnostic SMTP toolkit: both the client and the
//! server half of an RFC 5321 session, as protocol engines that perform no
//! I/O of their own.
//!
//! Each engine operates over a pair of byte buffers bound to a pluggable
//! source/sink (`SessionIo`), so the same engines run over blocking
//! handles, non-blocking handles, event-loop sockets, in-memory pipes, or
//! TLS transports. Suspension is externalised: whenever a parse would need
//! more bytes, `handle_io` returns, and the caller resumes it once its own
//! event source says the connection is ready again.
//!
//! ```no_run
//! use std::net::TcpStream;
//!
//! use smtpkit::{
//!     BufferedTransport, ClientEngine, EnvelopeRoute, SmtpConfig,
//! };
//!
//! fn main() -> Result<(), smtpkit::Error> {
//!     let sock = TcpStream::connect("mail.example.com:25")?;
//!     let config = SmtpConfig {
//!         client_domain: "client.example.com".to_owned(),
//!         ..SmtpConfig::default()
//!     };
//!     let mut client =
//!         ClientEngine::new(BufferedTransport::new(sock), config);
//!
//!     // Blocking transport: each handle_io makes synchronous progress.
//!     while client.state() == smtpkit::SessionState::Connect {
//!         client.handle_io()?;
//!     }
//!     client.ehlo(None)?;
//!     client.mail_from(EnvelopeRoute::mailbox("zim@example.com"))?;
//!     client.rcpt_to(EnvelopeRoute::mailbox("gir@example.net"))?;
//!     client.send_message(&b"Subject: hi\r\n\r\nhello\r\n"[..])?;
//!     client.quit()?;
//!
//!     while let Some(completed) = client.next_completed() {
//!         println!("{:?}: {:?}", completed.command, completed.result);
//!     }
//!     Ok(())
//! }
//! ```

#[cfg(test)]
macro_rules! assert_matches {
    ($expected:pat, $actual:expr) => {
        match $actual {
            $expected => (),
            unexpected => panic!(
                "Expected {} matches {}, got {:?}",
                stringify!($expected),
                stringify!($actual),
                unexpected
            ),
        }
    };
}

pub mod smtp;
pub mod support;

pub use crate::smtp::client::{ClientEngine, CompletedRequest, RequestId};
pub use crate::smtp::config::{EhloValue, SmtpConfig};
pub use crate::smtp::data::{DataDecoder, DataEncoder, DecodeOutcome};
pub use crate::smtp::route::EnvelopeRoute;
pub use crate::smtp::server::{HandshakeInfo, Reply, ServerEngine};
pub use crate::smtp::state::SessionState;
pub use crate::smtp::syntax::{
    Command, CommandSpec, CommandTable, ParsedCommand, Response, SyntaxError,
    Verb,
};
pub use crate::smtp::transaction::Transaction;
pub use crate::support::buffer::{
    BodyReader, BodyWriter, ByteBuf, Finality,
};
pub use crate::support::error::Error;
pub use crate::support::transport::{
    pipe, BufferedTransport, PipeIo, SessionIo, Transport,
};

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        if !std::env::var("TEST_LOG").ok().map_or(false, |v| "1" == v) {
            return;
        }

        let stderr = log4rs::append::console::ConsoleAppender::builder()
            .target(log4rs::append::console::Target::Stderr)
            .encoder(Box::new(log4rs::encode::pattern::PatternEncoder::new(
                "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
            )))
            .build();
        let log_config = log4rs::config::Config::builder()
            .appender(
                log4rs::config::Appender::builder()
                    .build("stderr", Box::new(stderr)),
            )
            .build(
                log4rs::config::Root::builder()
                    .appender("stderr")
                    .build(log::LevelFilter::Trace),
            )
            .unwrap();
        log4rs::init_config(log_config).unwrap();
    })
}
