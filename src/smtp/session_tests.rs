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

//! End-to-end tests driving both engines over in-memory pipes.

use std::cell::RefCell;
use std::io::Read;
use std::rc::Rc;

use super::client::ClientEngine;
use super::config::{EhloValue, SmtpConfig};
use super::route::EnvelopeRoute;
use super::server::{Reply, ServerEngine};
use super::state::SessionState;
use super::syntax::{self, Command, Response};
use super::transaction::Transaction;
use crate::support::error::Error;
use crate::support::transport::{pipe, BufferedTransport, PipeIo, Transport};

type PipeTransport = BufferedTransport<PipeIo>;

fn server_config() -> SmtpConfig {
    SmtpConfig {
        server_domain: "example.com".to_owned(),
        server_address: "192.0.2.1".to_owned(),
        ..SmtpConfig::default()
    }
}

fn client_config() -> SmtpConfig {
    SmtpConfig {
        client_domain: "client.example.com".to_owned(),
        client_address: "192.0.2.2".to_owned(),
        ..SmtpConfig::default()
    }
}

fn engines(
    server_config: SmtpConfig,
) -> (ClientEngine<PipeTransport>, ServerEngine<PipeTransport>) {
    crate::init_test_log();

    let (client_io, server_io) = pipe();
    (
        ClientEngine::new(BufferedTransport::new(client_io), client_config()),
        ServerEngine::new(BufferedTransport::new(server_io), server_config),
    )
}

/// Runs both engines until neither can make further progress.
fn pump(
    client: &mut ClientEngine<PipeTransport>,
    server: &mut ServerEngine<PipeTransport>,
) {
    loop {
        let client_progress = client.handle_io().unwrap();
        let server_progress = server.handle_io().unwrap();
        if !client_progress && !server_progress {
            break;
        }
    }
}

/// Captures completed transactions out of the server's handler.
fn capture_transactions(
    server: &mut ServerEngine<PipeTransport>,
) -> Rc<RefCell<Vec<Transaction>>> {
    let captured = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&captured);
    server.on_transaction(move |tx| {
        sink.borrow_mut().push(tx);
        Reply::new(250, "OK")
    });
    captured
}

fn read_body(tx: Transaction) -> Vec<u8> {
    let mut body = Vec::new();
    tx.data.flip().unwrap().read_to_end(&mut body).unwrap();
    body
}

#[test]
fn simple_ehlo_session() {
    let (mut client, mut server) = engines(server_config());
    pump(&mut client, &mut server);
    assert_eq!(SessionState::Handshake, client.state());
    assert_eq!(SessionState::Handshake, server.state());

    client.ehlo(None).unwrap();
    pump(&mut client, &mut server);

    assert_eq!(SessionState::Ready, client.state());
    assert_eq!(SessionState::Ready, server.state());
    assert_eq!(Some("example.com"), client.server_helo());

    let greeting = client.next_completed().unwrap();
    assert!(greeting.command.is_none());
    assert_eq!(220, greeting.result.unwrap().code);

    let ehlo = client.next_completed().unwrap();
    assert_eq!(Some(Command::Ehlo("client.example.com".to_owned())), ehlo.command);
    let response = ehlo.result.unwrap();
    assert_eq!(250, response.code);
    assert_eq!(vec!["example.com".to_owned()], response.lines);
}

#[test]
fn multi_line_ehlo_response() {
    let mut config = server_config();
    config
        .server_ehlo_keywords
        .insert("PIPELINING".to_owned(), EhloValue::Value(String::new()));
    config
        .server_ehlo_keywords
        .insert("SIZE".to_owned(), EhloValue::Value("10485760".to_owned()));

    let (mut client, mut server) = engines(config);
    pump(&mut client, &mut server);
    client.ehlo(None).unwrap();
    pump(&mut client, &mut server);

    let _greeting = client.next_completed().unwrap();
    let ehlo = client.next_completed().unwrap();
    let response = ehlo.result.unwrap();
    assert_eq!(250, response.code);
    assert_eq!(
        vec![
            "example.com".to_owned(),
            "PIPELINING".to_owned(),
            "SIZE 10485760".to_owned(),
        ],
        response.lines,
    );

    assert_eq!(
        Some(&EhloValue::Value("10485760".to_owned())),
        client.server_ehlo_keywords().get("SIZE"),
    );
}

#[test]
fn null_reverse_path_transaction() {
    let (mut client, mut server) = engines(server_config());
    let captured = capture_transactions(&mut server);

    pump(&mut client, &mut server);
    client.ehlo(None).unwrap();
    pump(&mut client, &mut server);
    client.mail_from(EnvelopeRoute::null()).unwrap();
    pump(&mut client, &mut server);

    assert_eq!(SessionState::Mail, client.state());
    assert_eq!(SessionState::Mail, server.state());
    {
        let tx = server.transaction().unwrap();
        assert!(tx.reverse_path.is_null());
        assert!(tx.reverse_path.route.is_empty());
        assert!(tx.reverse_path.parameters.is_empty());
    }

    client
        .rcpt_to(EnvelopeRoute::mailbox("gir@irk.example"))
        .unwrap();
    pump(&mut client, &mut server);
    client.send_message(&b"Hello\r\n"[..]).unwrap();
    pump(&mut client, &mut server);

    assert_eq!(SessionState::Ready, client.state());
    assert_eq!(SessionState::Ready, server.state());

    let tx = captured.borrow_mut().pop().unwrap();
    assert!(tx.reverse_path.is_null());
    assert_eq!(1, tx.forward_paths.len());
    assert_eq!(
        Some("gir@irk.example".to_owned()),
        tx.forward_paths[0].mailbox,
    );
    assert_eq!(Some("client.example.com".to_owned()), tx.client_helo);
    assert_eq!("example.com", tx.server_domain);
    assert_eq!(Some("example.com".to_owned()), tx.server_helo);
    assert_eq!(b"Hello\r\n".to_vec(), read_body(tx));
}

#[test]
fn manual_data_writer_round_trips() {
    let (mut client, mut server) = engines(server_config());
    let captured = capture_transactions(&mut server);

    pump(&mut client, &mut server);
    client.ehlo(None).unwrap();
    pump(&mut client, &mut server);
    client
        .mail_from(EnvelopeRoute::mailbox("zim@earth.example"))
        .unwrap();
    pump(&mut client, &mut server);
    client
        .rcpt_to(EnvelopeRoute::mailbox("gir@irk.example"))
        .unwrap();
    pump(&mut client, &mut server);

    client.data().unwrap();
    pump(&mut client, &mut server);
    assert_eq!(SessionState::Data, client.state());
    assert_eq!(SessionState::Data, server.state());

    // Fragment boundaries fall mid-line and mid-CRLF on purpose.
    client.write_data(b"Foo\n.Line starting wi").unwrap();
    client.write_data(b"th dot\n. Line starting with dot-space\r").unwrap();
    client.write_data(b"\n").unwrap();
    client.end_data().unwrap();
    pump(&mut client, &mut server);

    assert_eq!(SessionState::Ready, client.state());
    assert_eq!(SessionState::Ready, server.state());

    let tx = captured.borrow_mut().pop().unwrap();
    assert_eq!(
        b"Foo\r\n.Line starting with dot\r\n. Line starting with dot-space\r\n"
            .to_vec(),
        read_body(tx),
    );
}

#[test]
fn preloaded_body_completes_with_final_response() {
    let (mut client, mut server) = engines(server_config());
    let _captured = capture_transactions(&mut server);

    pump(&mut client, &mut server);
    client.ehlo(None).unwrap();
    pump(&mut client, &mut server);
    client
        .mail_from(EnvelopeRoute::mailbox("zim@earth.example"))
        .unwrap();
    pump(&mut client, &mut server);
    client
        .rcpt_to(EnvelopeRoute::mailbox("gir@irk.example"))
        .unwrap();
    pump(&mut client, &mut server);

    let data_id = client.send_message(&b"message body\r\n"[..]).unwrap();
    pump(&mut client, &mut server);

    // Drain: greeting, EHLO, MAIL, RCPT, then exactly one DATA completion
    // carrying the final response rather than the 354.
    let mut completions = Vec::new();
    while let Some(completed) = client.next_completed() {
        completions.push(completed);
    }
    assert_eq!(5, completions.len());
    let data_completion = completions.pop().unwrap();
    assert_eq!(data_id, data_completion.id);
    assert_eq!(Some(Command::Data), data_completion.command);
    assert_eq!(250, data_completion.result.unwrap().code);
}

#[test]
fn observers_complete_in_fifo_order() {
    let (mut client, mut server) = engines(server_config());
    let _captured = capture_transactions(&mut server);

    pump(&mut client, &mut server);
    let ehlo_id = client.ehlo(None).unwrap();
    pump(&mut client, &mut server);
    let mail_id = client
        .mail_from(EnvelopeRoute::mailbox("zim@earth.example"))
        .unwrap();
    pump(&mut client, &mut server);
    let rcpt_id = client
        .rcpt_to(EnvelopeRoute::mailbox("gir@irk.example"))
        .unwrap();
    pump(&mut client, &mut server);
    let data_id = client.send_message(&b"x\r\n"[..]).unwrap();
    pump(&mut client, &mut server);
    let quit_id = client.quit().unwrap();
    pump(&mut client, &mut server);

    let completed_ids = std::iter::from_fn(|| client.next_completed())
        .map(|completed| completed.id)
        .collect::<Vec<_>>();
    let mut expected = vec![ehlo_id, mail_id, rcpt_id, data_id, quit_id];
    expected.insert(0, completed_ids[0]); // the greeting sentinel
    assert_eq!(expected, completed_ids);
}

#[test]
fn graceful_close() {
    let (mut client, mut server) = engines(server_config());
    pump(&mut client, &mut server);
    client.ehlo(None).unwrap();
    pump(&mut client, &mut server);

    client.quit().unwrap();
    pump(&mut client, &mut server);

    assert_eq!(SessionState::Quit, client.state());
    assert_eq!(SessionState::Quit, server.state());
    // Both sides have performed their write-half-close.
    assert!(server.transport().output_finality().is_eof());
    assert!(client.transport().output_finality().is_eof());

    let mut completions = std::iter::from_fn(|| client.next_completed())
        .collect::<Vec<_>>();
    let quit = completions.pop().unwrap();
    let response = quit.result.unwrap();
    assert_eq!(221, response.code);
    assert_eq!(vec!["Goodbye".to_owned()], response.lines);
}

#[test]
fn rejected_greeting_allows_only_quit() {
    crate::init_test_log();
    let (client_io, server_io) = pipe();
    let mut client =
        ClientEngine::new(BufferedTransport::new(client_io), client_config());
    let mut server =
        ServerEngine::new(BufferedTransport::new(server_io), server_config())
            .reject_all("No service for you");

    pump(&mut client, &mut server);
    assert_eq!(SessionState::Reject, client.state());
    assert_eq!(SessionState::Reject, server.state());

    let greeting = client.next_completed().unwrap();
    assert_eq!(554, greeting.result.unwrap().code);

    assert_matches!(
        Err(Error::BadCallState(_)),
        client.mail_from(EnvelopeRoute::null())
    );

    client.quit().unwrap();
    pump(&mut client, &mut server);
    assert_eq!(SessionState::Quit, client.state());
    assert_eq!(SessionState::Quit, server.state());
}

#[test]
fn client_guards_out_of_sequence_commands() {
    let (mut client, mut server) = engines(server_config());
    pump(&mut client, &mut server);
    client.ehlo(None).unwrap();
    pump(&mut client, &mut server);

    // Ready state: RCPT and DATA are not legal yet.
    assert_matches!(
        Err(Error::BadCallState("RCPT")),
        client.rcpt_to(EnvelopeRoute::mailbox("gir@irk.example"))
    );
    assert_matches!(Err(Error::BadCallState("DATA")), client.data());
    assert_matches!(
        Err(Error::BadCallState("write_data")),
        client.write_data(b"x")
    );
    assert_eq!(SessionState::Ready, client.state());
}

#[test]
fn recipient_limit_draws_452() {
    let mut config = server_config();
    config.recipient_limit = 2;
    let (mut client, mut server) = engines(config);

    pump(&mut client, &mut server);
    client.ehlo(None).unwrap();
    pump(&mut client, &mut server);
    client.mail_from(EnvelopeRoute::null()).unwrap();
    pump(&mut client, &mut server);

    for _ in 0..3 {
        client
            .rcpt_to(EnvelopeRoute::mailbox("gir@irk.example"))
            .unwrap();
        pump(&mut client, &mut server);
    }

    let codes = std::iter::from_fn(|| client.next_completed())
        .map(|completed| completed.result.unwrap().code)
        .collect::<Vec<_>>();
    assert_eq!(vec![220, 250, 250, 250, 250, 452], codes);
    assert_eq!(2, server.transaction().unwrap().forward_paths.len());
}

#[test]
fn oversized_message_draws_552() {
    let mut config = server_config();
    config.message_size_limit = 8;
    let (mut client, mut server) = engines(config);
    let captured = capture_transactions(&mut server);

    pump(&mut client, &mut server);
    client.ehlo(None).unwrap();
    pump(&mut client, &mut server);
    client.mail_from(EnvelopeRoute::null()).unwrap();
    pump(&mut client, &mut server);
    client
        .rcpt_to(EnvelopeRoute::mailbox("gir@irk.example"))
        .unwrap();
    pump(&mut client, &mut server);

    client
        .send_message(&b"far too large a message\r\n"[..])
        .unwrap();
    pump(&mut client, &mut server);

    let final_completion = std::iter::from_fn(|| client.next_completed())
        .last()
        .unwrap();
    assert_eq!(552, final_completion.result.unwrap().code);
    // The handler never saw the oversized transaction.
    assert!(captured.borrow().is_empty());
    assert_eq!(SessionState::Ready, server.state());
}

#[test]
fn rset_clears_transaction() {
    let (mut client, mut server) = engines(server_config());
    pump(&mut client, &mut server);
    client.ehlo(None).unwrap();
    pump(&mut client, &mut server);
    client.mail_from(EnvelopeRoute::null()).unwrap();
    pump(&mut client, &mut server);
    assert!(server.transaction().is_some());

    client.rset().unwrap();
    pump(&mut client, &mut server);
    assert!(server.transaction().is_none());
    assert_eq!(SessionState::Ready, client.state());
    assert_eq!(SessionState::Ready, server.state());

    // MAIL is legal again.
    client.mail_from(EnvelopeRoute::null()).unwrap();
    pump(&mut client, &mut server);
    assert_eq!(SessionState::Mail, server.state());
}

#[test]
fn server_aborts_on_unexpected_eof() {
    let (mut client, mut server) = engines(server_config());
    pump(&mut client, &mut server);
    client.ehlo(None).unwrap();
    pump(&mut client, &mut server);

    // The client vanishes without QUIT.
    client.transport().flush(true);
    server.handle_io().unwrap();

    assert_eq!(SessionState::Abort, server.state());
}

#[test]
fn client_fails_pending_requests_on_eof() {
    let (mut client, mut server) = engines(server_config());
    pump(&mut client, &mut server);
    let _ = client.next_completed().unwrap(); // greeting

    client.ehlo(None).unwrap();
    // The server hangs up instead of answering.
    server.transport().flush(true);
    client.handle_io().unwrap();

    let ehlo = client.next_completed().unwrap();
    assert_matches!(Err(Error::UnexpectedEof), ehlo.result);
    assert_eq!(SessionState::Abort, client.state());
}

// Raw-wire tests below drive the server directly, without a client engine,
// to exercise inputs the client engine refuses to produce.

fn raw_server(
    config: SmtpConfig,
) -> (ServerEngine<PipeTransport>, PipeTransport) {
    crate::init_test_log();
    let (raw_io, server_io) = pipe();
    let mut server =
        ServerEngine::new(BufferedTransport::new(server_io), config);
    let mut raw = BufferedTransport::new(raw_io);

    server.handle_io().unwrap();
    raw.fetch(None);
    let greeting = syntax::parse_response(raw.input()).unwrap().unwrap();
    assert_eq!(220, greeting.code);

    (server, raw)
}

fn exchange(
    server: &mut ServerEngine<PipeTransport>,
    raw: &mut PipeTransport,
    line: &str,
) -> Response {
    raw.output().append(line.as_bytes());
    raw.output().append(b"\r\n");
    raw.flush(false);
    server.handle_io().unwrap();
    raw.fetch(None);
    syntax::parse_response(raw.input()).unwrap().unwrap()
}

#[test]
fn out_of_sequence_rcpt_draws_503() {
    let (mut server, mut raw) = raw_server(server_config());
    assert_eq!(250, exchange(&mut server, &mut raw, "EHLO c.example").code);

    let response = exchange(&mut server, &mut raw, "RCPT TO:<x@y>");
    assert_eq!(503, response.code);
    assert_eq!(vec!["Bad sequence of commands".to_owned()], response.lines);
    // State is unchanged; MAIL still works.
    assert_eq!(SessionState::Ready, server.state());
    assert_eq!(250, exchange(&mut server, &mut raw, "MAIL FROM:<>").code);
}

#[test]
fn state_legality_matrix() {
    // (prefix commands, probes as (command, legal))
    let states: &[(&str, &[&str])] = &[
        ("handshake", &[]),
        ("ready", &["EHLO c.example"]),
        (
            "mail",
            &["EHLO c.example", "MAIL FROM:<>", "RCPT TO:<g@irk.example>"],
        ),
    ];
    let legality: &[(&str, &[&str])] = &[
        ("HELO c.example", &["handshake", "ready", "mail"]),
        ("EHLO c.example", &["handshake", "ready", "mail"]),
        ("MAIL FROM:<>", &["ready"]),
        ("RCPT TO:<g@irk.example>", &["mail"]),
        ("DATA", &["mail"]),
        ("RSET", &["handshake", "ready", "mail"]),
        ("NOOP", &["handshake", "ready", "mail"]),
    ];

    for &(state_name, prefix) in states {
        for &(probe, legal_states) in legality {
            let (mut server, mut raw) = raw_server(server_config());
            for setup in prefix {
                let code = exchange(&mut server, &mut raw, setup).code;
                assert!(
                    (200..400).contains(&code),
                    "setup {:?} failed with {}",
                    setup,
                    code,
                );
            }

            let code = exchange(&mut server, &mut raw, probe).code;
            if legal_states.contains(&state_name) {
                assert!(
                    250 == code || 354 == code,
                    "{} in {} drew {}, expected success",
                    probe,
                    state_name,
                    code,
                );
            } else {
                assert_eq!(
                    503, code,
                    "{} in {} drew {}, expected 503",
                    probe, state_name, code,
                );
            }
        }
    }
}

#[test]
fn data_without_recipients_draws_554() {
    let (mut server, mut raw) = raw_server(server_config());
    exchange(&mut server, &mut raw, "EHLO c.example");
    exchange(&mut server, &mut raw, "MAIL FROM:<>");

    let response = exchange(&mut server, &mut raw, "DATA");
    assert_eq!(554, response.code);
    assert_eq!(vec!["No valid recipients".to_owned()], response.lines);
    assert_eq!(SessionState::Mail, server.state());
}

#[test]
fn unknown_and_disabled_commands() {
    let (mut server, mut raw) = raw_server(server_config());
    assert_eq!(
        500,
        exchange(&mut server, &mut raw, "FROBNICATE now").code,
    );
    assert_eq!(500, exchange(&mut server, &mut raw, "RSET extra").code);

    crate::init_test_log();
    let (raw_io, server_io) = pipe();
    let mut server = ServerEngine::with_table(
        BufferedTransport::new(server_io),
        server_config(),
        syntax::CommandTable::full().without(syntax::Verb::Noop),
    );
    let mut raw = BufferedTransport::new(raw_io);
    server.handle_io().unwrap();
    raw.fetch(None);
    syntax::parse_response(raw.input()).unwrap().unwrap();

    let response = exchange(&mut server, &mut raw, "NOOP");
    assert_eq!(502, response.code);
    assert_eq!(vec!["Unimplemented".to_owned()], response.lines);
}

#[test]
fn overlong_line_discarded() {
    let (mut server, mut raw) = raw_server(server_config());

    raw.output().append(&[b'A'; 1200]);
    raw.flush(false);
    server.handle_io().unwrap();
    raw.fetch(None);
    let response = syntax::parse_response(raw.input()).unwrap().unwrap();
    assert_eq!(500, response.code);
    assert_eq!(vec!["Command line too long".to_owned()], response.lines);

    // The tail of the over-long line is discarded; the next real command
    // still parses.
    assert_eq!(250, exchange(&mut server, &mut raw, "AAA\r\nNOOP").code);
}

#[test]
fn bare_lf_commands_accepted() {
    let (mut server, mut raw) = raw_server(server_config());

    raw.output().append(b"EHLO c.example\n");
    raw.flush(false);
    server.handle_io().unwrap();
    raw.fetch(None);
    let response = syntax::parse_response(raw.input()).unwrap().unwrap();
    assert_eq!(250, response.code);
    assert_eq!(SessionState::Ready, server.state());
}
