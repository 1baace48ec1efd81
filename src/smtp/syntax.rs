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

//! The SMTP grammar: framing, parsing, and rendering of commands and
//! responses.
//!
//! Everything here is pure. Parsers operate on the caller's buffer and
//! either consume exactly one complete message or consume nothing and
//! report that more bytes are needed; nothing in this module performs I/O.

use std::fmt::Write as _;
use std::str;

use lazy_static::lazy_static;
use regex::Regex;

use super::codes::*;
use super::route::EnvelopeRoute;
use super::state::{self, SessionState};
use crate::support::buffer::ByteBuf;
use crate::support::error::Error;

/// A single parsed command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    MailFrom(EnvelopeRoute),
    RcptTo(EnvelopeRoute),
    Data,
    Rset,
    Noop,
    Quit,
}

/// The verbs the toolkit understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    Helo,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    Rset,
    Noop,
    Quit,
}

impl Command {
    pub fn verb(&self) -> Verb {
        match *self {
            Command::Helo(..) => Verb::Helo,
            Command::Ehlo(..) => Verb::Ehlo,
            Command::MailFrom(..) => Verb::Mail,
            Command::RcptTo(..) => Verb::Rcpt,
            Command::Data => Verb::Data,
            Command::Rset => Verb::Rset,
            Command::Noop => Verb::Noop,
            Command::Quit => Verb::Quit,
        }
    }

    pub(crate) fn spec(&self) -> &'static CommandSpec {
        spec_for(self.verb())
    }

    /// Renders the exact wire form of the command, terminator included.
    pub fn render(&self, out: &mut ByteBuf) {
        let mut line = String::new();
        match *self {
            Command::Helo(ref domain) => {
                let _ = write!(line, "HELO {}", domain);
            },
            Command::Ehlo(ref domain) => {
                let _ = write!(line, "EHLO {}", domain);
            },
            Command::MailFrom(ref route) => {
                let _ = write!(line, "MAIL FROM:{}", route);
                route.render_parameters(&mut line);
            },
            Command::RcptTo(ref route) => {
                let _ = write!(line, "RCPT TO:{}", route);
                route.render_parameters(&mut line);
            },
            Command::Data => line.push_str("DATA"),
            Command::Rset => line.push_str("RSET"),
            Command::Noop => line.push_str("NOOP"),
            Command::Quit => line.push_str("QUIT"),
        }
        line.push_str("\r\n");
        out.append(line.as_bytes());
    }
}

/// A grammar-level parse failure.
///
/// Carries the SMTP numeric code the server half responds with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyntaxError {
    pub code: PrimaryCode,
    pub message: String,
}

impl SyntaxError {
    fn new(code: PrimaryCode, message: impl Into<String>) -> Self {
        SyntaxError {
            code,
            message: message.into(),
        }
    }

    /// Wraps this error with outer context, keeping the deepest grammar
    /// error visible in the message chain.
    fn context(self, code: PrimaryCode, prefix: &str) -> Self {
        SyntaxError {
            code,
            message: format!("{}: {}", prefix, self.message),
        }
    }
}

impl From<SyntaxError> for Error {
    fn from(e: SyntaxError) -> Self {
        Error::Grammar {
            code: e.code as u16,
            message: e.message,
        }
    }
}

/// Static description of one verb: its wire name, the session states in
/// which it is legal, and its argument parser.
pub struct CommandSpec {
    pub verb: Verb,
    pub name: &'static str,
    pub states: &'static [SessionState],
    /// Parses the text following the verb token, leading whitespace
    /// included.
    pub parse: fn(&str) -> Result<Command, SyntaxError>,
}

impl CommandSpec {
    pub fn legal_in(&self, state: SessionState) -> bool {
        self.states.contains(&state)
    }
}

static COMMANDS: &[CommandSpec] = &[
    CommandSpec {
        verb: Verb::Helo,
        name: "HELO",
        states: state::HELO_STATES,
        parse: parse_helo,
    },
    CommandSpec {
        verb: Verb::Ehlo,
        name: "EHLO",
        states: state::HELO_STATES,
        parse: parse_ehlo,
    },
    CommandSpec {
        verb: Verb::Mail,
        name: "MAIL",
        states: state::MAIL_STATES,
        parse: parse_mail,
    },
    CommandSpec {
        verb: Verb::Rcpt,
        name: "RCPT",
        states: state::RCPT_STATES,
        parse: parse_rcpt,
    },
    CommandSpec {
        verb: Verb::Data,
        name: "DATA",
        states: state::DATA_STATES,
        parse: parse_data,
    },
    CommandSpec {
        verb: Verb::Rset,
        name: "RSET",
        states: state::RSET_STATES,
        parse: parse_rset,
    },
    CommandSpec {
        verb: Verb::Noop,
        name: "NOOP",
        states: state::NOOP_STATES,
        parse: parse_noop,
    },
    CommandSpec {
        verb: Verb::Quit,
        name: "QUIT",
        states: state::QUIT_STATES,
        parse: parse_quit,
    },
];

pub(crate) fn spec_for(verb: Verb) -> &'static CommandSpec {
    for spec in COMMANDS {
        if verb == spec.verb {
            return spec;
        }
    }

    unreachable!("verb missing from the command table")
}

/// The set of verbs enabled for one engine.
///
/// Each engine owns its table, built at construction; there is no shared
/// mutable registry.
#[derive(Clone)]
pub struct CommandTable {
    enabled: Vec<&'static CommandSpec>,
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::full()
    }
}

impl CommandTable {
    /// A table with every verb the toolkit implements.
    pub fn full() -> Self {
        CommandTable {
            enabled: COMMANDS.iter().collect(),
        }
    }

    /// Returns the table with `verb` removed. The verb then draws 502
    /// rather than 500, since it is known but not offered.
    pub fn without(mut self, verb: Verb) -> Self {
        self.enabled.retain(|spec| verb != spec.verb);
        self
    }

    /// Builds a table from an explicit spec list.
    ///
    /// This is the hook for embedders that substitute stricter parsers for
    /// individual verbs.
    pub fn from_specs(specs: Vec<&'static CommandSpec>) -> Self {
        CommandTable { enabled: specs }
    }

    fn lookup(&self, name: &str) -> Result<&'static CommandSpec, SyntaxError> {
        if let Some(spec) = self
            .enabled
            .iter()
            .copied()
            .find(|spec| spec.name.eq_ignore_ascii_case(name))
        {
            return Ok(spec);
        }

        if COMMANDS
            .iter()
            .any(|spec| spec.name.eq_ignore_ascii_case(name))
        {
            Err(SyntaxError::new(pc::CommandNotImplemented, "Unimplemented"))
        } else {
            Err(SyntaxError::new(
                pc::CommandSyntaxError,
                format!(
                    "Unknown command \"{}\"",
                    name.to_ascii_uppercase(),
                ),
            ))
        }
    }
}

/// One complete command line taken off the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedCommand {
    pub command: Command,
    /// Non-fatal oddities noticed while parsing, e.g. a missing CR.
    pub warnings: Vec<String>,
}

/// Takes the next complete command off `buf`.
///
/// Returns `None` without consuming anything when no full line is
/// buffered. Otherwise exactly one line, terminator included, is consumed
/// whether or not it parses.
pub fn parse_command(
    table: &CommandTable,
    buf: &mut ByteBuf,
) -> Option<Result<ParsedCommand, SyntaxError>> {
    let unread = buf.unread();
    let eol = memchr::memchr(b'\n', unread)?;

    let mut line = &unread[..eol];
    let mut warnings = Vec::new();
    if let Some(stripped) = line.strip_suffix(b"\r") {
        line = stripped;
    } else {
        warnings.push("Missing CR".to_owned());
    }

    let result = parse_command_line(table, line, warnings);
    buf.advance(eol + 1);
    Some(result)
}

fn parse_command_line(
    table: &CommandTable,
    line: &[u8],
    warnings: Vec<String>,
) -> Result<ParsedCommand, SyntaxError> {
    let Ok(line) = str::from_utf8(line) else {
        return Err(SyntaxError::new(
            pc::CommandSyntaxError,
            "Malformed UTF-8",
        ));
    };

    let mut scanner = Scanner::new(line);
    let verb = scanner.take_while(|b| !matches!(b, b' ' | b'\t'));
    if verb.is_empty() {
        return Err(SyntaxError::new(pc::CommandSyntaxError, "Empty command"));
    }

    let spec = table.lookup(verb)?;
    let command = (spec.parse)(scanner.rest())?;
    Ok(ParsedCommand { command, warnings })
}

/// A cursor over one command line.
///
/// The grammar is all-ASCII; predicates that stop only on ASCII bytes can
/// never split a multi-byte character.
struct Scanner<'a> {
    line: &'a str,
    pos: usize,
}

impl<'a> Scanner<'a> {
    fn new(line: &'a str) -> Self {
        Scanner { line, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos == self.line.len()
    }

    fn rest(&self) -> &'a str {
        &self.line[self.pos..]
    }

    fn peek(&self) -> Option<u8> {
        self.line.as_bytes().get(self.pos).copied()
    }

    fn eat(&mut self, byte: u8) -> bool {
        if Some(byte) == self.peek() {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn skip_spaces(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t')) {
            self.pos += 1;
        }
    }

    fn take_while(&mut self, pred: impl Fn(u8) -> bool) -> &'a str {
        let start = self.pos;
        while let Some(byte) = self.peek() {
            if !pred(byte) {
                break;
            }
            self.pos += 1;
        }
        &self.line[start..self.pos]
    }

    /// Consumes `keyword` case-insensitively if it is next.
    fn eat_keyword(&mut self, keyword: &str) -> bool {
        let rest = &self.line[self.pos..];
        if rest.len() >= keyword.len()
            && rest[..keyword.len()].eq_ignore_ascii_case(keyword)
        {
            self.pos += keyword.len();
            true
        } else {
            false
        }
    }
}

lazy_static! {
    static ref RX_DOMAIN: Regex =
        Regex::new(r"^\w[-\w]*(?:\.\w[-\w]*)*$").unwrap();
    static ref RX_IPV4_LITERAL: Regex =
        Regex::new(r"^\[[0-9]{1,3}(?:\.[0-9]{1,3}){3}\]$").unwrap();
    static ref RX_IPV6_LITERAL: Regex =
        Regex::new(r"^\[[0-9A-Fa-f]*:[0-9A-Fa-f:.]+\]$").unwrap();
}

fn is_domain(token: &str) -> bool {
    RX_DOMAIN.is_match(token)
}

fn is_domain_or_literal(token: &str) -> bool {
    RX_DOMAIN.is_match(token)
        || RX_IPV4_LITERAL.is_match(token)
        || RX_IPV6_LITERAL.is_match(token)
}

fn parse_helo(args: &str) -> Result<Command, SyntaxError> {
    parse_helo_domain(&mut Scanner::new(args)).map(Command::Helo)
}

fn parse_ehlo(args: &str) -> Result<Command, SyntaxError> {
    parse_helo_domain(&mut Scanner::new(args)).map(Command::Ehlo)
}

fn parse_helo_domain(
    scanner: &mut Scanner<'_>,
) -> Result<String, SyntaxError> {
    scanner.skip_spaces();
    let domain = scanner.take_while(|b| !matches!(b, b' ' | b'\t'));
    if !is_domain_or_literal(domain) {
        return Err(SyntaxError::new(
            pc::ParameterSyntaxError,
            format!("Bad domain {:?}", domain),
        ));
    }

    let domain = domain.to_owned();
    scanner.skip_spaces();
    if !scanner.at_end() {
        return Err(SyntaxError::new(
            pc::ParameterSyntaxError,
            "Unexpected text after domain",
        ));
    }

    Ok(domain)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum PathKind {
    Reverse,
    Forward,
}

fn parse_mail(args: &str) -> Result<Command, SyntaxError> {
    let scanner = &mut Scanner::new(args);
    scanner.skip_spaces();
    if !scanner.eat_keyword("FROM:") {
        return Err(SyntaxError::new(
            pc::CommandSyntaxError,
            "Invalid MAIL command: expected FROM:",
        ));
    }

    scanner.skip_spaces();
    parse_route_with_params(scanner, PathKind::Reverse)
        .map(Command::MailFrom)
        .map_err(|e| e.context(pc::CommandSyntaxError, "Invalid MAIL command"))
}

fn parse_rcpt(args: &str) -> Result<Command, SyntaxError> {
    let scanner = &mut Scanner::new(args);
    scanner.skip_spaces();
    if !scanner.eat_keyword("TO:") {
        return Err(SyntaxError::new(
            pc::CommandSyntaxError,
            "Invalid RCPT command: expected TO:",
        ));
    }

    scanner.skip_spaces();
    parse_route_with_params(scanner, PathKind::Forward)
        .map(Command::RcptTo)
        .map_err(|e| e.context(pc::CommandSyntaxError, "Invalid RCPT command"))
}

/// Parses `<path>` plus any trailing ` NAME[=VALUE]` parameters.
///
/// The mailbox grammar is deliberately permissive; stricter validation
/// belongs to higher layers (or substitute parsers via `CommandTable`).
fn parse_route_with_params(
    scanner: &mut Scanner<'_>,
    kind: PathKind,
) -> Result<EnvelopeRoute, SyntaxError> {
    if !scanner.eat(b'<') {
        return Err(SyntaxError::new(pc::CommandSyntaxError, "Expected '<'"));
    }

    let mut envelope = EnvelopeRoute::default();

    if scanner.eat(b'>') {
        if PathKind::Reverse != kind {
            return Err(SyntaxError::new(
                pc::CommandSyntaxError,
                "The null path is only valid for MAIL",
            ));
        }
    } else {
        if Some(b'@') == scanner.peek() {
            parse_source_route(scanner, &mut envelope.route)?;
        }

        let mailbox = scanner
            .take_while(|b| !matches!(b, b'>' | b' ' | b'\t'))
            .to_owned();
        if !scanner.eat(b'>') {
            return Err(SyntaxError::new(
                pc::CommandSyntaxError,
                "Expected '>'",
            ));
        }

        check_mailbox(&mailbox, kind)?;
        envelope.mailbox = Some(mailbox);
    }

    loop {
        let start = scanner.pos;
        scanner.skip_spaces();
        if scanner.at_end() {
            break;
        }
        if start == scanner.pos {
            return Err(SyntaxError::new(
                pc::CommandSyntaxError,
                "Expected space before parameter",
            ));
        }

        let name = scanner
            .take_while(|b| !matches!(b, b'=' | b' ' | b'\t'))
            .to_owned();
        if name.is_empty() {
            return Err(SyntaxError::new(
                pc::CommandSyntaxError,
                "Empty parameter name",
            ));
        }

        let value = if scanner.eat(b'=') {
            Some(
                scanner
                    .take_while(|b| !matches!(b, b' ' | b'\t'))
                    .to_owned(),
            )
        } else {
            None
        };

        envelope.parameters.insert(name, value);
    }

    Ok(envelope)
}

fn parse_source_route(
    scanner: &mut Scanner<'_>,
    route: &mut Vec<String>,
) -> Result<(), SyntaxError> {
    loop {
        if !scanner.eat(b'@') {
            return Err(SyntaxError::new(
                pc::CommandSyntaxError,
                "Expected '@' in source route",
            ));
        }

        let domain = scanner
            .take_while(|b| !matches!(b, b',' | b':' | b'>' | b' ' | b'\t'));
        if !is_domain(domain) {
            return Err(SyntaxError::new(
                pc::CommandSyntaxError,
                format!("Bad source route domain {:?}", domain),
            ));
        }
        route.push(domain.to_owned());

        if !scanner.eat(b',') {
            break;
        }
    }

    if scanner.eat(b':') {
        Ok(())
    } else {
        Err(SyntaxError::new(
            pc::CommandSyntaxError,
            "Expected ':' after source route",
        ))
    }
}

fn check_mailbox(mailbox: &str, kind: PathKind) -> Result<(), SyntaxError> {
    if mailbox.is_empty() {
        return Err(SyntaxError::new(
            pc::CommandSyntaxError,
            "Empty mailbox",
        ));
    }

    if mailbox.eq_ignore_ascii_case("postmaster") {
        return if PathKind::Forward == kind {
            Ok(())
        } else {
            Err(SyntaxError::new(
                pc::CommandSyntaxError,
                "postmaster is only valid for RCPT",
            ))
        };
    }

    let Some((local, domain)) = mailbox.rsplit_once('@') else {
        return Err(SyntaxError::new(
            pc::CommandSyntaxError,
            format!("Mailbox {:?} has no domain", mailbox),
        ));
    };

    if local.is_empty() {
        return Err(SyntaxError::new(
            pc::CommandSyntaxError,
            "Empty local part",
        ));
    }

    if !is_domain_or_literal(domain) {
        return Err(SyntaxError::new(
            pc::CommandSyntaxError,
            format!("Bad mailbox domain {:?}", domain),
        ));
    }

    Ok(())
}

fn parse_data(args: &str) -> Result<Command, SyntaxError> {
    expect_end(&mut Scanner::new(args), "DATA")?;
    Ok(Command::Data)
}

fn parse_rset(args: &str) -> Result<Command, SyntaxError> {
    expect_end(&mut Scanner::new(args), "RSET")?;
    Ok(Command::Rset)
}

fn parse_noop(args: &str) -> Result<Command, SyntaxError> {
    expect_end(&mut Scanner::new(args), "NOOP")?;
    Ok(Command::Noop)
}

fn parse_quit(args: &str) -> Result<Command, SyntaxError> {
    expect_end(&mut Scanner::new(args), "QUIT")?;
    Ok(Command::Quit)
}

fn expect_end(
    scanner: &mut Scanner<'_>,
    name: &str,
) -> Result<(), SyntaxError> {
    scanner.skip_spaces();
    if scanner.at_end() {
        Ok(())
    } else {
        Err(SyntaxError::new(
            pc::CommandSyntaxError,
            format!("Unexpected arguments to {}", name),
        ))
    }
}

/// A numeric response: one code and one or more message lines.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    /// The message lines, without code prefix or line terminator. Always
    /// at least one element.
    pub lines: Vec<String>,
}

impl Response {
    /// Builds a response, splitting `text` into physical lines on `\r?\n`.
    pub fn new(code: u16, text: &str) -> Self {
        let lines = text
            .split('\n')
            .map(|line| line.trim_end_matches('\r').to_owned())
            .collect();
        Response { code, lines }
    }

    /// Renders the wire form: one physical line per message line, `-` on
    /// all but the last.
    pub fn render(&self, out: &mut ByteBuf) {
        debug_assert!(!self.lines.is_empty());

        let mut text = String::new();
        for (ix, line) in self.lines.iter().enumerate() {
            let sep = if ix + 1 == self.lines.len() { ' ' } else { '-' };
            let _ = write!(text, "{}{}{}\r\n", self.code, sep, line);
        }
        out.append(text.as_bytes());
    }
}

enum ResponseScan {
    Incomplete,
    Complete {
        consumed: usize,
        response: Response,
    },
    Failed {
        consumed: usize,
        error: SyntaxError,
    },
}

/// Takes the next complete response off `buf`.
///
/// `None` is returned, and nothing consumed, until every line of the
/// response is buffered, terminator line included. A malformed line or a
/// code mismatch between continuation lines consumes the lines before the
/// offending one and fails.
pub fn parse_response(
    buf: &mut ByteBuf,
) -> Option<Result<Response, SyntaxError>> {
    match scan_response(buf.unread()) {
        ResponseScan::Incomplete => None,
        ResponseScan::Complete { consumed, response } => {
            buf.advance(consumed);
            Some(Ok(response))
        },
        ResponseScan::Failed { consumed, error } => {
            buf.advance(consumed);
            Some(Err(error))
        },
    }
}

fn scan_response(unread: &[u8]) -> ResponseScan {
    let mut lines = Vec::<String>::new();
    let mut code = 0u16;
    let mut offset = 0;

    loop {
        let line_start = offset;
        let Some(eol) = memchr::memchr(b'\n', &unread[offset..]) else {
            return ResponseScan::Incomplete;
        };

        let mut raw = &unread[offset..offset + eol];
        offset += eol + 1;
        if let Some(stripped) = raw.strip_suffix(b"\r") {
            raw = stripped;
        }

        match parse_response_line(raw) {
            Err(error) => {
                return ResponseScan::Failed {
                    consumed: line_start,
                    error,
                };
            },

            Ok((line_code, last, text)) => {
                if lines.is_empty() {
                    code = line_code;
                } else if code != line_code {
                    return ResponseScan::Failed {
                        consumed: line_start,
                        error: SyntaxError::new(
                            pc::CommandSyntaxError,
                            format!(
                                "Mismatched response codes {} and {}",
                                code, line_code,
                            ),
                        ),
                    };
                }

                lines.push(text.to_owned());
                if last {
                    return ResponseScan::Complete {
                        consumed: offset,
                        response: Response { code, lines },
                    };
                }
            },
        }
    }
}

fn parse_response_line(
    line: &[u8],
) -> Result<(u16, bool, &str), SyntaxError> {
    let Ok(line) = str::from_utf8(line) else {
        return Err(SyntaxError::new(
            pc::CommandSyntaxError,
            "Malformed UTF-8 in response",
        ));
    };

    let code = line
        .get(..3)
        .and_then(|digits| digits.parse::<u16>().ok())
        .filter(|&code| (100..600).contains(&code))
        .ok_or_else(|| {
            SyntaxError::new(
                pc::CommandSyntaxError,
                format!("Malformed response line {:?}", line),
            )
        })?;

    // A bare "ddd" line is accepted as a final line with empty text.
    if 3 == line.len() {
        return Ok((code, true, ""));
    }

    let last = match &line[3..4] {
        " " => true,
        "-" => false,
        _ => {
            return Err(SyntaxError::new(
                pc::CommandSyntaxError,
                format!("Malformed response separator in {:?}", line),
            ));
        },
    };

    Ok((code, last, &line[4..]))
}
