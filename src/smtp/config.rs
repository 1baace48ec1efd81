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

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration shared by the client and server engines.
///
/// Every field has a default. The crate reads no files and no environment;
/// embedding applications deserialise this from wherever they keep their
/// own configuration, or build it in code.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SmtpConfig {
    /// Longest accepted command line, in bytes including the terminator.
    ///
    /// Over-long lines draw a 500 response and are discarded.
    #[serde(default = "default_line_length_limit")]
    pub line_length_limit: u32,

    /// Largest accepted message body, in decoded bytes.
    #[serde(default = "default_message_size_limit")]
    pub message_size_limit: u64,

    /// Most forward paths accepted for one transaction.
    #[serde(default = "default_recipient_limit")]
    pub recipient_limit: u32,

    /// Keywords the server advertises in its EHLO response, in key order.
    #[serde(default)]
    pub server_ehlo_keywords: BTreeMap<String, EhloValue>,

    /// Text of the 220 greeting. The default banner names this crate and
    /// the server domain.
    #[serde(default)]
    pub greeting: Option<String>,

    /// Directory used when a message body spills to disk.
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,

    /// Body bytes kept in memory before spilling to `tmp_dir`.
    #[serde(default = "default_spill_threshold")]
    pub spill_threshold: usize,

    /// The domain this server reports as its own.
    #[serde(default = "default_server_domain")]
    pub server_domain: String,

    /// Textual address of the server end, for reply text and transaction
    /// records.
    #[serde(default)]
    pub server_address: String,

    /// The name the server announces in its HELO/EHLO reply. Empty means
    /// `server_domain`.
    #[serde(default)]
    pub server_helo: String,

    /// The domain the client end belongs to.
    #[serde(default)]
    pub client_domain: String,

    /// Textual address of the client end.
    #[serde(default)]
    pub client_address: String,

    /// The default argument for the client's EHLO/HELO. Empty means
    /// `client_domain`.
    #[serde(default)]
    pub client_helo: String,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        SmtpConfig {
            line_length_limit: default_line_length_limit(),
            message_size_limit: default_message_size_limit(),
            recipient_limit: default_recipient_limit(),
            server_ehlo_keywords: BTreeMap::new(),
            greeting: None,
            tmp_dir: default_tmp_dir(),
            spill_threshold: default_spill_threshold(),
            server_domain: default_server_domain(),
            server_address: String::new(),
            server_helo: String::new(),
            client_domain: String::new(),
            client_address: String::new(),
            client_helo: String::new(),
        }
    }
}

impl SmtpConfig {
    /// The text of the 220 greeting line.
    pub fn greeting_line(&self) -> String {
        match self.greeting {
            Some(ref greeting) => greeting.clone(),
            None => format!(
                "{} ESMTP {} {} service ready",
                self.server_domain,
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
            ),
        }
    }

    /// The name the server announces in its HELO/EHLO reply.
    pub fn effective_server_helo(&self) -> &str {
        if self.server_helo.is_empty() {
            &self.server_domain
        } else {
            &self.server_helo
        }
    }

    /// The default argument for the client's EHLO/HELO.
    pub fn effective_client_helo(&self) -> &str {
        if self.client_helo.is_empty() {
            &self.client_domain
        } else {
            &self.client_helo
        }
    }
}

/// Value advertised with an EHLO keyword.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum EhloValue {
    /// Pre-rendered parameter text; the empty string renders the bare
    /// keyword. Keyword-specific parameter formats are produced by
    /// pre-rendering into this variant.
    Value(String),
    /// Parameters joined by single spaces.
    List(Vec<String>),
}

impl EhloValue {
    /// Renders one line of the multi-line EHLO response.
    pub fn render(&self, keyword: &str) -> String {
        let text = match *self {
            EhloValue::Value(ref s) => s.clone(),
            EhloValue::List(ref items) => items.join(" "),
        };

        if text.is_empty() {
            keyword.to_owned()
        } else {
            format!("{} {}", keyword, text)
        }
    }
}

fn default_line_length_limit() -> u32 {
    1000
}

fn default_message_size_limit() -> u64 {
    10 * 1024 * 1024
}

fn default_recipient_limit() -> u32 {
    1024
}

fn default_tmp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_spill_threshold() -> usize {
    crate::support::buffer::DEFAULT_SPILL_THRESHOLD
}

fn default_server_domain() -> String {
    "localhost".to_owned()
}
