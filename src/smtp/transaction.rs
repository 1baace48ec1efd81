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

use std::collections::BTreeMap;

use super::config::{EhloValue, SmtpConfig};
use super::route::EnvelopeRoute;
use crate::support::buffer::BodyWriter;

/// One mail transaction: a MAIL command, its RCPTs, and the message body.
///
/// Created when MAIL is accepted; destroyed by RSET, QUIT, session abort,
/// or rejection at end-of-data. The session identity fields are snapshots
/// taken at MAIL time.
pub struct Transaction {
    pub server_helo: Option<String>,
    pub server_ehlo_keywords: BTreeMap<String, EhloValue>,
    pub server_domain: String,
    pub server_address: String,
    pub client_helo: Option<String>,
    pub client_domain: String,
    pub client_address: String,
    pub reverse_path: EnvelopeRoute,
    /// Accepted forward paths, in the order the RCPTs arrived.
    pub forward_paths: Vec<EnvelopeRoute>,
    /// Sink for the decoded message body.
    pub data: BodyWriter,
}

impl Transaction {
    pub(crate) fn new(
        config: &SmtpConfig,
        client_helo: Option<&str>,
        reverse_path: EnvelopeRoute,
    ) -> Self {
        Transaction {
            server_helo: Some(config.effective_server_helo().to_owned()),
            server_ehlo_keywords: config.server_ehlo_keywords.clone(),
            server_domain: config.server_domain.clone(),
            server_address: config.server_address.clone(),
            client_helo: client_helo.map(str::to_owned),
            client_domain: config.client_domain.clone(),
            client_address: config.client_address.clone(),
            reverse_path,
            forward_paths: Vec::new(),
            data: BodyWriter::new(
                config.tmp_dir.clone(),
                config.spill_threshold,
            ),
        }
    }
}
