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

//! Envelope routes: the `<...>` argument of MAIL and RCPT.

use std::collections::BTreeMap;
use std::fmt;

/// A parsed reverse-path or forward-path, plus any ESMTP parameters that
/// followed it on the command line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvelopeRoute {
    /// The mailbox, or `None` for the `<>` null reverse-path. The special
    /// recipient `postmaster` appears as a bare mailbox with no domain
    /// part.
    pub mailbox: Option<String>,
    /// Obsolete source route: the domains of `<@relay1,@relay2:user@host>`,
    /// in order.
    pub route: Vec<String>,
    /// `NAME` or `NAME=VALUE` parameters. Later duplicates overwrite.
    pub parameters: BTreeMap<String, Option<String>>,
}

impl EnvelopeRoute {
    /// The `<>` null reverse-path.
    pub fn null() -> Self {
        Self::default()
    }

    /// A plain mailbox with no source route and no parameters.
    pub fn mailbox(mailbox: impl Into<String>) -> Self {
        EnvelopeRoute {
            mailbox: Some(mailbox.into()),
            ..Self::default()
        }
    }

    pub fn is_null(&self) -> bool {
        self.mailbox.is_none()
    }

    /// Whether this is the special `postmaster` recipient.
    ///
    /// Any ordinary mailbox contains `@`, so a bare comparison suffices.
    pub fn is_postmaster(&self) -> bool {
        self.mailbox
            .as_deref()
            .is_some_and(|m| m.eq_ignore_ascii_case("postmaster"))
    }

    /// Appends the ` NAME[=VALUE]` parameter suffix, if any.
    pub(crate) fn render_parameters(&self, out: &mut String) {
        for (name, value) in &self.parameters {
            out.push(' ');
            out.push_str(name);
            if let Some(value) = value {
                out.push('=');
                out.push_str(value);
            }
        }
    }
}

impl fmt::Display for EnvelopeRoute {
    /// Renders the angle-bracketed path, without parameters.
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("<")?;
        for (ix, domain) in self.route.iter().enumerate() {
            if ix > 0 {
                f.write_str(",")?;
            }
            write!(f, "@{}", domain)?;
        }
        if !self.route.is_empty() {
            f.write_str(":")?;
        }
        if let Some(ref mailbox) = self.mailbox {
            f.write_str(mailbox)?;
        }
        f.write_str(">")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn rendering() {
        assert_eq!("<>", EnvelopeRoute::null().to_string());
        assert_eq!(
            "<user@example.com>",
            EnvelopeRoute::mailbox("user@example.com").to_string(),
        );

        let routed = EnvelopeRoute {
            mailbox: Some("user@example.com".to_owned()),
            route: vec!["relay1.org".to_owned(), "relay2.org".to_owned()],
            parameters: BTreeMap::new(),
        };
        assert_eq!(
            "<@relay1.org,@relay2.org:user@example.com>",
            routed.to_string(),
        );
    }

    #[test]
    fn parameter_rendering() {
        let mut route = EnvelopeRoute::mailbox("user@example.com");
        route.parameters.insert("SIZE".to_owned(), Some("42".to_owned()));
        route.parameters.insert("BODY".to_owned(), None);

        let mut s = route.to_string();
        route.render_parameters(&mut s);
        assert_eq!("<user@example.com> BODY SIZE=42", s);
    }

    #[test]
    fn postmaster_detection() {
        assert!(EnvelopeRoute::mailbox("postmaster").is_postmaster());
        assert!(EnvelopeRoute::mailbox("Postmaster").is_postmaster());
        assert!(!EnvelopeRoute::mailbox("postmaster@example.com")
            .is_postmaster());
        assert!(!EnvelopeRoute::null().is_postmaster());
    }
}
