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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// for one session.
///
/// Clones of a `LogPrefix` share the same underlying data.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    protocol: String,
    peer: Option<String>,
    helo: Option<String>,
}

impl LogPrefix {
    pub fn new(protocol: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                protocol,
                peer: None,
                helo: None,
            })),
        }
    }

    /// Sets the address or name of the remote end.
    pub fn set_peer(&self, peer: String) {
        self.inner.lock().unwrap().peer = Some(peer);
    }

    /// Sets the name the remote end announced in HELO/EHLO.
    pub fn set_helo(&self, helo: String) {
        self.inner.lock().unwrap().helo = Some(helo);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}", inner.protocol)?;
        if inner.peer.is_some() || inner.helo.is_some() {
            write!(f, "[{}", inner.peer.as_deref().unwrap_or("<unknown>"))?;
            if let Some(ref helo) = inner.helo {
                write!(f, " helo={}", helo)?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}
