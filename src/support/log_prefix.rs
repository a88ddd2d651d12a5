//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Skua.
//
// Skua is free software: you can  redistribute it and/or  modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Skua is distributed  in the hope that  it will  be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Skua. If not, see <http://www.gnu.org/licenses/>.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement.
///
/// Clones of a `LogPrefix` share the same underlying data, so the connection
/// can hand copies to its sub-components and later enrich the prefix (resolved
/// hostname, authenticated user) in one place.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    protocol: String,
    session: String,
    host: Option<String>,
    user: Option<String>,
}

impl LogPrefix {
    pub fn new(protocol: String, session: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                protocol,
                session,
                host: None,
                user: None,
            })),
        }
    }

    pub fn set_host(&self, host: String) {
        self.inner.lock().unwrap().host = Some(host);
    }

    pub fn set_user(&self, user: String) {
        self.inner.lock().unwrap().user = Some(user);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "{}:{}", inner.protocol, inner.session)?;
        if inner.host.is_some() || inner.user.is_some() {
            write!(
                f,
                "[{}{}{}]",
                inner.user.as_deref().unwrap_or("<anon>"),
                if inner.host.is_some() { "@" } else { "" },
                inner.host.as_deref().unwrap_or(""),
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefix_formatting() {
        let prefix = LogPrefix::new("imap".to_owned(), "AbCdEf".to_owned());
        assert_eq!("imap:AbCdEf", prefix.to_string());

        prefix.set_host("mail.example.com".to_owned());
        assert_eq!("imap:AbCdEf[<anon>@mail.example.com]", prefix.to_string());

        prefix.set_user("azure".to_owned());
        assert_eq!("imap:AbCdEf[azure@mail.example.com]", prefix.to_string());
    }
}
