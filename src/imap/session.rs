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

//! The per-connection session record and the selected-mailbox snapshot.
//!
//! `SelectedMailbox` owns the client-visible view of the mailbox: the UID
//! list whose indices are the sequence numbers the client sees. All sequence
//! arithmetic happens through the `format_*` methods so that the view can
//! never drift from what was actually written to the wire.

use std::borrow::Cow;
use std::fmt;
use std::net::IpAddr;

use rand::{rngs::OsRng, Rng};

use super::notify::Update;
use super::response::{Attr, Response};

pub type SessionId = String;

/// Generates a fresh session id: 9 random bytes, base64.
pub fn generate_session_id() -> SessionId {
    let mut bytes = [0u8; 9];
    OsRng.fill(&mut bytes[..]);
    base64::encode_config(bytes, base64::STANDARD_NO_PAD)
}

/// An opaque handle addressing a mailbox within the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MailboxId(pub String);

impl fmt::Display for MailboxId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The canonical IMAP connection states, plus the terminal one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
    Closed,
}

/// Snapshot of the mailbox the client has SELECTed.
#[derive(Debug)]
pub struct SelectedMailbox {
    pub mailbox_id: MailboxId,
    /// The client-visible view: `uid_list[i]` is the UID at IMAP sequence
    /// number `i + 1`. Its length always equals the last EXISTS count the
    /// client has seen (or will see once the current flush is written).
    pub uid_list: Vec<u32>,
    /// HIGHESTMODSEQ cursor. Monotonically non-decreasing.
    pub modify_index: u64,
    /// Whether MODSEQ is reported in FETCH responses.
    pub condstore_enabled: bool,
    /// Updates awaiting the next notification flush.
    pub notifications: Vec<Update>,
}

impl SelectedMailbox {
    pub fn new(
        mailbox_id: MailboxId,
        uid_list: Vec<u32>,
        modify_index: u64,
        condstore_enabled: bool,
    ) -> Self {
        SelectedMailbox {
            mailbox_id,
            uid_list,
            modify_index,
            condstore_enabled,
            notifications: Vec::new(),
        }
    }

    pub fn exists_count(&self) -> u32 {
        self.uid_list.len() as u32
    }

    /// The sequence number of `uid`, if it is in the client's view.
    pub fn seq_of(&self, uid: u32) -> Option<u32> {
        self.uid_list
            .iter()
            .position(|&u| u == uid)
            .map(|ix| ix as u32 + 1)
    }

    /// Formats an EXISTS notification for a newly arrived `uid`.
    ///
    /// The UID joins the view; the response announces the new count.
    pub fn format_exists(&mut self, uid: u32) -> Response {
        self.uid_list.push(uid);
        Response::Exists(self.exists_count())
    }

    /// Formats an EXPUNGE notification for `uid`.
    ///
    /// The UID leaves the view, shifting every later sequence number down by
    /// one. An EXPUNGE for a UID the client never saw is a no-op.
    pub fn format_expunge(&mut self, uid: u32) -> Option<Response> {
        let ix = self.uid_list.iter().position(|&u| u == uid)?;
        self.uid_list.remove(ix);
        Some(Response::Expunge(ix as u32 + 1))
    }

    /// Formats an unsolicited FETCH notification for `uid`.
    ///
    /// A FETCH for a UID outside the client's view is dropped.
    pub fn format_fetch(
        &self,
        uid: u32,
        flags: &[String],
        modseq: u64,
    ) -> Option<Response> {
        let seq = self.seq_of(uid)?;
        let mut attributes = vec![
            Attr::atom("FLAGS"),
            Attr::List(
                flags
                    .iter()
                    .map(|f| Attr::Atom(Cow::Owned(f.clone())))
                    .collect(),
            ),
            Attr::atom("UID"),
            Attr::Num(u64::from(uid)),
        ];
        if self.condstore_enabled {
            attributes.push(Attr::atom("MODSEQ"));
            attributes.push(Attr::List(vec![Attr::Num(modseq)]));
        }

        Some(Response::Fetch { seq, attributes })
    }

    /// Formats the response for one update record, applying the sequence
    /// bookkeeping that goes with its kind.
    pub fn format_update(&mut self, update: &Update) -> Option<Response> {
        match *update {
            Update::Exists { uid, .. } => Some(self.format_exists(uid)),
            Update::Expunge { uid, .. } => self.format_expunge(uid),
            Update::Fetch {
                uid,
                modseq,
                ref flags,
                ..
            } => self.format_fetch(uid, flags, modseq),
        }
    }
}

/// The per-connection session record.
pub struct Session {
    pub id: SessionId,
    pub state: SessionState,
    pub remote_address: IpAddr,
    /// Resolved client hostname, or the bracketed IP literal.
    pub client_hostname: Option<String>,
    pub selected: Option<SelectedMailbox>,
    /// Whether the client has enabled `UTF8=ACCEPT`.
    pub utf8_enabled: bool,
    /// Whether COMPRESS=DEFLATE is active.
    pub compressing: bool,
    /// Whether the client is in IDLE; suspends idle-timeout enforcement.
    pub idling: bool,
    /// While true, no inbound command is dispatched.
    pub upgrading: bool,
    /// Whether the transport is TLS.
    pub secure: bool,
}

static BASE_CAPABILITIES: &[&str] = &[
    "IMAP4rev1",
    "LITERAL+",
    "IDLE",
    "CONDSTORE",
    "UTF8=ACCEPT",
    "COMPRESS=DEFLATE",
];

impl Session {
    pub fn new(remote_address: IpAddr, secure: bool) -> Self {
        Session {
            id: generate_session_id(),
            state: SessionState::NotAuthenticated,
            remote_address,
            client_hostname: None,
            selected: None,
            utf8_enabled: false,
            compressing: false,
            idling: false,
            upgrading: false,
            secure,
        }
    }

    /// The capabilities currently offered to this session.
    pub fn capabilities(&self) -> Vec<&'static str> {
        let mut caps = BASE_CAPABILITIES.to_vec();
        if !self.secure {
            caps.push("STARTTLS");
        }
        caps
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn selected(uids: &[u32]) -> SelectedMailbox {
        SelectedMailbox::new(
            MailboxId("mb1".to_owned()),
            uids.to_vec(),
            100,
            false,
        )
    }

    #[test]
    fn session_ids_are_distinct_and_sized() {
        let a = generate_session_id();
        let b = generate_session_id();
        // 9 bytes of entropy encode to 12 base64 characters.
        assert_eq!(12, a.len());
        assert_ne!(a, b);
    }

    #[test]
    fn exists_appends_and_announces_count() {
        let mut mb = selected(&[10, 11]);
        let r = mb.format_exists(12);
        assert!(matches!(r, Response::Exists(3)));
        assert_eq!(vec![10, 11, 12], mb.uid_list);
        assert_eq!(3, mb.exists_count());
    }

    #[test]
    fn expunge_removes_and_shifts() {
        let mut mb = selected(&[10, 11, 12]);
        let r = mb.format_expunge(10).unwrap();
        assert!(matches!(r, Response::Expunge(1)));
        assert_eq!(vec![11, 12], mb.uid_list);

        // Sequence numbers shifted: 12 is now sequence 2.
        assert_eq!(Some(2), mb.seq_of(12));
    }

    #[test]
    fn expunge_of_unknown_uid_is_noop() {
        let mut mb = selected(&[10, 11]);
        assert!(mb.format_expunge(99).is_none());
        assert_eq!(vec![10, 11], mb.uid_list);
    }

    #[test]
    fn fetch_addresses_by_sequence() {
        let mb = selected(&[10, 11]);
        let r = mb
            .format_fetch(11, &["\\Seen".to_owned()], 105)
            .unwrap();
        match r {
            Response::Fetch { seq, attributes } => {
                assert_eq!(2, seq);
                // No MODSEQ without CONDSTORE.
                assert_eq!(4, attributes.len());
            },
            r => panic!("unexpected response: {:?}", r),
        }

        assert!(mb.format_fetch(99, &[], 105).is_none());
    }

    #[test]
    fn fetch_reports_modseq_with_condstore() {
        let mut mb = selected(&[10]);
        mb.condstore_enabled = true;
        let r = mb.format_fetch(10, &[], 105).unwrap();
        match r {
            Response::Fetch { attributes, .. } => {
                assert_eq!(6, attributes.len());
            },
            r => panic!("unexpected response: {:?}", r),
        }
    }

    #[test]
    fn starttls_advertised_only_on_cleartext() {
        let clear = Session::new("127.0.0.1".parse().unwrap(), false);
        assert!(clear.capabilities().contains(&"STARTTLS"));

        let tls = Session::new("127.0.0.1".parse().unwrap(), true);
        assert!(!tls.capabilities().contains(&"STARTTLS"));
    }
}
