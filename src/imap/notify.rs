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

//! The notification multiplexer.
//!
//! A connection with a selected mailbox subscribes to the external notifier.
//! The notifier pushes pings through an unbounded channel; the connection
//! task drains the channel only between commands (and while idling), so the
//! store is never queried concurrently for the same session and updates can
//! never interleave with a partially-written command response.
//!
//! The flush algorithm in `emit_notifications` is where IMAP's sequence
//! semantics live. EXISTS and EXPUNGE mutate the sequence space the client
//! will use for its very next command, so the order in which the pending
//! updates are rendered is not negotiable; see the method comments.

use std::collections::HashSet;
use std::mem;
use std::sync::Arc;

use futures::future::BoxFuture;
use log::warn;
use tokio::sync::mpsc;

use crate::support::{error::Error, log_prefix::LogPrefix};

use super::response::{Response, ResponseLine};
use super::session::{MailboxId, SelectedMailbox, SessionId};

/// One mailbox mutation, as reported by the notifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Update {
    /// A message arrived.
    Exists { uid: u32, modseq: u64 },
    /// A message was removed.
    Expunge { uid: u32, modseq: u64 },
    /// A message's flags changed. `ignore` names the session whose own
    /// write caused the change; that session suppresses the echo.
    Fetch {
        uid: u32,
        modseq: u64,
        flags: Vec<String>,
        ignore: Option<SessionId>,
    },
}

impl Update {
    pub fn uid(&self) -> u32 {
        match *self {
            Update::Exists { uid, .. }
            | Update::Expunge { uid, .. }
            | Update::Fetch { uid, .. } => uid,
        }
    }

    pub fn modseq(&self) -> u64 {
        match *self {
            Update::Exists { modseq, .. }
            | Update::Expunge { modseq, .. }
            | Update::Fetch { modseq, .. } => modseq,
        }
    }

    fn ignore(&self) -> Option<&SessionId> {
        match *self {
            Update::Fetch { ref ignore, .. } => ignore.as_ref(),
            _ => None,
        }
    }
}

/// What the notifier pushes through a listener channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotifierEvent {
    /// The mailbox changed; pull the updates.
    Changed,
    /// The mailbox itself was deleted.
    MailboxDeleted,
}

/// The external broadcast bus announcing mailbox mutations.
///
/// The engine registers a channel sender as its listener. The sender is the
/// only reference the notifier holds; once the connection drops its receiver
/// the subscription is inert and cannot keep the connection alive.
pub trait Notifier: Send + Sync {
    fn add_listener(
        &self,
        session: &SessionId,
        mailbox: &MailboxId,
        listener: mpsc::UnboundedSender<NotifierEvent>,
    );

    fn remove_listener(&self, session: &SessionId, mailbox: &MailboxId);

    /// Fetches the updates which happened after `since_modseq`, in modseq
    /// order.
    fn get_updates<'a>(
        &'a self,
        session: &'a SessionId,
        mailbox: &'a MailboxId,
        since_modseq: u64,
    ) -> BoxFuture<'a, Result<Vec<Update>, Error>>;
}

/// Multiplexes notifier events for one connection.
pub struct NotificationMux {
    session_id: SessionId,
    notifier: Arc<dyn Notifier>,
    log_prefix: LogPrefix,
    subscription:
        Option<(MailboxId, mpsc::UnboundedReceiver<NotifierEvent>)>,
}

impl NotificationMux {
    pub fn new(
        session_id: SessionId,
        notifier: Arc<dyn Notifier>,
        log_prefix: LogPrefix,
    ) -> Self {
        NotificationMux {
            session_id,
            notifier,
            log_prefix,
            subscription: None,
        }
    }

    /// Aligns the subscription with the currently selected mailbox.
    ///
    /// Subscribing to the already-subscribed mailbox is a no-op; anything
    /// else tears the old subscription down first.
    pub fn update_listener(&mut self, selected: Option<&MailboxId>) {
        if let Some((ref current, _)) = self.subscription {
            if Some(current) == selected {
                return;
            }

            self.notifier.remove_listener(&self.session_id, current);
            self.subscription = None;
        }

        if let Some(mailbox) = selected {
            let (tx, rx) = mpsc::unbounded_channel();
            self.notifier.add_listener(&self.session_id, mailbox, tx);
            self.subscription = Some((mailbox.clone(), rx));
        }
    }

    /// Releases any subscription. Idempotent.
    pub fn release(&mut self) {
        self.update_listener(None);
    }

    /// Waits for the next notifier event.
    ///
    /// Pends forever while there is no subscription (or the notifier dropped
    /// the listener), which makes this directly usable as a `select!` arm.
    pub async fn next_event(&mut self) -> NotifierEvent {
        loop {
            match self.subscription {
                Some((_, ref mut rx)) => match rx.recv().await {
                    Some(evt) => return evt,
                    None => std::future::pending::<()>().await,
                },
                None => std::future::pending::<()>().await,
            }
        }
    }

    /// Pulls updates from the store into the pending queue.
    ///
    /// On error the queue is left as it was; a later ping retries from the
    /// same cursor.
    pub async fn pull_updates(
        &mut self,
        selected: &mut SelectedMailbox,
    ) -> Result<(), Error> {
        let updates = self
            .notifier
            .get_updates(
                &self.session_id,
                &selected.mailbox_id,
                selected.modify_index,
            )
            .await?;

        if let Some(last) = updates.last() {
            if last.modseq() > selected.modify_index {
                selected.modify_index = last.modseq();
            }
        }
        selected.notifications.extend(updates);
        Ok(())
    }

    /// Renders and drains the pending notification queue.
    ///
    /// Returns the untagged responses to write, in order. The queue is
    /// always left empty.
    ///
    /// The rules:
    ///
    /// - A UID that arrived and was expunged within the same flush is
    ///   suppressed entirely; the client never saw it.
    /// - Only the last FETCH per UID survives, and none survive for UIDs
    ///   with an EXISTS or EXPUNGE in the same flush (those dominate).
    /// - EXISTS is deferred: only the final count matters, so consecutive
    ///   EXISTSes coalesce into the last one formatted.
    /// - EXPUNGE is written immediately. An EXPUNGE after a formatted
    ///   EXISTS shifts the sequence space, so if no later EXISTS is
    ///   formatted, a fresh `* N EXISTS` is synthesized from the current
    ///   view. The synthesized response deliberately bypasses
    ///   `format_exists`: the view is already correct and must not grow.
    pub fn emit_notifications(
        &mut self,
        selected: &mut SelectedMailbox,
    ) -> Vec<ResponseLine> {
        let pending = mem::take(&mut selected.notifications);

        let mut added = HashSet::new();
        let mut removed = HashSet::new();
        for update in &pending {
            match *update {
                Update::Exists { uid, .. } => {
                    added.insert(uid);
                },
                Update::Expunge { uid, .. } => {
                    removed.insert(uid);
                },
                Update::Fetch { .. } => {},
            }
        }
        let skip: HashSet<u32> =
            added.intersection(&removed).copied().collect();

        // Coalesce FETCHes right-to-left: keep only the last per UID, and
        // none whose UID has an EXISTS or EXPUNGE in this flush.
        let mut keep = vec![true; pending.len()];
        let mut fetch_seen = HashSet::new();
        for (ix, update) in pending.iter().enumerate().rev() {
            if let Update::Fetch { uid, .. } = *update {
                if added.contains(&uid)
                    || removed.contains(&uid)
                    || !fetch_seen.insert(uid)
                {
                    keep[ix] = false;
                }
            }
        }

        let mut out = Vec::new();
        let mut deferred_exists: Option<Response> = None;
        let mut changed = false;

        for (ix, update) in pending.iter().enumerate() {
            if !keep[ix] {
                continue;
            }

            let uid = update.uid();
            if skip.contains(&uid) {
                continue;
            }

            // The cursor advances even for updates this session suppresses.
            if update.modseq() > selected.modify_index {
                selected.modify_index = update.modseq();
            }

            if update.ignore() == Some(&self.session_id) {
                continue;
            }

            match *update {
                Update::Exists { .. } => {
                    deferred_exists = Some(selected.format_exists(uid));
                    changed = false;
                },
                Update::Expunge { .. } => {
                    match selected.format_expunge(uid) {
                        Some(r) => {
                            out.push(ResponseLine::untagged(r));
                            changed = true;
                        },
                        None => {
                            // The view knows nothing of this UID. Dropping
                            // the update is the only response that cannot
                            // corrupt the sequence space.
                            warn!(
                                "{} Dropping EXPUNGE for unknown UID {} \
                                 in mailbox {}",
                                self.log_prefix, uid, selected.mailbox_id,
                            );
                        },
                    }
                },
                Update::Fetch {
                    ref flags, modseq, ..
                } => {
                    if let Some(r) =
                        selected.format_fetch(uid, flags, modseq)
                    {
                        out.push(ResponseLine::untagged(r));
                    }
                },
            }
        }

        if let Some(r) = deferred_exists {
            if !changed {
                out.push(ResponseLine::untagged(r));
            }
        }
        if changed {
            out.push(ResponseLine::untagged(Response::Exists(
                selected.exists_count(),
            )));
        }

        out
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::imap::lex::LexWriter;

    struct NullNotifier;

    impl Notifier for NullNotifier {
        fn add_listener(
            &self,
            _: &SessionId,
            _: &MailboxId,
            _: mpsc::UnboundedSender<NotifierEvent>,
        ) {
        }

        fn remove_listener(&self, _: &SessionId, _: &MailboxId) {}

        fn get_updates<'a>(
            &'a self,
            _: &'a SessionId,
            _: &'a MailboxId,
            _: u64,
        ) -> BoxFuture<'a, Result<Vec<Update>, Error>> {
            Box::pin(async { Ok(Vec::new()) })
        }
    }

    fn mux(session_id: &str) -> NotificationMux {
        NotificationMux::new(
            session_id.to_owned(),
            Arc::new(NullNotifier),
            LogPrefix::new("imap".to_owned(), session_id.to_owned()),
        )
    }

    fn selected(uids: &[u32]) -> SelectedMailbox {
        SelectedMailbox::new(
            MailboxId("mb1".to_owned()),
            uids.to_vec(),
            100,
            false,
        )
    }

    fn wire(lines: Vec<ResponseLine>) -> Vec<String> {
        lines
            .into_iter()
            .map(|mut line| {
                let mut out = Vec::<u8>::new();
                line.write_to(&mut LexWriter::new(&mut out, true)).unwrap();
                String::from_utf8(out).unwrap()
            })
            .collect()
    }

    fn exists(uid: u32, modseq: u64) -> Update {
        Update::Exists { uid, modseq }
    }

    fn expunge(uid: u32, modseq: u64) -> Update {
        Update::Expunge { uid, modseq }
    }

    fn fetch(uid: u32, modseq: u64, flags: &[&str]) -> Update {
        Update::Fetch {
            uid,
            modseq,
            flags: flags.iter().map(|&f| f.to_owned()).collect(),
            ignore: None,
        }
    }

    fn fetch_ignoring(
        uid: u32,
        modseq: u64,
        flags: &[&str],
        ignore: &str,
    ) -> Update {
        Update::Fetch {
            uid,
            modseq,
            flags: flags.iter().map(|&f| f.to_owned()).collect(),
            ignore: Some(ignore.to_owned()),
        }
    }

    #[test]
    fn consecutive_exists_coalesce() {
        let mut mux = mux("S");
        let mut mb = selected(&[10, 11]);
        mb.notifications = vec![
            exists(12, 101),
            exists(13, 102),
            exists(14, 103),
        ];

        assert_eq!(
            vec!["* 5 EXISTS".to_owned()],
            wire(mux.emit_notifications(&mut mb)),
        );
        assert_eq!(vec![10, 11, 12, 13, 14], mb.uid_list);
        assert_eq!(103, mb.modify_index);
        assert!(mb.notifications.is_empty());
    }

    #[test]
    fn exists_then_expunge_of_new_uid_is_silent() {
        let mut mux = mux("S");
        let mut mb = selected(&[10]);
        mb.notifications = vec![exists(11, 101), expunge(11, 102)];

        assert!(mux.emit_notifications(&mut mb).is_empty());
        assert_eq!(vec![10], mb.uid_list);
    }

    #[test]
    fn expunge_of_preexisting_reannounces_exists() {
        let mut mux = mux("S");
        let mut mb = selected(&[10, 11]);
        mb.notifications = vec![exists(12, 101), expunge(10, 102)];

        assert_eq!(
            vec!["* 1 EXPUNGE".to_owned(), "* 2 EXISTS".to_owned()],
            wire(mux.emit_notifications(&mut mb)),
        );
        assert_eq!(vec![11, 12], mb.uid_list);
    }

    #[test]
    fn exists_expunge_exists_emits_single_exists() {
        let mut mux = mux("S");
        let mut mb = selected(&[10, 11]);
        mb.notifications = vec![
            exists(12, 101),
            expunge(10, 102),
            exists(13, 103),
        ];

        // The final EXISTS resets the changed flag, so exactly one EXISTS
        // is written and none is synthesized.
        assert_eq!(
            vec!["* 1 EXPUNGE".to_owned(), "* 3 EXISTS".to_owned()],
            wire(mux.emit_notifications(&mut mb)),
        );
        assert_eq!(vec![11, 12, 13], mb.uid_list);
    }

    #[test]
    fn lone_expunge_reannounces_exists() {
        let mut mux = mux("S");
        let mut mb = selected(&[10, 11]);
        mb.notifications = vec![expunge(10, 101)];

        assert_eq!(
            vec!["* 1 EXPUNGE".to_owned(), "* 1 EXISTS".to_owned()],
            wire(mux.emit_notifications(&mut mb)),
        );
        assert_eq!(vec![11], mb.uid_list);
    }

    #[test]
    fn fetch_coalescing_and_echo_suppression() {
        let mut mux = mux("S");
        let mut mb = selected(&[10, 11]);
        mb.notifications = vec![
            fetch(10, 101, &["\\Seen"]),
            fetch_ignoring(10, 102, &["\\Seen", "\\Flagged"], "S"),
            fetch(11, 103, &["\\Answered"]),
        ];

        // UID 10's surviving (last) FETCH is this session's own echo, so
        // only UID 11 produces output.
        assert_eq!(
            vec![
                "* 2 FETCH (FLAGS (\\Answered) UID 11)".to_owned(),
            ],
            wire(mux.emit_notifications(&mut mb)),
        );
        // Echo suppression still advances the cursor.
        assert_eq!(103, mb.modify_index);
    }

    #[test]
    fn fetch_for_other_sessions_echo_passes() {
        let mut mux = mux("S");
        let mut mb = selected(&[10]);
        mb.notifications =
            vec![fetch_ignoring(10, 101, &["\\Seen"], "OTHER")];

        assert_eq!(
            vec!["* 1 FETCH (FLAGS (\\Seen) UID 10)".to_owned()],
            wire(mux.emit_notifications(&mut mb)),
        );
    }

    #[test]
    fn fetch_dominated_by_exists_and_expunge_is_dropped() {
        let mut mux = mux("S");
        let mut mb = selected(&[10]);
        mb.notifications = vec![
            exists(11, 101),
            fetch(11, 102, &["\\Seen"]),
            fetch(10, 103, &["\\Seen"]),
            expunge(10, 104),
        ];

        assert_eq!(
            vec!["* 1 EXPUNGE".to_owned(), "* 1 EXISTS".to_owned()],
            wire(mux.emit_notifications(&mut mb)),
        );
        assert_eq!(vec![11], mb.uid_list);
    }

    #[test]
    fn expunge_for_unknown_uid_is_dropped() {
        let mut mux = mux("S");
        let mut mb = selected(&[10]);
        mb.notifications = vec![expunge(99, 101)];

        assert!(mux.emit_notifications(&mut mb).is_empty());
        assert_eq!(vec![10], mb.uid_list);
        assert_eq!(101, mb.modify_index);
    }

    #[test]
    fn modseq_never_regresses() {
        let mut mux = mux("S");
        let mut mb = selected(&[10]);
        mb.modify_index = 500;
        mb.notifications = vec![fetch(10, 101, &["\\Seen"])];

        mux.emit_notifications(&mut mb);
        assert_eq!(500, mb.modify_index);
    }

    #[test]
    fn condstore_adds_modseq_to_fetch() {
        let mut mux = mux("S");
        let mut mb = selected(&[10]);
        mb.condstore_enabled = true;
        mb.notifications = vec![fetch(10, 101, &["\\Seen"])];

        assert_eq!(
            vec![
                "* 1 FETCH (FLAGS (\\Seen) UID 10 MODSEQ (101))".to_owned(),
            ],
            wire(mux.emit_notifications(&mut mb)),
        );
    }

    #[test]
    fn uid_list_length_tracks_announced_exists() {
        // Invariant: after any flush, the view's length equals the last
        // EXISTS count written (or is unchanged if none was written).
        let mut mux = mux("S");
        let mut mb = selected(&[10, 11, 12]);
        mb.notifications = vec![
            exists(13, 101),
            expunge(11, 102),
            exists(14, 103),
            expunge(13, 104),
        ];

        let out = wire(mux.emit_notifications(&mut mb));
        let last_exists = out
            .iter()
            .rev()
            .find(|l| l.ends_with("EXISTS"))
            .expect("no EXISTS announced");
        assert_eq!(
            format!("* {} EXISTS", mb.uid_list.len()),
            *last_exists,
        );
    }
}
