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

//! The engine-wide context shared by all connections: options, the handler
//! registry, and the seams to the store, the notifier, and the transport
//! upgrade mechanism.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

use crate::support::{dns, error::Error};

use super::command::Command;
use super::connection::{Connection, SessionHandle};
use super::notify::Notifier;
use super::response::{Attr, Response};
use super::session::{MailboxId, SessionId, SessionState};
use super::writer::BoxWrite;

/// The read half of the transport, as consumed by the framer.
pub type BoxRead = Box<dyn AsyncRead + Send + Unpin>;

/// Engine options.
///
/// The embedder constructs or deserialises this; the engine itself loads no
/// files.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Options {
    /// The server name announced in the greeting.
    #[serde(default = "defaults::name")]
    pub name: String,
    /// An identifier for this server instance, used in logs.
    #[serde(default = "defaults::name")]
    pub id: String,
    /// Whether connections arrive already wrapped in TLS.
    #[serde(default)]
    pub secure: bool,
    /// Seconds of client silence before the connection is timed out.
    /// Suspended while the client is in IDLE.
    #[serde(default = "defaults::socket_timeout_secs")]
    pub socket_timeout_secs: u64,
    /// Maximum length of a logical command line, in bytes, literal payloads
    /// excluded.
    #[serde(default = "defaults::max_command_line")]
    pub max_command_line: usize,
    /// Maximum size of a single literal payload, in bytes.
    #[serde(default = "defaults::max_literal")]
    pub max_literal: u32,
    /// Seconds allowed for the reverse DNS lookup before giving up.
    #[serde(default = "defaults::dns_timeout_secs")]
    pub dns_timeout_secs: u64,
}

mod defaults {
    pub fn name() -> String {
        "skua".to_owned()
    }

    pub fn socket_timeout_secs() -> u64 {
        30 * 60
    }

    pub fn max_command_line() -> usize {
        crate::imap::frame::DEFAULT_MAX_COMMAND_LINE
    }

    pub fn max_literal() -> u32 {
        crate::imap::frame::DEFAULT_MAX_LITERAL
    }

    pub fn dns_timeout_secs() -> u64 {
        5
    }
}

impl Default for Options {
    fn default() -> Self {
        Options {
            name: defaults::name(),
            id: defaults::name(),
            secure: false,
            socket_timeout_secs: defaults::socket_timeout_secs(),
            max_command_line: defaults::max_command_line(),
            max_literal: defaults::max_literal(),
            dns_timeout_secs: defaults::dns_timeout_secs(),
        }
    }
}

impl Options {
    pub fn socket_timeout(&self) -> Duration {
        Duration::from_secs(self.socket_timeout_secs)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_secs(self.dns_timeout_secs)
    }
}

/// A command handler, registered by verb.
///
/// Handlers receive the parsed command and a session handle; they return the
/// tagged completion (or an error the engine maps to one). Untagged data
/// responses go through `SessionHandle::send` as the handler produces them.
pub trait Handler: Send + Sync {
    /// The session states in which this command is valid.
    fn allowed_states(&self) -> &'static [SessionState];

    fn handle<'a, 's: 'a>(
        &'a self,
        cmd: Command,
        session: &'a mut SessionHandle<'s>,
    ) -> BoxFuture<'a, Result<Response, Error>>;
}

/// The mailbox/message store, as far as the engine can see it.
///
/// The engine never interprets queries or results; it only plumbs them
/// between handlers and the store.
pub trait Store: Send + Sync {
    fn get_query_response<'a>(
        &'a self,
        session: &'a SessionId,
        mailbox: &'a MailboxId,
        uid: u32,
        query: &'a str,
    ) -> BoxFuture<'a, Result<Vec<Attr>, Error>>;

    fn match_search_query<'a>(
        &'a self,
        session: &'a SessionId,
        mailbox: &'a MailboxId,
        uid: u32,
        query: &'a str,
    ) -> BoxFuture<'a, Result<bool, Error>>;
}

/// Upgrades the transport for STARTTLS.
///
/// Invoked at the quiescent boundary: the tagged OK has been flushed, the
/// read buffer is empty, and no bytes will be consumed until the upgraded
/// halves are installed.
pub trait TransportUpgrade: Send + Sync {
    fn upgrade(
        &self,
        read: BoxRead,
        write: BoxWrite,
    ) -> BoxFuture<'static, std::io::Result<(BoxRead, BoxWrite)>>;
}

/// Signature of the post-flush notification hook.
pub type OnNotifications =
    Arc<dyn Fn(&MailboxId, u64, &SessionId) + Send + Sync>;

pub struct Server {
    pub options: Options,
    pub(crate) handlers: HashMap<String, Box<dyn Handler>>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) upgrade: Option<Box<dyn TransportUpgrade>>,
    pub(crate) on_notifications: Option<OnNotifications>,
    pub(crate) resolver: Option<dns::Resolver>,
    pub(crate) connections: Mutex<HashSet<SessionId>>,
}

impl Server {
    pub fn new(
        options: Options,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn Store>,
    ) -> Self {
        Server {
            options,
            handlers: HashMap::new(),
            notifier,
            store,
            upgrade: None,
            on_notifications: None,
            resolver: None,
            connections: Mutex::new(HashSet::new()),
        }
    }

    /// Registers `handler` for `verb` (case-insensitive). Multi-word verbs
    /// such as `UID FETCH` are registered as one string.
    pub fn register(
        &mut self,
        verb: &str,
        handler: Box<dyn Handler>,
    ) -> &mut Self {
        self.handlers.insert(verb.to_ascii_uppercase(), handler);
        self
    }

    pub fn set_transport_upgrade(
        &mut self,
        upgrade: Box<dyn TransportUpgrade>,
    ) -> &mut Self {
        self.upgrade = Some(upgrade);
        self
    }

    pub fn set_on_notifications(
        &mut self,
        hook: OnNotifications,
    ) -> &mut Self {
        self.on_notifications = Some(hook);
        self
    }

    pub fn set_resolver(&mut self, resolver: dns::Resolver) -> &mut Self {
        self.resolver = Some(resolver);
        self
    }

    /// The number of connections currently registered.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }

    /// Runs one client connection to completion.
    ///
    /// This is the whole per-connection lifecycle: returns once the
    /// connection has been torn down.
    pub async fn serve_connection(
        self: Arc<Self>,
        read: BoxRead,
        write: BoxWrite,
        peer: IpAddr,
    ) {
        Connection::run(self, read, write, peer).await;
    }
}
