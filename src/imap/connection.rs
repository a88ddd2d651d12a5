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

//! The per-connection controller.
//!
//! One cooperative task owns the whole conversation: it drives the framer,
//! assembles and dispatches commands, drains the notifier side channel
//! between commands, and tears everything down exactly once. The egress
//! actor is the only other task, and it is fed solely through this task's
//! channel, which is what gives the ordering guarantees their teeth.

use std::borrow::Cow;
use std::io;
use std::mem;
use std::net::IpAddr;
use std::sync::Arc;

use log::{error, info, warn};
use tokio::io::AsyncRead;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::support::{dns, error::Error, log_prefix::LogPrefix};

use super::command::{Argument, Assembler, Command};
use super::frame::{CompressionStatus, FrameReader};
use super::notify::{NotificationMux, NotifierEvent, Update};
use super::response::{
    Attr, CondResponse, DataResponse, RespCondType, RespTextCode, Response,
    ResponseLine,
};
use super::server::{BoxRead, Server};
use super::session::{
    SelectedMailbox, Session, SessionId, SessionState,
};
use super::writer::{
    write_responses, OutputControl, OutputDisconnect, OutputEvent,
};

/// How big a backlog of output events a connection may accumulate before the
/// producing side is backpressured.
const OUTPUT_QUEUE_DEPTH: usize = 64;

pub struct Connection {
    server: Arc<Server>,
    session: Session,
    framer: FrameReader<BoxRead>,
    asm: Assembler,
    out: mpsc::Sender<OutputEvent>,
    writer: tokio::task::JoinHandle<io::Result<OutputDisconnect>>,
    mux: NotificationMux,
    log_prefix: LogPrefix,
    sent_bye: bool,
    released: bool,
    /// When the idle timeout fires. Pushed forward by client activity.
    deadline: Instant,
}

impl Connection {
    /// Runs one connection from accept to teardown.
    pub(crate) async fn run(
        server: Arc<Server>,
        read: BoxRead,
        write: super::writer::BoxWrite,
        peer: IpAddr,
    ) {
        let session = Session::new(peer, server.options.secure);
        let log_prefix =
            LogPrefix::new("imap".to_owned(), session.id.clone());
        info!("{} Connection established from {}", log_prefix, peer);

        server
            .connections
            .lock()
            .unwrap()
            .insert(session.id.clone());

        let (out, outputs) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        let writer = tokio::spawn(write_responses(write, outputs));

        let framer = FrameReader::new(
            read,
            server.options.max_command_line,
            server.options.max_literal,
        );
        let asm = Assembler::new(server.options.max_command_line);
        let mux = NotificationMux::new(
            session.id.clone(),
            Arc::clone(&server.notifier),
            log_prefix.clone(),
        );
        let deadline = Instant::now() + server.options.socket_timeout();

        let mut conn = Connection {
            server,
            session,
            framer,
            asm,
            out,
            writer,
            mux,
            log_prefix,
            sent_bye: false,
            released: false,
            deadline,
        };

        match conn.run_inner().await {
            Ok(()) => info!("{} Normal disconnect", conn.log_prefix),
            Err(ref e) if e.is_silent_disconnect() => {
                info!("{} Connection lost: {}", conn.log_prefix, e)
            },
            Err(e) => error!("{} Connection failed: {}", conn.log_prefix, e),
        }

        conn.shutdown().await;
    }

    async fn run_inner(&mut self) -> Result<(), Error> {
        // Reverse DNS races the client's first byte: a client that talks
        // before we've greeted it is out of protocol.
        let resolve = dns::client_hostname(
            self.server.resolver.as_ref(),
            self.session.remote_address,
            self.server.options.dns_timeout(),
        );
        match greeting_gate(&mut self.framer, resolve).await? {
            GateOutcome::Resolved(host) => {
                self.log_prefix.set_host(host.clone());
                self.session.client_hostname = Some(host);
            },
            GateOutcome::EarlyTalker => {
                info!("{} Client sent data before greeting", self.log_prefix);
                self.send_ctl(
                    ResponseLine::untagged(Response::bad(
                        "You talk too soon",
                    )),
                    OutputControl::Disconnect,
                )
                .await?;
                return Ok(());
            },
        }

        self.send_ctl(
            ResponseLine::untagged(Response::ok(format!(
                "{} ready",
                self.server.options.name,
            ))),
            OutputControl::Flush,
        )
        .await?;

        self.deadline = Instant::now() + self.server.options.socket_timeout();

        while !self.done() {
            tokio::select! {
                biased;

                evt = self.mux.next_event() => {
                    self.on_notifier_event(evt).await?;
                },

                r = self.framer.wait_for_input() => {
                    r?;
                    let inbound = read_command(
                        &mut self.framer,
                        &mut self.asm,
                        &self.out,
                    )
                    .await?;
                    self.deadline = Instant::now()
                        + self.server.options.socket_timeout();
                    self.handle_inbound(inbound).await?;
                },

                _ = tokio::time::sleep_until(self.deadline),
                    if !self.session.idling =>
                {
                    self.send_ctl(
                        ResponseLine::untagged(Response::bye(
                            "Idle timeout, closing connection",
                        )),
                        OutputControl::Disconnect,
                    )
                    .await?;
                    return Ok(());
                },
            }
        }

        Ok(())
    }

    fn done(&self) -> bool {
        self.sent_bye
            || matches!(
                self.session.state,
                SessionState::Logout | SessionState::Closed,
            )
    }

    async fn handle_inbound(&mut self, inbound: Inbound) -> Result<(), Error> {
        match inbound {
            Inbound::Command(cmd) => self.dispatch(cmd).await,

            Inbound::BadSyntax { tag } => {
                self.reject(
                    tag,
                    Response::Cond(CondResponse {
                        cond: RespCondType::Bad,
                        code: Some(RespTextCode::Parse),
                        quip: Some(Cow::Borrowed(
                            "Unrecognised command syntax",
                        )),
                    }),
                )
                .await
            },

            Inbound::BadLiteral { tag } => {
                self.reject(
                    tag,
                    Response::Cond(CondResponse {
                        cond: RespCondType::Bad,
                        code: Some(RespTextCode::Parse),
                        quip: Some(Cow::Borrowed(
                            "Malformed literal declaration",
                        )),
                    }),
                )
                .await
            },

            Inbound::LiteralTooLarge { tag } => {
                self.reject(
                    tag,
                    Response::Cond(CondResponse {
                        cond: RespCondType::Bad,
                        code: Some(RespTextCode::Limit),
                        quip: Some(Cow::Borrowed("Literal too large")),
                    }),
                )
                .await
            },

            Inbound::TooLong { tag: Some(tag) } => {
                self.send_ctl(
                    ResponseLine::tagged(
                        tag,
                        Response::no("Command line too long"),
                    ),
                    OutputControl::Flush,
                )
                .await
            },

            Inbound::TooLong { tag: None } => {
                // Without a tag there is no way to address an error to the
                // command, so the protocol state is unrecoverable.
                self.send_ctl(
                    ResponseLine::untagged(Response::bye(
                        "That doesn't look anything like an IMAP command!",
                    )),
                    OutputControl::Disconnect,
                )
                .await
            },
        }
    }

    async fn reject(
        &mut self,
        tag: Option<String>,
        response: Response,
    ) -> Result<(), Error> {
        let line = match tag {
            Some(tag) => ResponseLine::tagged(tag, response),
            None => ResponseLine::untagged(response),
        };
        self.send_ctl(line, OutputControl::Flush).await
    }

    async fn dispatch(&mut self, cmd: Command) -> Result<(), Error> {
        if self.session.upgrading {
            let tag = cmd.tag;
            return self
                .send_ctl(
                    ResponseLine::tagged(
                        tag,
                        Response::bad("Connection upgrade in progress"),
                    ),
                    OutputControl::Flush,
                )
                .await;
        }

        // A few verbs read or mutate engine-owned state (capability flags,
        // the stream transforms, the idling flag, shutdown itself) and so
        // cannot be delegated.
        match cmd.verb.as_str() {
            "CAPABILITY" => self.cmd_capability(cmd).await,
            "LOGOUT" => self.cmd_logout(cmd).await,
            "COMPRESS" => self.cmd_compress(cmd).await,
            "STARTTLS" => self.cmd_starttls(cmd).await,
            "IDLE" => self.cmd_idle(cmd).await,
            _ => self.dispatch_handler(cmd).await,
        }
    }

    async fn dispatch_handler(&mut self, cmd: Command) -> Result<(), Error> {
        let server = Arc::clone(&self.server);
        let Some(handler) = server.handlers.get(&cmd.verb) else {
            let tag = cmd.tag;
            return self
                .send_ctl(
                    ResponseLine::tagged(
                        tag,
                        Response::bad("Unknown command"),
                    ),
                    OutputControl::Flush,
                )
                .await;
        };

        if !handler.allowed_states().contains(&self.session.state) {
            let tag = cmd.tag;
            return self
                .send_ctl(
                    ResponseLine::tagged(
                        tag,
                        Response::bad("Command not allowed in this state"),
                    ),
                    OutputControl::Flush,
                )
                .await;
        }

        let tag = cmd.tag.clone();
        let result = {
            let mut handle = SessionHandle {
                session: &mut self.session,
                out: &self.out,
                server: &server,
            };
            handler.handle(cmd, &mut handle).await
        };

        // The subscription follows whatever selection the handler left
        // behind, and accumulated updates flush before the tagged
        // completion.
        self.mux.update_listener(
            self.session.selected.as_ref().map(|s| &s.mailbox_id),
        );
        self.flush_notifications(false).await?;

        let response = match result {
            Ok(response) => response,
            Err(e) => self.map_handler_error(e)?,
        };

        if response.is_bye() {
            // BYE is never tagged.
            self.send_ctl(
                ResponseLine::untagged(response),
                OutputControl::Disconnect,
            )
            .await
        } else {
            self.send_ctl(
                ResponseLine::tagged(tag, response),
                OutputControl::Flush,
            )
            .await
        }
    }

    /// Maps a handler's error to the tagged completion the client sees.
    ///
    /// Transport errors are the only kind that propagate; everything else
    /// stays on this side of the wire as a NO or BAD.
    fn map_handler_error(&self, e: Error) -> Result<Response, Error> {
        match e {
            Error::AuthRejected => Ok(Response::no(e.to_string())),
            Error::Storage => Ok(Response::Cond(CondResponse {
                cond: RespCondType::No,
                code: Some(RespTextCode::ServerBug),
                quip: Some(Cow::Borrowed(
                    "Transient failure, try again later",
                )),
            })),
            Error::BadState | Error::BadSyntax => {
                Ok(Response::bad(e.to_string()))
            },
            Error::Io(_) => Err(e),
            e => {
                error!(
                    "{} Unhandled handler error: {}",
                    self.log_prefix, e,
                );
                Ok(Response::no(
                    "Unexpected error; check server logs for details",
                ))
            },
        }
    }

    async fn cmd_capability(&mut self, cmd: Command) -> Result<(), Error> {
        let attributes = self
            .session
            .capabilities()
            .into_iter()
            .map(Attr::atom)
            .collect();
        self.send_ctl(
            ResponseLine::untagged(Response::Data(DataResponse {
                command: Cow::Borrowed("CAPABILITY"),
                attributes,
            })),
            OutputControl::Buffer,
        )
        .await?;
        self.flush_notifications(false).await?;
        self.send_ctl(
            ResponseLine::tagged(
                cmd.tag,
                Response::ok("CAPABILITY completed"),
            ),
            OutputControl::Flush,
        )
        .await
    }

    async fn cmd_logout(&mut self, cmd: Command) -> Result<(), Error> {
        self.session.state = SessionState::Logout;
        self.send_ctl(
            ResponseLine::untagged(Response::bye("Logging out")),
            OutputControl::Buffer,
        )
        .await?;
        self.send_ctl(
            ResponseLine::tagged(cmd.tag, Response::ok("LOGOUT completed")),
            OutputControl::Disconnect,
        )
        .await
    }

    async fn cmd_compress(&mut self, cmd: Command) -> Result<(), Error> {
        let deflate = matches!(
            cmd.arguments.first(),
            Some(Argument::Atom(m)) if m.eq_ignore_ascii_case("DEFLATE"),
        );
        if !deflate {
            return self
                .send_ctl(
                    ResponseLine::tagged(
                        cmd.tag,
                        Response::bad("Unknown compression mechanism"),
                    ),
                    OutputControl::Flush,
                )
                .await;
        }

        if self.session.compressing {
            return self
                .send_ctl(
                    ResponseLine::tagged(
                        cmd.tag,
                        Response::Cond(CondResponse {
                            cond: RespCondType::No,
                            code: Some(RespTextCode::CompressionActive),
                            quip: Some(Cow::Borrowed("Already compressing")),
                        }),
                    ),
                    OutputControl::Flush,
                )
                .await;
        }

        match self.framer.start_compression() {
            CompressionStatus::Started => {
                self.session.compressing = true;
                info!("{} Compression started", self.log_prefix);
                // The OK goes out in cleartext; the egress actor enables
                // the deflater immediately after flushing it.
                self.send_ctl(
                    ResponseLine::tagged(cmd.tag, Response::ok("Oo.")),
                    OutputControl::EnableCompression,
                )
                .await
            },
            CompressionStatus::AlreadyActive => {
                self.send_ctl(
                    ResponseLine::tagged(
                        cmd.tag,
                        Response::Cond(CondResponse {
                            cond: RespCondType::No,
                            code: Some(RespTextCode::CompressionActive),
                            quip: Some(Cow::Borrowed("Already compressing")),
                        }),
                    ),
                    OutputControl::Flush,
                )
                .await
            },
            CompressionStatus::InvalidPipelinedData => {
                self.send_ctl(
                    ResponseLine::tagged(
                        cmd.tag,
                        Response::bad("Pipelined data after COMPRESS"),
                    ),
                    OutputControl::Flush,
                )
                .await
            },
        }
    }

    async fn cmd_starttls(&mut self, cmd: Command) -> Result<(), Error> {
        if self.session.secure {
            return self
                .send_ctl(
                    ResponseLine::tagged(
                        cmd.tag,
                        Response::bad("Already using TLS"),
                    ),
                    OutputControl::Flush,
                )
                .await;
        }
        if self.session.compressing {
            return self
                .send_ctl(
                    ResponseLine::tagged(
                        cmd.tag,
                        Response::bad("STARTTLS not valid after COMPRESS"),
                    ),
                    OutputControl::Flush,
                )
                .await;
        }

        let server = Arc::clone(&self.server);
        let Some(upgrade) = server.upgrade.as_ref() else {
            return self
                .send_ctl(
                    ResponseLine::tagged(
                        cmd.tag,
                        Response::bad("STARTTLS not available"),
                    ),
                    OutputControl::Flush,
                )
                .await;
        };

        if self.framer.has_buffered_input() {
            // Cleartext pipelined behind STARTTLS cannot belong to any
            // protocol state; cut the connection.
            return self
                .send_ctl(
                    ResponseLine::untagged(Response::bye(
                        "Pipelined data after STARTTLS",
                    )),
                    OutputControl::Disconnect,
                )
                .await;
        }

        self.session.upgrading = true;

        // Quiescent handover: the egress actor flushes the tagged OK and
        // yields the write half back; the read half comes straight out of
        // the (empty) framer. Only then does the upgrade itself run.
        let (give_tx, give_rx) = oneshot::channel();
        self.send_ctl(
            ResponseLine::tagged(
                cmd.tag,
                Response::ok("Begin TLS negotiation now"),
            ),
            OutputControl::HandOverTransport(give_tx),
        )
        .await?;

        let write = give_rx.await.map_err(|_| channel_closed())?;
        let exit = (&mut self.writer)
            .await
            .map_err(|_| channel_closed())??;
        if OutputDisconnect::HandedOver != exit {
            return Err(channel_closed());
        }

        let read = self.framer.swap_io(Box::new(tokio::io::empty()));
        let (read, write) = upgrade.upgrade(read, write).await?;
        let _ = self.framer.swap_io(read);

        let (out, outputs) = mpsc::channel(OUTPUT_QUEUE_DEPTH);
        self.writer = tokio::spawn(write_responses(write, outputs));
        self.out = out;

        self.session.secure = true;
        self.session.upgrading = false;
        info!("{} TLS started", self.log_prefix);
        Ok(())
    }

    async fn cmd_idle(&mut self, cmd: Command) -> Result<(), Error> {
        if !matches!(
            self.session.state,
            SessionState::Authenticated | SessionState::Selected,
        ) {
            let tag = cmd.tag;
            return self
                .send_ctl(
                    ResponseLine::tagged(
                        tag,
                        Response::bad("Command not allowed in this state"),
                    ),
                    OutputControl::Flush,
                )
                .await;
        }

        self.out
            .send(OutputEvent::ContinuationLine { prompt: "idling" })
            .await
            .map_err(|_| channel_closed())?;
        self.session.idling = true;

        // While idling the client is guaranteed to be listening, so
        // everything pending and everything that arrives goes out at once.
        self.flush_notifications(true).await?;

        let got_done = loop {
            tokio::select! {
                biased;

                evt = self.mux.next_event() => {
                    self.on_notifier_event(evt).await?;
                    if self.sent_bye {
                        return Ok(());
                    }
                },

                r = self.framer.wait_for_input() => {
                    r?;
                    let done = match self.framer.next_frame().await {
                        Ok(frame) => {
                            frame.is_final()
                                && frame.bytes.eq_ignore_ascii_case(b"DONE")
                        },
                        Err(Error::CommandLineTooLong) => {
                            self.framer.recover_overlong().await?;
                            false
                        },
                        Err(Error::LiteralTooLarge {
                            length,
                            non_sync,
                        }) => {
                            if non_sync {
                                self.framer.recover_literal(length).await?;
                            }
                            false
                        },
                        Err(Error::BadLiteral) => false,
                        Err(e) => return Err(e),
                    };
                    break done;
                },
            }
        };

        self.session.idling = false;
        self.deadline =
            Instant::now() + self.server.options.socket_timeout();
        self.flush_notifications(false).await?;

        let response = if got_done {
            Response::ok("IDLE terminated")
        } else {
            Response::bad("Expected DONE")
        };
        self.send_ctl(
            ResponseLine::tagged(cmd.tag, response),
            OutputControl::Flush,
        )
        .await
    }

    async fn on_notifier_event(
        &mut self,
        evt: NotifierEvent,
    ) -> Result<(), Error> {
        match evt {
            NotifierEvent::MailboxDeleted => {
                self.send_ctl(
                    ResponseLine::untagged(Response::bye(
                        "Selected mailbox was deleted, have to disconnect",
                    )),
                    OutputControl::Disconnect,
                )
                .await
            },

            NotifierEvent::Changed => {
                if SessionState::Selected != self.session.state {
                    self.mux.release();
                    return Ok(());
                }
                let Some(selected) = self.session.selected.as_mut() else {
                    self.mux.release();
                    return Ok(());
                };

                match self.mux.pull_updates(selected).await {
                    Err(e) => {
                        // The queue and cursor are untouched; the next ping
                        // retries.
                        warn!(
                            "{} Failed to fetch mailbox updates: {}",
                            self.log_prefix, e,
                        );
                        Ok(())
                    },
                    Ok(()) => {
                        if self.session.idling {
                            self.flush_notifications(true).await
                        } else {
                            Ok(())
                        }
                    },
                }
            },
        }
    }

    /// Renders and writes the pending notification queue.
    ///
    /// With `flush_now` the responses are pushed to the client immediately;
    /// otherwise they ride ahead of the next flushed (tagged) response.
    async fn flush_notifications(
        &mut self,
        flush_now: bool,
    ) -> Result<(), Error> {
        let Some(selected) = self.session.selected.as_mut() else {
            return Ok(());
        };
        if selected.notifications.is_empty() {
            return Ok(());
        }

        let lines = self.mux.emit_notifications(selected);
        let mailbox = selected.mailbox_id.clone();
        let modify_index = selected.modify_index;

        for line in lines {
            self.send_ctl(line, OutputControl::Buffer).await?;
        }
        if flush_now {
            self.out
                .send(OutputEvent::Flush)
                .await
                .map_err(|_| channel_closed())?;
        }

        // Tell the store the client is caught up, on the next scheduler
        // tick.
        if let Some(hook) = self.server.on_notifications.clone() {
            let session_id = self.session.id.clone();
            tokio::spawn(async move {
                hook(&mailbox, modify_index, &session_id);
            });
        }

        Ok(())
    }

    async fn send_ctl(
        &mut self,
        line: ResponseLine,
        ctl: OutputControl,
    ) -> Result<(), Error> {
        self.sent_bye |= line.response.is_bye();
        self.out
            .send(OutputEvent::ResponseLine { line, ctl })
            .await
            .map_err(|_| channel_closed())
    }

    /// Tears the connection down. Idempotent in effect: the subscription and
    /// registry entry are released exactly once, and the egress actor is
    /// allowed to finish flushing before the transport drops.
    async fn shutdown(&mut self) {
        self.release_resources();

        let (dummy, _) = mpsc::channel(1);
        drop(mem::replace(&mut self.out, dummy));
        let _ = (&mut self.writer).await;

        self.session.state = SessionState::Closed;
        info!("{} Connection closed", self.log_prefix);
    }

    fn release_resources(&mut self) {
        if self.released {
            return;
        }
        self.released = true;

        // The subscription must be gone before the registry entry is.
        self.mux.release();
        self.server
            .connections
            .lock()
            .unwrap()
            .remove(&self.session.id);
    }
}

/// What the connection sees after the greeting gate resolves.
enum GateOutcome {
    Resolved(String),
    EarlyTalker,
}

/// Races reverse DNS against the client's first byte.
///
/// The client is required to stay quiet until greeted; one that doesn't is
/// reported as an early talker.
async fn greeting_gate<R: AsyncRead + Unpin>(
    framer: &mut FrameReader<R>,
    resolve: impl std::future::Future<Output = String>,
) -> Result<GateOutcome, Error> {
    tokio::pin!(resolve);
    tokio::select! {
        biased;

        host = &mut resolve => Ok(GateOutcome::Resolved(host)),

        r = framer.wait_for_input() => {
            r?;
            Ok(GateOutcome::EarlyTalker)
        },
    }
}

/// One unit of client input, as seen by the dispatcher.
enum Inbound {
    Command(Command),
    BadSyntax { tag: Option<String> },
    BadLiteral { tag: Option<String> },
    LiteralTooLarge { tag: Option<String> },
    TooLong { tag: Option<String> },
}

/// Reads frames until a whole command has been assembled.
///
/// Synchronising literals get their continuation line here; protocol-level
/// failures come back as `Inbound` values (with the stream already
/// resynchronised) so the dispatcher can reply without losing the
/// connection.
async fn read_command(
    framer: &mut FrameReader<BoxRead>,
    asm: &mut Assembler,
    out: &mpsc::Sender<OutputEvent>,
) -> Result<Inbound, Error> {
    loop {
        let (decl, pushed) = match framer.next_frame().await {
            Ok(frame) => (frame.literal, asm.push_frame(&frame)),

            Err(Error::CommandLineTooLong) => {
                let hint = asm.tag_hint();
                let tag = framer.recover_overlong().await?;
                asm.abort();
                return Ok(Inbound::TooLong { tag: hint.or(tag) });
            },

            Err(Error::LiteralTooLarge { length, non_sync }) => {
                let tag = asm.tag_hint();
                if non_sync {
                    framer.recover_literal(length).await?;
                }
                asm.abort();
                return Ok(Inbound::LiteralTooLarge { tag });
            },

            Err(Error::BadLiteral) => {
                let tag = asm.tag_hint();
                asm.abort();
                return Ok(Inbound::BadLiteral { tag });
            },

            Err(e) => return Err(e),
        };

        if pushed.is_err() {
            // The accumulated command outgrew the limit. A declared sync
            // literal is aborted by the error response itself; a non-sync
            // payload has to be skimmed off the stream.
            let tag = asm.tag_hint();
            match decl {
                Some(decl) if decl.non_sync => {
                    framer.recover_literal(decl.length).await?;
                },
                _ => {},
            }
            asm.abort();
            return Ok(Inbound::TooLong { tag });
        }

        match decl {
            Some(decl) => {
                if !decl.non_sync
                    && out
                        .send(OutputEvent::ContinuationLine {
                            prompt: "Ready for literal data",
                        })
                        .await
                        .is_err()
                {
                    return Err(channel_closed());
                }

                let data = framer.read_literal(decl.length).await?;
                asm.push_literal(data);
            },

            None => {
                let tag = asm.tag_hint();
                return match asm.finish() {
                    Ok(cmd) => Ok(Inbound::Command(cmd)),
                    Err(_) => Ok(Inbound::BadSyntax { tag }),
                };
            },
        }
    }
}

fn channel_closed() -> Error {
    Error::Io(io::Error::from(io::ErrorKind::BrokenPipe))
}

/// The handle through which command handlers observe and mutate the
/// session.
pub struct SessionHandle<'a> {
    pub(crate) session: &'a mut Session,
    pub(crate) out: &'a mpsc::Sender<OutputEvent>,
    pub(crate) server: &'a Arc<Server>,
}

impl SessionHandle<'_> {
    pub fn session_id(&self) -> &SessionId {
        &self.session.id
    }

    pub fn state(&self) -> SessionState {
        self.session.state
    }

    pub fn is_utf8_enabled(&self) -> bool {
        self.session.utf8_enabled
    }

    pub fn capabilities(&self) -> Vec<&'static str> {
        self.session.capabilities()
    }

    pub fn selected(&self) -> Option<&SelectedMailbox> {
        self.session.selected.as_ref()
    }

    pub fn selected_mut(&mut self) -> Option<&mut SelectedMailbox> {
        self.session.selected.as_mut()
    }

    /// Sends an untagged data response ahead of the tagged completion.
    pub async fn send(&mut self, line: ResponseLine) -> Result<(), Error> {
        self.out
            .send(OutputEvent::ResponseLine {
                line,
                ctl: OutputControl::Buffer,
            })
            .await
            .map_err(|_| channel_closed())
    }

    /// Formats one update record against the selected mailbox, applying
    /// the sequence bookkeeping of its kind. `None` when nothing is
    /// selected or the record does not apply to the client's view.
    pub fn format_response(&mut self, update: &Update) -> Option<Response> {
        self.session.selected.as_mut()?.format_update(update)
    }

    /// Passes a query for one message through to the store.
    pub async fn get_query_response(
        &self,
        uid: u32,
        query: &str,
    ) -> Result<Vec<Attr>, Error> {
        let selected =
            self.session.selected.as_ref().ok_or(Error::BadState)?;
        self.server
            .store
            .get_query_response(
                &self.session.id,
                &selected.mailbox_id,
                uid,
                query,
            )
            .await
    }

    /// Passes a search predicate for one message through to the store.
    pub async fn match_search_query(
        &self,
        uid: u32,
        query: &str,
    ) -> Result<bool, Error> {
        let selected =
            self.session.selected.as_ref().ok_or(Error::BadState)?;
        self.server
            .store
            .match_search_query(
                &self.session.id,
                &selected.mailbox_id,
                uid,
                query,
            )
            .await
    }

    /// Marks the client Unicode-aware (`UTF8=ACCEPT`), for the session
    /// record and the egress pipeline both.
    pub async fn enable_utf8(&mut self) -> Result<(), Error> {
        self.session.utf8_enabled = true;
        self.out
            .send(OutputEvent::EnableUnicode)
            .await
            .map_err(|_| channel_closed())
    }

    pub fn set_authenticated(&mut self) {
        self.session.state = SessionState::Authenticated;
    }

    /// Installs a selected-mailbox snapshot and enters the Selected state.
    pub fn select(&mut self, selected: SelectedMailbox) {
        self.session.selected = Some(selected);
        self.session.state = SessionState::Selected;
    }

    /// Drops the selection (CLOSE/UNSELECT).
    pub fn deselect(&mut self) {
        self.session.selected = None;
        if SessionState::Selected == self.session.state {
            self.session.state = SessionState::Authenticated;
        }
    }

    pub fn enable_condstore(&mut self) {
        if let Some(ref mut selected) = self.session.selected {
            selected.condstore_enabled = true;
        }
    }
}
