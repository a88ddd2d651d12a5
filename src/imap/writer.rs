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

//! The egress pipeline: an actor which serialises response records and owns
//! the transport write half.
//!
//! Everything the client sees goes through this actor, which is what makes
//! the ordering guarantees trivial: bytes reach the transport in event
//! order, and stream transforms (DEFLATE) or transport swaps (STARTTLS)
//! happen at exact event boundaries, after a full flush.

use std::io::{self, Read};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use tokio::time::Instant;

use super::lex::{LexOutput, LexWriter};
use super::response::ResponseLine;

/// The write half of the transport, as handed to the egress actor.
pub type BoxWrite = Box<dyn AsyncWrite + Send + Unpin>;

/// An event to be sent to the client.
pub enum OutputEvent {
    /// A full response line.
    ResponseLine {
        /// The content to write.
        line: ResponseLine,
        /// Any special handling for this line.
        ctl: OutputControl,
    },
    /// A continuation line (i.e. "+ {prompt}\r\n").
    ContinuationLine {
        /// The prompt to send.
        prompt: &'static str,
    },
    /// Flush the buffers immediately if non-empty.
    Flush,
    /// Mark the client as Unicode-aware for all further responses.
    EnableUnicode,
}

pub enum OutputControl {
    /// No special handling. Written responses may continue to be buffered.
    Buffer,
    /// Flush all internal buffers after writing this response.
    Flush,
    /// Flush all internal buffers after writing this response, and enable
    /// transparent compression before writing anything further.
    EnableCompression,
    /// Flush all internal buffers after writing this response, then yield
    /// the transport back through the channel so it can be upgraded.
    HandOverTransport(tokio::sync::oneshot::Sender<BoxWrite>),
    /// Flush all internal buffers and disconnect immediately after writing
    /// this response.
    Disconnect,
}

/// The reason `write_responses` terminated.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputDisconnect {
    /// The disconnect was initiated by `OutputControl::Disconnect`.
    ByControl,
    /// The `OutputEvent` receiver was closed.
    InputClosed,
    /// The transport was handed back for an upgrade.
    HandedOver,
}

/// Actor for writing responses to the client.
///
/// The actor runs until one of the following:
/// - An error occurs.
/// - `outputs` is disconnected. The actor returns no error.
/// - `OutputControl::Disconnect` or `HandOverTransport` is processed. The
///   actor returns no error.
pub async fn write_responses(
    mut io: BoxWrite,
    mut outputs: tokio::sync::mpsc::Receiver<OutputEvent>,
) -> io::Result<OutputDisconnect> {
    let mut state = State::new();
    while let Some(evt) = outputs.recv().await {
        // Reset last_flush if there's not actually anything pending.
        if state.text.is_empty() {
            state.last_flush = Instant::now();
        }

        let ctl = match evt {
            OutputEvent::ResponseLine { mut line, ctl } => {
                let unicode = state.unicode;
                line.write_to(&mut LexWriter::new(&mut state, unicode))?;
                state.text.extend_from_slice(b"\r\n");
                ctl
            },

            OutputEvent::ContinuationLine { prompt } => {
                state.text.extend_from_slice(b"+ ");
                state.text.extend_from_slice(prompt.as_bytes());
                state.text.extend_from_slice(b"\r\n");
                OutputControl::Flush
            },

            OutputEvent::Flush => OutputControl::Flush,

            OutputEvent::EnableUnicode => {
                state.unicode = true;
                continue;
            },
        };

        match ctl {
            OutputControl::Buffer => {
                let flush_due_to_size = state.text.len() >= TEXT_FLUSH_THRESH
                    || state.splices.len() >= SPLICE_FLUSH_THRESH;

                // Commands can take a long time while producing little
                // output (e.g. a slow SEARCH), so force a flush implicitly
                // if data has been sitting around for a while.
                let flush_due_to_time =
                    state.last_flush.elapsed() >= Duration::from_secs(3);

                if flush_due_to_size || flush_due_to_time {
                    let flush_compress = if flush_due_to_time {
                        flate2::FlushCompress::Sync
                    } else {
                        flate2::FlushCompress::None
                    };
                    state.flush(&mut io, flush_compress).await?;
                }
            },

            OutputControl::Flush => {
                state.flush(&mut io, flate2::FlushCompress::Sync).await?;
            },

            OutputControl::EnableCompression => {
                assert!(state.deflate.is_none());
                state.flush(&mut io, flate2::FlushCompress::None).await?;
                state.deflate = Some(flate2::Compress::new(
                    flate2::Compression::new(3),
                    false,
                ));
                state.deflate_buf = vec![0u8; TEXT_FLUSH_THRESH];
            },

            OutputControl::HandOverTransport(give_back) => {
                state.flush(&mut io, flate2::FlushCompress::Sync).await?;
                let _ = give_back.send(io);
                return Ok(OutputDisconnect::HandedOver);
            },

            OutputControl::Disconnect => {
                state.flush(&mut io, flate2::FlushCompress::Finish).await?;
                return Ok(OutputDisconnect::ByControl);
            },
        }
    }

    state.flush(&mut io, flate2::FlushCompress::Finish).await?;

    Ok(OutputDisconnect::InputClosed)
}

const TEXT_FLUSH_THRESH: usize = 4096;
const SPLICE_FLUSH_THRESH: usize = 4;

struct State {
    /// The buffer into which `LexWriter` writes.
    ///
    /// Splices are stored separately, retaining their original `impl Read`,
    /// to be played back once flushed.
    text: Vec<u8>,
    /// Literals to be spliced into `text`, sorted ascending by offset.
    splices: Vec<LiteralSplice>,
    /// Buffer into which chunks from `splices` are staged.
    splice_read: Vec<u8>,
    /// The compressor, if any.
    deflate: Option<flate2::Compress>,
    /// Buffer into which the compressor compresses.
    deflate_buf: Vec<u8>,
    /// The last time a flush was completed.
    last_flush: Instant,
    /// Whether Unicode output is enabled.
    unicode: bool,
}

struct LiteralSplice {
    /// The offset within `text` of this splice.
    offset: usize,
    data: Box<dyn Read + Send>,
}

impl State {
    fn new() -> Self {
        Self {
            text: Vec::with_capacity(TEXT_FLUSH_THRESH * 5 / 4),
            splices: Vec::with_capacity(SPLICE_FLUSH_THRESH * 2),
            splice_read: vec![0; 4096],
            deflate: None,
            deflate_buf: Vec::new(),
            last_flush: Instant::now(),
            unicode: false,
        }
    }

    async fn flush(
        &mut self,
        io: &mut BoxWrite,
        flush_compress: flate2::FlushCompress,
    ) -> io::Result<()> {
        async fn do_write(
            io: &mut BoxWrite,
            deflate: Option<&mut flate2::Compress>,
            deflate_buf: &mut [u8],
            mut data: &[u8],
        ) -> io::Result<()> {
            if let Some(deflate) = deflate {
                while !data.is_empty() {
                    let before_in = deflate.total_in();
                    let before_out = deflate.total_out();
                    deflate
                        .compress(
                            data,
                            deflate_buf,
                            flate2::FlushCompress::None,
                        )
                        .map_err(|e| {
                            io::Error::new(io::ErrorKind::Other, e)
                        })?;
                    let after_in = deflate.total_in();
                    let after_out = deflate.total_out();

                    data = &data[(after_in - before_in) as usize..];
                    if after_out != before_out {
                        io.write_all(
                            &deflate_buf[..(after_out - before_out) as usize],
                        )
                        .await?;
                    }
                }
            } else if !data.is_empty() {
                io.write_all(data).await?;
            }

            Ok(())
        }

        let mut offset = 0usize;
        for mut splice in self.splices.drain(..) {
            if splice.offset > offset {
                do_write(
                    io,
                    self.deflate.as_mut(),
                    &mut self.deflate_buf,
                    &self.text[offset..splice.offset],
                )
                .await?;
                offset = splice.offset;
            }

            loop {
                let nread = splice.data.read(&mut self.splice_read)?;
                if 0 == nread {
                    break;
                }

                do_write(
                    io,
                    self.deflate.as_mut(),
                    &mut self.deflate_buf,
                    &self.splice_read[..nread],
                )
                .await?;
            }
        }

        if offset < self.text.len() {
            do_write(
                io,
                self.deflate.as_mut(),
                &mut self.deflate_buf,
                &self.text[offset..],
            )
            .await?;
        }

        if flate2::FlushCompress::None != flush_compress {
            if let Some(ref mut deflate) = self.deflate {
                loop {
                    let before_out = deflate.total_out();
                    deflate
                        .compress(&[], &mut self.deflate_buf, flush_compress)
                        .map_err(|e| {
                            io::Error::new(io::ErrorKind::Other, e)
                        })?;
                    let after_out = deflate.total_out();

                    if after_out == before_out {
                        break;
                    }

                    io.write_all(
                        &self.deflate_buf
                            [..(after_out - before_out) as usize],
                    )
                    .await?;
                }
            }
        }

        io.flush().await?;
        self.text.clear();
        self.last_flush = Instant::now();
        Ok(())
    }
}

impl io::Write for &mut State {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.text.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        // Not supported, we do this async
        Ok(())
    }
}

impl LexOutput for &mut State {
    fn splice<R: Read + Send + 'static>(&mut self, data: R) -> io::Result<()> {
        self.splices.push(LiteralSplice {
            offset: self.text.len(),
            data: Box::new(data),
        });
        Ok(())
    }
}

/// A write half whose output remains observable after the actor takes
/// ownership of it. Test infrastructure only.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl AsyncWrite for SharedBuf {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }
}
