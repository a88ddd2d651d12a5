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

//! The line/literal framer over the transport read half.
//!
//! `FrameReader` splits the (decompressed) inbound byte stream into logical
//! frames: lines terminated by CRLF (bare LF is also tolerated), where a
//! literal declaration `{n}` or `{n+}` immediately before the line ending
//! marks the frame non-final and announces `n` bytes of literal payload.
//!
//! The framer cannot be an independent actor because frames borrow into the
//! internal buffer; the connection task drives it directly.

use std::io;
use std::ops::Range;
use std::pin::Pin;
use std::task;

use lazy_static::lazy_static;
use regex::bytes::Regex;
use tokio::io::{AsyncRead, AsyncReadExt as _, ReadBuf};

use crate::support::error::Error;

lazy_static! {
    static ref LITERAL_AT_END: Regex =
        Regex::new(r#"~?\{([0-9]+)\+?\}$"#).unwrap();
}

/// Default cap on a logical command line, literal payloads excluded.
pub const DEFAULT_MAX_COMMAND_LINE: usize = 100 * 1024;
/// Default cap on a single literal payload.
pub const DEFAULT_MAX_LITERAL: u32 = 64 * 1024 * 1024;

/// A literal declaration found at the end of a frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiteralDecl {
    /// The announced payload length.
    pub length: u32,
    /// Whether this is a non-synchronising (`{n+}`) literal, which requires
    /// no continuation line.
    pub non_sync: bool,
    /// Whether the binary (`~{n}`) syntax was used.
    pub binary: bool,
    /// Offset within the frame at which the declaration starts.
    pub offset: usize,
}

/// One logical frame: a line of command text, possibly ending with a literal
/// declaration.
#[derive(Debug)]
pub struct Frame<'a> {
    /// The frame content, line ending excluded, literal declaration (if any)
    /// included.
    pub bytes: &'a [u8],
    /// The literal declaration terminating this frame, if any.
    pub literal: Option<LiteralDecl>,
}

impl Frame<'_> {
    /// A final frame completes the command it belongs to.
    pub fn is_final(&self) -> bool {
        self.literal.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompressionStatus {
    Started,
    AlreadyActive,
    InvalidPipelinedData,
}

/// Manages the state of the network input.
pub struct FrameReader<R> {
    io: R,
    /// The (decompressed) frame buffer. The `Vec` itself is used as a
    /// fixed-size array; the size currently in use is given by `buf_len`.
    buf: Vec<u8>,
    /// The number of initialised bytes in `buf`.
    buf_len: usize,
    /// The number of bytes in `buf` that have been consumed by reading.
    buf_consumed: usize,
    max_literal: u32,
    /// The inflater, if COMPRESS is active.
    inflate: Option<flate2::Decompress>,
    /// Staging buffer for compressed input when COMPRESS is active.
    stage: Vec<u8>,
    /// The range of `stage` which is yet to be processed.
    stage_range: Range<usize>,
    /// Whether we've seen an EOF from the reader.
    reader_eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(io: R, max_line: usize, max_literal: u32) -> Self {
        Self {
            io,
            buf: vec![0u8; max_line],
            buf_len: 0,
            buf_consumed: 0,
            max_literal,
            inflate: None,
            stage: Vec::new(),
            stage_range: 0..0,
            reader_eof: false,
        }
    }

    /// Reads the next frame from the stream.
    ///
    /// On `Error::CommandLineTooLong` nothing has been consumed; the caller
    /// must follow up with `recover_overlong`. On `Error::LiteralTooLarge`
    /// the frame itself has been consumed; a non-sync literal must be
    /// discarded with `discard_literal` before the stream is coherent again.
    pub async fn next_frame(&mut self) -> Result<Frame<'_>, Error> {
        self.drop_consumed();
        let Some(range) = self.consume_line().await? else {
            return Err(Error::CommandLineTooLong);
        };

        let literal = match parse_literal_decl(&self.buf[range.clone()]) {
            Ok(decl) => decl,
            Err(e) => return Err(e),
        };
        if let Some(decl) = literal {
            if decl.length > self.max_literal {
                return Err(Error::LiteralTooLarge {
                    length: decl.length,
                    non_sync: decl.non_sync,
                });
            }
        }

        Ok(Frame {
            bytes: &self.buf[range],
            literal,
        })
    }

    /// Reads a literal payload of `len` bytes into an owned buffer.
    pub async fn read_literal(&mut self, len: u32) -> Result<Vec<u8>, Error> {
        let mut data = vec![0u8; len as usize];
        (&mut *self).read_exact(&mut data).await?;
        Ok(data)
    }

    /// Discards an unread literal payload of `len` bytes.
    pub async fn discard_literal(&mut self, len: u32) -> io::Result<()> {
        tokio::io::copy(
            &mut (&mut *self).take(u64::from(len)),
            &mut tokio::io::sink(),
        )
        .await?;
        Ok(())
    }

    /// Waits until at least one unconsumed byte is buffered.
    ///
    /// This is cancel-safe: any bytes read land in the internal buffer and
    /// are found by the next call.
    pub async fn wait_for_input(&mut self) -> io::Result<()> {
        if self.buf_consumed < self.buf_len {
            return Ok(());
        }

        self.drop_consumed();
        self.grow_buf().await
    }

    /// Whether any already-received bytes are waiting to be consumed.
    ///
    /// Commands that change the stream framing (COMPRESS, STARTTLS) are
    /// invalid if the client pipelined data behind them.
    pub fn has_buffered_input(&self) -> bool {
        self.buf_consumed < self.buf_len
    }

    /// Enables DEFLATE decompression on the input.
    pub fn start_compression(&mut self) -> CompressionStatus {
        if self.inflate.is_some() {
            CompressionStatus::AlreadyActive
        } else if self.has_buffered_input() {
            CompressionStatus::InvalidPipelinedData
        } else {
            self.inflate = Some(flate2::Decompress::new(false));
            self.stage = vec![0u8; 4096];
            CompressionStatus::Started
        }
    }

    /// Replaces the underlying transport, returning the old one.
    ///
    /// The buffer must be empty; pipelined cleartext across a transport
    /// upgrade is a protocol violation the caller must already have ruled
    /// out.
    pub fn swap_io(&mut self, io: R) -> R {
        assert!(
            !self.has_buffered_input(),
            "swap_io with unconsumed input",
        );
        std::mem::replace(&mut self.io, io)
    }

    /// Attempts to recover the protocol after an overlong command line.
    ///
    /// Discards input until the end of the command is reached, skipping
    /// non-sync literal payloads along the way. Returns the offending
    /// command's tag if one could be extracted.
    pub async fn recover_overlong(&mut self) -> io::Result<Option<String>> {
        let tag = extract_tag(&self.buf[self.buf_consumed..self.buf_len]);
        self.skip_command(SkipState::Line).await?;
        Ok(tag)
    }

    /// Discards input until the end of the current command after an overlong
    /// non-sync literal of `len` bytes.
    pub async fn recover_literal(
        &mut self,
        len: u32,
    ) -> io::Result<()> {
        self.skip_command(SkipState::NonSyncLiteral(len)).await
    }

    /// Skips the rest of the current command.
    async fn skip_command(&mut self, mut state: SkipState) -> io::Result<()> {
        loop {
            match state {
                SkipState::Line => {
                    // Shift away all but the last 32 bytes we've buffered. If
                    // the buffer ends with the start of a literal
                    // declaration, this lets us find it when the line
                    // continues.
                    self.buf_consumed = self.buf_len.saturating_sub(32);
                },

                SkipState::NonSyncLiteral(len) => {
                    self.discard_literal(len).await?;
                },
            }

            self.drop_consumed();
            let Some(range) = self.consume_line().await? else {
                // Still no line boundary.
                state = SkipState::Line;
                continue;
            };

            match parse_literal_decl(&self.buf[range]) {
                Ok(Some(decl)) if decl.non_sync => {
                    // We have to skip this literal too.
                    state = SkipState::NonSyncLiteral(decl.length);
                },
                // A sync literal is aborted by the error response the caller
                // already sent, and anything else ends the command.
                _ => return Ok(()),
            }
        }
    }

    /// Advances `buf_consumed` to one byte past the next line boundary.
    ///
    /// If no IO error occurs, this returns the range of the line (excluding
    /// the line-ending character(s)), or `None` if the buffer filled up
    /// without finding a line feed. In the latter case, `buf_consumed` is not
    /// advanced.
    async fn consume_line(&mut self) -> io::Result<Option<Range<usize>>> {
        let start = self.buf_consumed;
        let mut cursor = start;

        loop {
            if let Some(lf) =
                memchr::memchr(b'\n', &self.buf[cursor..self.buf_len])
            {
                let end = cursor + lf + 1;
                self.buf_consumed = end;

                let mut before_line_end = end - 1; // before '\n'
                if before_line_end > start
                    && self.buf[before_line_end - 1] == b'\r'
                {
                    before_line_end -= 1;
                }
                return Ok(Some(start..before_line_end));
            }

            cursor = self.buf_len;
            if self.buf_len == self.buf.len() {
                return Ok(None);
            }

            self.grow_buf().await?;
        }
    }

    /// Removes all bytes marked as consumed from the frame buffer.
    fn drop_consumed(&mut self) {
        if self.buf_consumed < self.buf_len {
            self.buf.copy_within(self.buf_consumed..self.buf_len, 0);
        }

        self.buf_len -= self.buf_consumed;
        self.buf_consumed = 0;
    }

    /// Performs a non-empty read into `buf`.
    fn grow_buf(
        &mut self,
    ) -> impl std::future::Future<Output = io::Result<()>> + '_ {
        struct GrowBuf<'a, R> {
            this: &'a mut FrameReader<R>,
        }

        impl<R: AsyncRead + Unpin> std::future::Future for GrowBuf<'_, R> {
            type Output = io::Result<()>;

            fn poll(
                mut self: Pin<&mut Self>,
                ctx: &mut task::Context<'_>,
            ) -> task::Poll<io::Result<()>> {
                let this = &mut *self.this;
                let mut buf = ReadBuf::new(&mut this.buf[this.buf_len..]);

                let poll = if let Some(ref mut inflate) = this.inflate {
                    poll_inflate(
                        ctx,
                        &mut buf,
                        Pin::new(&mut this.io),
                        inflate,
                        &mut this.stage,
                        &mut this.stage_range,
                        &mut this.reader_eof,
                    )
                } else {
                    Pin::new(&mut this.io).poll_read(ctx, &mut buf)
                };

                futures::ready!(poll)?;

                let nread = buf.filled().len();
                if 0 == nread {
                    return task::Poll::Ready(Err(
                        io::ErrorKind::UnexpectedEof.into(),
                    ));
                }

                this.buf_len += nread;
                task::Poll::Ready(Ok(()))
            }
        }

        GrowBuf { this: self }
    }
}

#[derive(Clone, Copy)]
enum SkipState {
    /// `buf` is full with no EOL in sight.
    Line,
    /// The consumed part of `buf` ends with a non-sync literal declaration
    /// of this size.
    NonSyncLiteral(u32),
}

/// Checks whether `line` ends with a literal declaration.
///
/// A declaration whose length does not fit in `u32` is malformed rather than
/// merely large.
fn parse_literal_decl(line: &[u8]) -> Result<Option<LiteralDecl>, Error> {
    let Some(caps) = LITERAL_AT_END.captures(line) else {
        return Ok(None);
    };

    let all = caps.get(0).expect("capture 0 always present");
    let digits = caps.get(1).expect("literal regex has one group");
    let length = std::str::from_utf8(digits.as_bytes())
        .ok()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or(Error::BadLiteral)?;

    Ok(Some(LiteralDecl {
        length,
        non_sync: all.as_bytes().contains(&b'+'),
        binary: all.as_bytes().starts_with(b"~"),
        offset: all.start(),
    }))
}

/// Extracts what looks like a command tag from the start of a broken line.
fn extract_tag(line: &[u8]) -> Option<String> {
    let end = line
        .iter()
        .position(|&b| b == b' ')
        .unwrap_or(line.len())
        .min(64);
    let tag = &line[..end];
    if tag.is_empty()
        || !tag
            .iter()
            .all(|&b| b.is_ascii_graphic() && b != b'+' && b != b'*')
    {
        return None;
    }

    Some(String::from_utf8_lossy(tag).into_owned())
}

/// The `AsyncRead` implementation directly reads from the logical byte
/// stream: buffered frame data first, then the (decompressed) transport.
impl<R: AsyncRead + Unpin> AsyncRead for FrameReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        ctx: &mut task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> task::Poll<io::Result<()>> {
        let this = self.get_mut();

        if this.buf_consumed < this.buf_len {
            let len = buf.remaining().min(this.buf_len - this.buf_consumed);
            buf.put_slice(&this.buf[this.buf_consumed..][..len]);
            this.buf_consumed += len;
            task::Poll::Ready(Ok(()))
        } else if let Some(ref mut inflate) = this.inflate {
            poll_inflate(
                ctx,
                buf,
                Pin::new(&mut this.io),
                inflate,
                &mut this.stage,
                &mut this.stage_range,
                &mut this.reader_eof,
            )
        } else {
            Pin::new(&mut this.io).poll_read(ctx, buf)
        }
    }
}

/// Decompresses data into `dst`.
///
/// `stage` is the staging buffer for compressed data, with `stage_range`
/// being the part of `stage` which has unprocessed data.
fn poll_inflate<R: AsyncRead>(
    ctx: &mut task::Context<'_>,
    dst: &mut ReadBuf<'_>,
    mut src: Pin<&mut R>,
    inflate: &mut flate2::Decompress,
    stage: &mut [u8],
    stage_range: &mut Range<usize>,
    reader_eof: &mut bool,
) -> task::Poll<io::Result<()>> {
    loop {
        // First, try to squeeze data out of the inflater even if we have
        // nothing new to give it.
        let before_in = inflate.total_in();
        let before_out = inflate.total_out();
        if let Err(e) = inflate.decompress(
            &stage[stage_range.clone()],
            dst.initialize_unfilled(),
            if *reader_eof {
                flate2::FlushDecompress::Finish
            } else {
                flate2::FlushDecompress::Sync
            },
        ) {
            return task::Poll::Ready(Err(io::Error::new(
                io::ErrorKind::InvalidData,
                e,
            )));
        }
        let after_in = inflate.total_in();
        let after_out = inflate.total_out();

        stage_range.start += (after_in - before_in) as usize;
        if after_out != before_out || *reader_eof {
            dst.advance((after_out - before_out) as usize);
            return task::Poll::Ready(Ok(()));
        }

        // We can't get anything more from the inflater with the data we
        // have. If the stage is not yet empty, make another pass; otherwise
        // try to read more data.
        if (*stage_range).is_empty() {
            if *reader_eof {
                return task::Poll::Ready(Ok(()));
            }

            let mut stage_buf = ReadBuf::new(stage);
            futures::ready!(src.as_mut().poll_read(ctx, &mut stage_buf))?;

            *stage_range = 0..stage_buf.filled().len();
            *reader_eof = (*stage_range).is_empty();
        }
    }
}

#[cfg(test)]
mod test {
    use std::io::Write as _;

    use super::*;

    fn reader(input: &[u8], compressed: bool) -> FrameReader<&[u8]> {
        let mut r = FrameReader::new(input, 1024, 64);
        if compressed {
            assert_eq!(CompressionStatus::Started, r.start_compression());
        }
        r
    }

    fn deflate(input: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        let mut w = flate2::write::DeflateEncoder::new(
            &mut data,
            flate2::Compression::best(),
        );
        w.write_all(input).unwrap();
        w.flush().unwrap();
        drop(w);
        data
    }

    fn frames_of(input: &[u8], compressed: bool) -> Vec<String> {
        let data;
        let input = if compressed {
            data = deflate(input);
            &data[..]
        } else {
            input
        };

        let mut r = reader(input, compressed);
        let mut out = Vec::new();
        loop {
            match futures::executor::block_on(r.next_frame()) {
                Ok(frame) => {
                    out.push(format!(
                        "{}{}",
                        String::from_utf8_lossy(frame.bytes),
                        match frame.literal {
                            Some(decl) => format!(
                                " <literal {} sync={}>",
                                decl.length, !decl.non_sync
                            ),
                            None => String::new(),
                        }
                    ));
                    if let Some(decl) = frame.literal {
                        let lit = futures::executor::block_on(
                            r.read_literal(decl.length),
                        )
                        .unwrap();
                        out.push(format!(
                            "[{}]",
                            String::from_utf8_lossy(&lit)
                        ));
                    }
                },
                Err(Error::Io(ref e))
                    if io::ErrorKind::UnexpectedEof == e.kind() =>
                {
                    break;
                },
                Err(e) => {
                    out.push(format!("error: {}", e));
                    break;
                },
            }
        }
        out
    }

    #[test]
    fn simple_lines() {
        for compressed in [false, true] {
            assert_eq!(
                vec!["a1 NOOP".to_owned(), "a2 CHECK".to_owned()],
                frames_of(b"a1 NOOP\r\na2 CHECK\n", compressed),
            );
        }
    }

    #[test]
    fn literal_frames() {
        for compressed in [false, true] {
            assert_eq!(
                vec![
                    "a1 LOGIN {5} <literal 5 sync=true>".to_owned(),
                    "[plugh]".to_owned(),
                    " xyzzy".to_owned(),
                    "a2 CREATE {3+} <literal 3 sync=false>".to_owned(),
                    "[foo]".to_owned(),
                    "".to_owned(),
                ],
                frames_of(
                    b"a1 LOGIN {5}\r\nplugh xyzzy\r\n\
                      a2 CREATE {3+}\r\nfoo\r\n",
                    compressed,
                ),
            );
        }
    }

    #[test]
    fn literal_at_exact_limit_accepted() {
        let mut r = reader(b"a1 X {64}\r\n", false);
        let frame = futures::executor::block_on(r.next_frame()).unwrap();
        assert_eq!(
            Some(LiteralDecl {
                length: 64,
                non_sync: false,
                binary: false,
                offset: 5,
            }),
            frame.literal,
        );
    }

    #[test]
    fn literal_one_over_limit_rejected() {
        let mut r = reader(b"a1 X {65}\r\n", false);
        match futures::executor::block_on(r.next_frame()) {
            Err(Error::LiteralTooLarge {
                length: 65,
                non_sync: false,
            }) => (),
            r => panic!("unexpected result: {:?}", r.map(|_| ())),
        }
    }

    #[test]
    fn malformed_literal_length() {
        let mut r = reader(b"a1 X {99999999999999999999}\r\n", false);
        assert!(matches!(
            futures::executor::block_on(r.next_frame()),
            Err(Error::BadLiteral),
        ));
    }

    #[test]
    fn binary_literal_decl() {
        let mut r = reader(b"a1 APPEND ~{5+}\r\n", false);
        let frame = futures::executor::block_on(r.next_frame()).unwrap();
        let decl = frame.literal.unwrap();
        assert!(decl.binary);
        assert!(decl.non_sync);
        assert_eq!(5, decl.length);
        assert_eq!(10, decl.offset);
    }

    #[test]
    fn overlong_line_recovery() {
        let mut input = Vec::new();
        input.extend_from_slice(b"a1 CREATE ");
        input.extend_from_slice(&vec![b'x'; 2048]);
        input.extend_from_slice(b"\r\na2 NOOP\r\n");

        let mut r = reader(&input, false);
        assert!(matches!(
            futures::executor::block_on(r.next_frame()),
            Err(Error::CommandLineTooLong),
        ));
        let tag = futures::executor::block_on(r.recover_overlong()).unwrap();
        assert_eq!(Some("a1".to_owned()), tag);

        let frame = futures::executor::block_on(r.next_frame()).unwrap();
        assert_eq!(b"a2 NOOP", frame.bytes);
    }

    #[test]
    fn overlong_nonsync_literal_recovery() {
        // The literal fits the declared size check but the command must
        // still be skippable, payload and all.
        let mut input = Vec::new();
        input.extend_from_slice(b"a1 X {60+}\r\n");
        input.extend_from_slice(&vec![b'y'; 60]);
        input.extend_from_slice(b" more\r\na2 NOOP\r\n");

        let mut r = reader(&input, false);
        let decl = {
            let frame =
                futures::executor::block_on(r.next_frame()).unwrap();
            frame.literal.unwrap()
        };
        futures::executor::block_on(r.recover_literal(decl.length)).unwrap();

        let frame = futures::executor::block_on(r.next_frame()).unwrap();
        assert_eq!(b"a2 NOOP", frame.bytes);
    }

    #[test]
    fn pipelined_data_blocks_compression() {
        let mut r = reader(b"a1 COMPRESS DEFLATE\r\na2 NOOP\r\n", false);
        // Reading the first frame buffers the pipelined second line.
        futures::executor::block_on(r.next_frame()).unwrap();
        assert_eq!(
            CompressionStatus::InvalidPipelinedData,
            r.start_compression(),
        );
    }
}
