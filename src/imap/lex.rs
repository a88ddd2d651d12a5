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

//! Utilities for *writing* values under IMAP's "lexical rules".
//!
//! This is write-only since IMAP's lexical syntax is not separable from its
//! grammar.
//!
//! The code here is responsible for two things:
//!
//! - Deciding which form to use to encode certain strings (i.e. atom, quoted
//!   string, or literal).
//!
//! - Repairing non-ASCII data where the protocol doesn't allow it.
//!
//! # Encoding decisions
//!
//! We're generally pretty conservative here.
//!
//! Given the choice between encoding a string as an atom-like value or some
//! other form, we only use atom if all characters are in the set
//! `a-zA-Z0-9?=+/_.-` and the string is not "NIL".
//!
//! Given the choice between encoding a string as a quoted string or a
//! literal, we only choose the quoted string if it contains no controls,
//! backslash, or double-quote, is less than 100 bytes long, and, if the
//! client is not Unicode-aware, no non-ASCII characters.
//!
//! # Repair strategy
//!
//! For clients that have not enabled `UTF8=ACCEPT`, strings containing
//! non-ASCII characters have those characters censored to `X` rather than be
//! sent in a form the client has declared it cannot handle.

use std::borrow::Cow;
use std::io::{self, Read, Write};
use std::mem;

use super::literal_source::LiteralSource;

#[derive(Clone, Copy, Debug)]
pub struct LexWriter<W> {
    writer: W,
    unicode_aware: bool,
}

impl<W: LexOutput> LexWriter<W> {
    pub fn new(writer: W, unicode_aware: bool) -> Self {
        LexWriter {
            writer,
            unicode_aware,
        }
    }

    #[cfg(test)]
    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn verbatim(&mut self, s: &str) -> io::Result<()> {
        self.writer.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn nil(&mut self) -> io::Result<()> {
        self.verbatim("NIL")
    }

    pub fn num_u32(&mut self, value: u32) -> io::Result<()> {
        write!(self.writer, "{}", value)
    }

    pub fn num_u64(&mut self, value: u64) -> io::Result<()> {
        write!(self.writer, "{}", value)
    }

    pub fn censored_astring(&mut self, s: &str) -> io::Result<()> {
        self.astring(&self.censor(s))
    }

    pub fn censored_nstring(
        &mut self,
        s: &Option<impl AsRef<str>>,
    ) -> io::Result<()> {
        match s.as_ref() {
            None => self.nil(),
            Some(s) => self.string(&self.censor(s.as_ref())),
        }
    }

    pub fn censored_string(&mut self, s: &str) -> io::Result<()> {
        self.string(&self.censor(s))
    }

    pub fn literal(
        &mut self,
        use_binary_syntax: bool,
        data: impl Read + Send + 'static,
        len: u64,
    ) -> io::Result<()> {
        write!(
            self.writer,
            "{}{{{}}}\r\n",
            if use_binary_syntax { "~" } else { "" },
            len,
        )?;
        self.writer.splice(data)?;
        Ok(())
    }

    pub fn literal_source(&mut self, ls: &mut LiteralSource) -> io::Result<()> {
        self.literal(
            ls.binary,
            mem::replace(&mut ls.data, Box::new(&[][..])),
            ls.len,
        )
    }

    fn astring(&mut self, s: &str) -> io::Result<()> {
        if self.is_conservative_atom(s) {
            write!(self.writer, "{}", s)?;
        } else {
            self.string(s)?;
        }

        Ok(())
    }

    fn string(&mut self, s: &str) -> io::Result<()> {
        if self.is_quotable(s) {
            write!(self.writer, "\"{}\"", s)?;
        } else {
            self.literal(
                false,
                io::Cursor::new(s.as_bytes().to_owned()),
                s.len() as u64,
            )?;
        }

        Ok(())
    }

    fn censor<'a>(&self, s: &'a str) -> Cow<'a, str> {
        if self.unicode_aware || s.is_ascii() {
            Cow::Borrowed(s)
        } else {
            Cow::Owned(s.replace(|ch| ch > '\u{7f}', "X"))
        }
    }

    fn is_conservative_atom(&self, s: &str) -> bool {
        !"nil".eq_ignore_ascii_case(s)
            && !s.is_empty()
            && s.as_bytes().iter().copied().all(|b| {
                matches!(
                b,
                b'a'..=b'z'
                | b'A'..=b'Z'
                | b'0'..=b'9'
                | b'='
                | b'?'
                | b'/'
                | b'+'
                | b'_'
                | b'.'
                    | b'-')
            })
    }

    fn is_quotable(&self, s: &str) -> bool {
        s.len() < 100
            && s.as_bytes().iter().copied().all(|b| match b {
                0..=31 | 127 | b'\\' | b'"' => false,
                128..=255 => self.unicode_aware,
                _ => true,
            })
    }
}

pub trait LexOutput: Write {
    /// Splice `data` into the stream at the current position.
    ///
    /// `data` is potentially very large. In async contexts, it is not read
    /// within this call, but is stored with the current position so that it
    /// can be written when needed.
    fn splice<R: Read + Send + 'static>(&mut self, data: R) -> io::Result<()>;
}

/// Adapts a synchronous writer to perform `splice` with `io::copy`.
#[derive(Clone, Copy, Debug)]
pub struct InlineSplice<W>(pub W);

impl<W: Write> Write for InlineSplice<W> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.write(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> LexOutput for InlineSplice<W> {
    fn splice<R: Read + Send + 'static>(
        &mut self,
        mut data: R,
    ) -> io::Result<()> {
        io::copy(&mut data, self)?;
        Ok(())
    }
}

impl LexOutput for Vec<u8> {
    fn splice<R: Read + Send + 'static>(
        &mut self,
        mut data: R,
    ) -> io::Result<()> {
        io::copy(&mut data, self)?;
        Ok(())
    }
}

impl LexOutput for &mut Vec<u8> {
    fn splice<R: Read + Send + 'static>(
        &mut self,
        mut data: R,
    ) -> io::Result<()> {
        io::copy(&mut data, self)?;
        Ok(())
    }
}
