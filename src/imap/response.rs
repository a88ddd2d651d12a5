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

//! The structured response model and its wire serialisation.
//!
//! Handlers and the notification multiplexer build `ResponseLine` values;
//! nothing outside `lex` produces protocol bytes directly. Serialisation
//! consumes the line (`write_to` takes `&mut self`) because literal sources
//! are single-use readers.

use std::borrow::Cow;
use std::fmt;
use std::io::{self, Read};
use std::mem;

use super::lex::{LexOutput, LexWriter};
use super::literal_source::LiteralSource;

/// One node in a response's attribute tree.
pub enum Attr {
    /// An atom, written verbatim. The caller is responsible for ensuring the
    /// content is valid atom syntax.
    Atom(Cow<'static, str>),
    /// A bare number.
    Num(u64),
    /// A string, written as a quoted string or literal as its content
    /// requires.
    String(Cow<'static, str>),
    /// A literal with known content.
    Literal(LiteralSource),
    /// NIL.
    Nil,
    /// A parenthesised list.
    List(Vec<Attr>),
    /// A literal streamed out of a producer, covering a window of the
    /// producer's output.
    Stream {
        data: Box<dyn Read + Send>,
        expected_length: u64,
        start_from: u64,
        max_length: Option<u64>,
        binary: bool,
    },
}

impl Attr {
    pub fn atom(s: impl Into<Cow<'static, str>>) -> Self {
        Attr::Atom(s.into())
    }

    pub fn string(s: impl Into<Cow<'static, str>>) -> Self {
        Attr::String(s.into())
    }

    pub fn write_to(
        &mut self,
        w: &mut LexWriter<impl LexOutput>,
    ) -> io::Result<()> {
        match *self {
            Attr::Atom(ref a) => w.verbatim(a),
            Attr::Num(n) => w.num_u64(n),
            Attr::String(ref s) => w.censored_string(s),
            Attr::Literal(ref mut ls) => w.literal_source(ls),
            Attr::Nil => w.nil(),
            Attr::List(ref mut items) => {
                w.verbatim("(")?;
                for (ix, item) in items.iter_mut().enumerate() {
                    if ix > 0 {
                        w.verbatim(" ")?;
                    }
                    item.write_to(w)?;
                }
                w.verbatim(")")
            },
            Attr::Stream {
                ref mut data,
                expected_length,
                start_from,
                max_length,
                binary,
            } => {
                let mut ls = LiteralSource::of_window(
                    mem::replace(data, Box::new(&[][..])),
                    expected_length,
                    start_from,
                    max_length,
                    binary,
                );
                w.literal_source(&mut ls)
            },
        }
    }
}

impl fmt::Debug for Attr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Attr::Atom(ref a) => write!(f, "Atom({:?})", a),
            Attr::Num(n) => write!(f, "Num({})", n),
            Attr::String(ref s) => write!(f, "String({:?})", s),
            Attr::Literal(ref ls) => write!(f, "Literal({:?})", ls),
            Attr::Nil => write!(f, "Nil"),
            Attr::List(ref items) => {
                f.debug_tuple("List").field(items).finish()
            },
            Attr::Stream {
                expected_length,
                start_from,
                max_length,
                ..
            } => f
                .debug_struct("Stream")
                .field("expected_length", &expected_length)
                .field("start_from", &start_from)
                .field("max_length", &max_length)
                .finish(),
        }
    }
}

/// The condition word of a status response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RespCondType {
    Ok,
    No,
    Bad,
    Bye,
    Preauth,
}

impl RespCondType {
    fn name(self) -> &'static str {
        match self {
            RespCondType::Ok => "OK",
            RespCondType::No => "NO",
            RespCondType::Bad => "BAD",
            RespCondType::Bye => "BYE",
            RespCondType::Preauth => "PREAUTH",
        }
    }
}

/// The bracketed response code of a status response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RespTextCode {
    Alert,
    Parse,
    ReadOnly,
    ReadWrite,
    TryCreate,
    Limit,
    ServerBug,
    CompressionActive,
    Capability(Vec<Cow<'static, str>>),
    PermanentFlags(Vec<Cow<'static, str>>),
    UidValidity(u32),
    UidNext(u32),
    Unseen(u32),
    HighestModseq(u64),
}

impl RespTextCode {
    fn write_to(
        &self,
        w: &mut LexWriter<impl LexOutput>,
    ) -> io::Result<()> {
        w.verbatim("[")?;
        match *self {
            RespTextCode::Alert => w.verbatim("ALERT")?,
            RespTextCode::Parse => w.verbatim("PARSE")?,
            RespTextCode::ReadOnly => w.verbatim("READ-ONLY")?,
            RespTextCode::ReadWrite => w.verbatim("READ-WRITE")?,
            RespTextCode::TryCreate => w.verbatim("TRYCREATE")?,
            RespTextCode::Limit => w.verbatim("LIMIT")?,
            RespTextCode::ServerBug => w.verbatim("SERVERBUG")?,
            RespTextCode::CompressionActive => {
                w.verbatim("COMPRESSIONACTIVE")?
            },
            RespTextCode::Capability(ref caps) => {
                w.verbatim("CAPABILITY")?;
                for cap in caps {
                    w.verbatim(" ")?;
                    w.verbatim(cap)?;
                }
            },
            RespTextCode::PermanentFlags(ref flags) => {
                w.verbatim("PERMANENTFLAGS (")?;
                for (ix, flag) in flags.iter().enumerate() {
                    if ix > 0 {
                        w.verbatim(" ")?;
                    }
                    w.verbatim(flag)?;
                }
                w.verbatim(")")?;
            },
            RespTextCode::UidValidity(v) => {
                w.verbatim("UIDVALIDITY ")?;
                w.num_u32(v)?;
            },
            RespTextCode::UidNext(v) => {
                w.verbatim("UIDNEXT ")?;
                w.num_u32(v)?;
            },
            RespTextCode::Unseen(v) => {
                w.verbatim("UNSEEN ")?;
                w.num_u32(v)?;
            },
            RespTextCode::HighestModseq(v) => {
                w.verbatim("HIGHESTMODSEQ ")?;
                w.num_u64(v)?;
            },
        }
        w.verbatim("]")
    }
}

/// A status response: condition, optional code, human-readable text.
#[derive(Debug)]
pub struct CondResponse {
    pub cond: RespCondType,
    pub code: Option<RespTextCode>,
    pub quip: Option<Cow<'static, str>>,
}

/// A generic data response: `* <command> <attributes...>`.
#[derive(Debug)]
pub struct DataResponse {
    pub command: Cow<'static, str>,
    pub attributes: Vec<Attr>,
}

#[derive(Debug)]
pub enum Response {
    Cond(CondResponse),
    Data(DataResponse),
    /// `* <n> EXISTS`
    Exists(u32),
    /// `* <n> EXPUNGE`
    Expunge(u32),
    /// `* <seq> FETCH (<attributes>)`
    Fetch { seq: u32, attributes: Vec<Attr> },
}

impl Response {
    pub fn ok(quip: impl Into<Cow<'static, str>>) -> Self {
        Response::Cond(CondResponse {
            cond: RespCondType::Ok,
            code: None,
            quip: Some(quip.into()),
        })
    }

    pub fn no(quip: impl Into<Cow<'static, str>>) -> Self {
        Response::Cond(CondResponse {
            cond: RespCondType::No,
            code: None,
            quip: Some(quip.into()),
        })
    }

    pub fn bad(quip: impl Into<Cow<'static, str>>) -> Self {
        Response::Cond(CondResponse {
            cond: RespCondType::Bad,
            code: None,
            quip: Some(quip.into()),
        })
    }

    pub fn bye(quip: impl Into<Cow<'static, str>>) -> Self {
        Response::Cond(CondResponse {
            cond: RespCondType::Bye,
            code: None,
            quip: Some(quip.into()),
        })
    }

    pub fn is_bye(&self) -> bool {
        matches!(
            *self,
            Response::Cond(CondResponse {
                cond: RespCondType::Bye,
                ..
            })
        )
    }

    fn write_to(
        &mut self,
        w: &mut LexWriter<impl LexOutput>,
    ) -> io::Result<()> {
        match *self {
            Response::Cond(ref cr) => {
                w.verbatim(cr.cond.name())?;
                if let Some(ref code) = cr.code {
                    w.verbatim(" ")?;
                    code.write_to(w)?;
                }
                if let Some(ref quip) = cr.quip {
                    w.verbatim(" ")?;
                    w.verbatim(quip)?;
                }
                Ok(())
            },
            Response::Data(ref mut dr) => {
                w.verbatim(&dr.command)?;
                for attr in &mut dr.attributes {
                    w.verbatim(" ")?;
                    attr.write_to(w)?;
                }
                Ok(())
            },
            Response::Exists(n) => {
                w.num_u32(n)?;
                w.verbatim(" EXISTS")
            },
            Response::Expunge(n) => {
                w.num_u32(n)?;
                w.verbatim(" EXPUNGE")
            },
            Response::Fetch {
                seq,
                ref mut attributes,
            } => {
                w.num_u32(seq)?;
                w.verbatim(" FETCH (")?;
                for (ix, attr) in attributes.iter_mut().enumerate() {
                    if ix > 0 {
                        w.verbatim(" ")?;
                    }
                    attr.write_to(w)?;
                }
                w.verbatim(")")
            },
        }
    }
}

/// A full response line: optional tag plus response body.
///
/// Untagged responses are written with a `*` tag.
#[derive(Debug)]
pub struct ResponseLine {
    pub tag: Option<Cow<'static, str>>,
    pub response: Response,
}

impl ResponseLine {
    pub fn untagged(response: Response) -> Self {
        ResponseLine {
            tag: None,
            response,
        }
    }

    pub fn tagged(
        tag: impl Into<Cow<'static, str>>,
        response: Response,
    ) -> Self {
        ResponseLine {
            tag: Some(tag.into()),
            response,
        }
    }

    pub fn write_to(
        &mut self,
        w: &mut LexWriter<impl LexOutput>,
    ) -> io::Result<()> {
        match self.tag {
            Some(ref tag) => w.verbatim(tag)?,
            None => w.verbatim("*")?,
        }
        w.verbatim(" ")?;
        self.response.write_to(w)
    }
}
