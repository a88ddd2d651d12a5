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

//! Assembles multi-frame commands into parsed command records.
//!
//! The assembler accumulates the frames and literal payloads of one command
//! until the final frame arrives, then tokenises the accumulated text into a
//! `Command`. Handlers interpret the argument tree themselves; the engine
//! only understands the lexical shapes (atoms, quoted strings, literal
//! references, and parenthesised lists).

use crate::support::error::Error;

use super::frame::Frame;

/// A fully assembled and tokenised command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Command {
    pub tag: String,
    /// The verb, upper-cased. `UID COPY`/`FETCH`/`SEARCH`/`STORE` fold into
    /// a single two-word verb.
    pub verb: String,
    pub arguments: Vec<Argument>,
    /// Literal payloads, referenced by index from `arguments`.
    pub literals: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Argument {
    /// A bare atom. Bracketed forms such as `BODY[TEXT]` arrive as one atom.
    Atom(String),
    /// A quoted string, with escapes already resolved.
    QuotedString(String),
    /// The index of an entry in `Command::literals`.
    LiteralRef(usize),
    /// A parenthesised list.
    List(Vec<Argument>),
}

/// Accumulates one command's frames and literals.
///
/// The assembler is reusable: `finish` (or `abort`) resets it for the next
/// command.
pub struct Assembler {
    max_command: usize,
    parts: Vec<Part>,
    literals: Vec<Vec<u8>>,
    text_size: usize,
}

#[derive(Debug)]
enum Part {
    Text(Vec<u8>),
    Literal(usize),
}

impl Assembler {
    pub fn new(max_command: usize) -> Self {
        Assembler {
            max_command,
            parts: Vec::new(),
            literals: Vec::new(),
            text_size: 0,
        }
    }

    /// Whether a command is currently being accumulated.
    pub fn in_progress(&self) -> bool {
        !self.parts.is_empty()
    }

    /// Adds one frame's command text.
    ///
    /// Text before the literal declaration (if any) joins the command; the
    /// caller is responsible for feeding the declared payload to
    /// `push_literal` afterwards.
    pub fn push_frame(&mut self, frame: &Frame<'_>) -> Result<(), Error> {
        let text = match frame.literal {
            Some(decl) => &frame.bytes[..decl.offset],
            None => frame.bytes,
        };

        self.text_size += text.len();
        if self.text_size > self.max_command {
            return Err(Error::CommandLineTooLong);
        }

        self.parts.push(Part::Text(text.to_owned()));
        Ok(())
    }

    /// Adds a literal payload belonging to the most recent frame.
    pub fn push_literal(&mut self, data: Vec<u8>) {
        let ix = self.literals.len();
        self.literals.push(data);
        self.parts.push(Part::Literal(ix));
    }

    /// The tag of the command under assembly, if one can be extracted.
    ///
    /// Used to address error responses for commands that never parse.
    pub fn tag_hint(&self) -> Option<String> {
        let Some(Part::Text(first)) = self.parts.first() else {
            return None;
        };

        let end = first
            .iter()
            .position(|&b| b == b' ')
            .unwrap_or(first.len());
        let tag = &first[..end];
        if tag.is_empty()
            || !tag
                .iter()
                .all(|&b| b.is_ascii_graphic() && b != b'+' && b != b'*')
        {
            return None;
        }

        Some(String::from_utf8_lossy(tag).into_owned())
    }

    /// Discards the command under assembly.
    pub fn abort(&mut self) {
        self.parts.clear();
        self.literals.clear();
        self.text_size = 0;
    }

    /// Completes assembly, yielding the parsed command.
    pub fn finish(&mut self) -> Result<Command, Error> {
        let parts = std::mem::take(&mut self.parts);
        let literals = std::mem::take(&mut self.literals);
        self.text_size = 0;

        let mut tokens = Tokenizer::new(&parts).tokenize()?;
        if tokens.is_empty() {
            return Err(Error::BadSyntax);
        }

        let tag = match tokens.remove(0) {
            Argument::Atom(tag)
                if !tag.contains('+') && !tag.contains('*') =>
            {
                tag
            },
            _ => return Err(Error::BadSyntax),
        };

        let mut verb = match tokens.first() {
            Some(Argument::Atom(v)) => {
                let v = v.to_ascii_uppercase();
                tokens.remove(0);
                v
            },
            _ => return Err(Error::BadSyntax),
        };

        // UID is a prefix modifier, not a command of its own.
        if "UID" == verb {
            if let Some(Argument::Atom(sub)) = tokens.first() {
                verb.push(' ');
                verb.push_str(&sub.to_ascii_uppercase());
                tokens.remove(0);
            } else {
                return Err(Error::BadSyntax);
            }
        }

        Ok(Command {
            tag,
            verb,
            arguments: tokens,
            literals,
        })
    }
}

struct Tokenizer<'a> {
    parts: &'a [Part],
    /// Index into `parts`.
    part: usize,
    /// Byte offset within the current text part.
    pos: usize,
}

impl<'a> Tokenizer<'a> {
    fn new(parts: &'a [Part]) -> Self {
        Tokenizer {
            parts,
            part: 0,
            pos: 0,
        }
    }

    fn tokenize(&mut self) -> Result<Vec<Argument>, Error> {
        self.sequence(0)
    }

    fn sequence(&mut self, depth: u32) -> Result<Vec<Argument>, Error> {
        let mut args = Vec::new();

        loop {
            match self.current() {
                None => {
                    // Running out of input inside a list means an
                    // unterminated list.
                    if depth > 0 {
                        return Err(Error::BadSyntax);
                    }
                    return Ok(args);
                },
                Some(Part::Literal(ix)) => {
                    args.push(Argument::LiteralRef(*ix));
                    self.part += 1;
                    self.pos = 0;
                },
                Some(Part::Text(text)) => {
                    if self.pos >= text.len() {
                        self.part += 1;
                        self.pos = 0;
                        continue;
                    }

                    match text[self.pos] {
                        b' ' => self.pos += 1,
                        b'(' => {
                            self.pos += 1;
                            args.push(Argument::List(
                                self.sequence(depth + 1)?,
                            ));
                            // sequence() consumed the matching ')'.
                        },
                        b')' => {
                            if 0 == depth {
                                return Err(Error::BadSyntax);
                            }
                            self.pos += 1;
                            return Ok(args);
                        },
                        b'"' => args.push(self.quoted_string(text)?),
                        _ => args.push(self.atom(text)),
                    }
                },
            }
        }
    }

    fn current(&self) -> Option<&'a Part> {
        let part = self.parts.get(self.part)?;
        // An exhausted text part defers to the part after it.
        if let Part::Text(text) = part {
            if self.pos >= text.len() && self.part + 1 >= self.parts.len() {
                return None;
            }
        }
        Some(part)
    }

    fn atom(&mut self, text: &[u8]) -> Argument {
        let start = self.pos;
        while self.pos < text.len()
            && !matches!(text[self.pos], b' ' | b'(' | b')' | b'"')
        {
            self.pos += 1;
        }

        Argument::Atom(
            String::from_utf8_lossy(&text[start..self.pos]).into_owned(),
        )
    }

    fn quoted_string(&mut self, text: &[u8]) -> Result<Argument, Error> {
        debug_assert_eq!(b'"', text[self.pos]);
        self.pos += 1;

        let mut value = Vec::new();
        while self.pos < text.len() {
            match text[self.pos] {
                b'"' => {
                    self.pos += 1;
                    return Ok(Argument::QuotedString(
                        String::from_utf8_lossy(&value).into_owned(),
                    ));
                },
                b'\\' => {
                    self.pos += 1;
                    if self.pos >= text.len() {
                        return Err(Error::BadSyntax);
                    }
                    value.push(text[self.pos]);
                    self.pos += 1;
                },
                b => {
                    value.push(b);
                    self.pos += 1;
                },
            }
        }

        // Line ended inside the quoted string.
        Err(Error::BadSyntax)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::imap::frame::LiteralDecl;

    fn final_frame(bytes: &[u8]) -> Frame<'_> {
        Frame {
            bytes,
            literal: None,
        }
    }

    fn assemble(lines: &[(&[u8], Option<&[u8]>)]) -> Result<Command, Error> {
        let mut asm = Assembler::new(1024);
        for (bytes, literal) in lines {
            match literal {
                Some(data) => {
                    let decl = LiteralDecl {
                        length: data.len() as u32,
                        non_sync: false,
                        binary: false,
                        offset: bytes.len(),
                    };
                    // Reconstitute the on-wire form: text then declaration.
                    let mut line = bytes.to_vec();
                    line.extend_from_slice(
                        format!("{{{}}}", data.len()).as_bytes(),
                    );
                    asm.push_frame(&Frame {
                        bytes: &line,
                        literal: Some(decl),
                    })?;
                    asm.push_literal(data.to_vec());
                },
                None => asm.push_frame(&final_frame(bytes))?,
            }
        }
        asm.finish()
    }

    #[test]
    fn simple_command() {
        let cmd = assemble(&[(b"a1 NOOP", None)]).unwrap();
        assert_eq!("a1", cmd.tag);
        assert_eq!("NOOP", cmd.verb);
        assert!(cmd.arguments.is_empty());
        assert!(cmd.literals.is_empty());
    }

    #[test]
    fn verb_case_folded() {
        let cmd = assemble(&[(b"a1 noop", None)]).unwrap();
        assert_eq!("NOOP", cmd.verb);
    }

    #[test]
    fn quoted_arguments() {
        let cmd =
            assemble(&[(b"a1 LOGIN \"us er\" \"p\\\"w\\\\d\"", None)])
                .unwrap();
        assert_eq!(
            vec![
                Argument::QuotedString("us er".to_owned()),
                Argument::QuotedString("p\"w\\d".to_owned()),
            ],
            cmd.arguments,
        );
    }

    #[test]
    fn nested_lists() {
        let cmd = assemble(&[(
            b"a1 STATUS INBOX (MESSAGES (DEEP LIST) UNSEEN)",
            None,
        )])
        .unwrap();
        assert_eq!(
            vec![
                Argument::Atom("INBOX".to_owned()),
                Argument::List(vec![
                    Argument::Atom("MESSAGES".to_owned()),
                    Argument::List(vec![
                        Argument::Atom("DEEP".to_owned()),
                        Argument::Atom("LIST".to_owned()),
                    ]),
                    Argument::Atom("UNSEEN".to_owned()),
                ]),
            ],
            cmd.arguments,
        );
    }

    #[test]
    fn literal_arguments() {
        let cmd = assemble(&[
            (b"a1 LOGIN ", Some(b"us er")),
            (b" ", Some(b"pw")),
            (b"", None),
        ])
        .unwrap();
        assert_eq!(
            vec![Argument::LiteralRef(0), Argument::LiteralRef(1)],
            cmd.arguments,
        );
        assert_eq!(
            vec![b"us er".to_vec(), b"pw".to_vec()],
            cmd.literals,
        );
    }

    #[test]
    fn uid_verbs_fold() {
        let cmd = assemble(&[(b"a1 UID fetch 1:* FLAGS", None)]).unwrap();
        assert_eq!("UID FETCH", cmd.verb);
        assert_eq!(
            vec![
                Argument::Atom("1:*".to_owned()),
                Argument::Atom("FLAGS".to_owned()),
            ],
            cmd.arguments,
        );
    }

    #[test]
    fn bracketed_atoms_stay_whole() {
        let cmd =
            assemble(&[(b"a1 FETCH 1 BODY[HEADER.FIELDS (DATE)]", None)]);
        // The parenthesised group inside the bracket splits the atom; that
        // is fine, handlers see the same token stream the wire carries.
        let cmd = cmd.unwrap();
        assert_eq!("FETCH", cmd.verb);
        assert_eq!(
            vec![
                Argument::Atom("1".to_owned()),
                Argument::Atom("BODY[HEADER.FIELDS".to_owned()),
                Argument::List(vec![Argument::Atom("DATE".to_owned())]),
                Argument::Atom("]".to_owned()),
            ],
            cmd.arguments,
        );
    }

    #[test]
    fn syntax_errors() {
        assert!(matches!(
            assemble(&[(b"", None)]),
            Err(Error::BadSyntax)
        ));
        assert!(matches!(
            assemble(&[(b"a1", None)]),
            Err(Error::BadSyntax)
        ));
        assert!(matches!(
            assemble(&[(b"a1 LIST (unterminated", None)]),
            Err(Error::BadSyntax)
        ));
        assert!(matches!(
            assemble(&[(b"a1 LIST )stray", None)]),
            Err(Error::BadSyntax)
        ));
        assert!(matches!(
            assemble(&[(b"a1 LOGIN \"unterminated", None)]),
            Err(Error::BadSyntax)
        ));
        assert!(matches!(
            assemble(&[(b"* NOOP", None)]),
            Err(Error::BadSyntax)
        ));
        assert!(matches!(
            assemble(&[(b"a1 UID", None)]),
            Err(Error::BadSyntax)
        ));
    }

    #[test]
    fn oversized_command_rejected() {
        let mut asm = Assembler::new(16);
        let long = vec![b'x'; 32];
        assert!(matches!(
            asm.push_frame(&final_frame(&long)),
            Err(Error::CommandLineTooLong),
        ));
    }

    #[test]
    fn tag_hint_and_abort() {
        let mut asm = Assembler::new(1024);
        asm.push_frame(&final_frame(b"a9 BOGUS ((((")).unwrap();
        assert_eq!(Some("a9".to_owned()), asm.tag_hint());
        assert!(asm.in_progress());
        asm.abort();
        assert!(!asm.in_progress());
        assert_eq!(None, asm.tag_hint());
    }
}
