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
use std::io::{self, Read};

/// A data source for literal items that aren't strings.
///
/// The data is pulled from the reader as it is written to the wire, so large
/// payloads never materialise in memory.
///
/// This struct has `PartialEq` and `Eq` implementations so that it fits in
/// with the response types. These only compare the non-data fields.
pub struct LiteralSource {
    /// The data for the literal.
    pub data: Box<dyn Read + Send>,
    /// The actual length of the literal.
    pub len: u64,
    /// Whether to use the binary syntax for the literal.
    pub binary: bool,
}

impl PartialEq for LiteralSource {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.binary == other.binary
    }
}

impl Eq for LiteralSource {}

impl fmt::Debug for LiteralSource {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LiteralSource")
            .field("data", &"<data>")
            .field("len", &self.len)
            .field("binary", &self.binary)
            .finish()
    }
}

impl LiteralSource {
    pub fn of_data(data: Vec<u8>, binary: bool) -> Self {
        let len = data.len() as u64;
        LiteralSource {
            data: Box::new(io::Cursor::new(data)),
            len,
            binary,
        }
    }

    pub fn of_reader(
        reader: impl Read + Send + 'static,
        len: u64,
        binary: bool,
    ) -> Self {
        LiteralSource {
            data: Box::new(reader),
            len,
            binary,
        }
    }

    /// Creates a literal covering a window of `reader`.
    ///
    /// `reader` is expected to produce exactly `expected_length` bytes. The
    /// literal starts `start_from` bytes in and covers at most `max_length`
    /// bytes (unbounded if `None`). The skipped prefix is consumed from the
    /// reader lazily, on the first read of the window.
    pub fn of_window(
        reader: impl Read + Send + 'static,
        expected_length: u64,
        start_from: u64,
        max_length: Option<u64>,
        binary: bool,
    ) -> Self {
        let mut len = expected_length.saturating_sub(start_from);
        if let Some(max) = max_length {
            len = len.min(max);
        }

        LiteralSource {
            data: Box::new(
                Window {
                    inner: reader,
                    skip: start_from,
                }
                .take(len),
            ),
            len,
            binary,
        }
    }
}

struct Window<R> {
    inner: R,
    skip: u64,
}

impl<R: Read> Read for Window<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut scratch = [0u8; 4096];
        while self.skip > 0 {
            let want = self.skip.min(scratch.len() as u64) as usize;
            let nread = self.inner.read(&mut scratch[..want])?;
            if 0 == nread {
                // Short input; let the caller see EOF.
                self.skip = 0;
                break;
            }
            self.skip -= nread as u64;
        }

        self.inner.read(buf)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn drain(mut ls: LiteralSource) -> Vec<u8> {
        let mut v = Vec::new();
        ls.data.read_to_end(&mut v).unwrap();
        v
    }

    #[test]
    fn whole_window() {
        let ls = LiteralSource::of_window(
            io::Cursor::new(b"hello world".to_vec()),
            11,
            0,
            None,
            false,
        );
        assert_eq!(11, ls.len);
        assert_eq!(b"hello world".to_vec(), drain(ls));
    }

    #[test]
    fn offset_window() {
        let ls = LiteralSource::of_window(
            io::Cursor::new(b"hello world".to_vec()),
            11,
            6,
            None,
            false,
        );
        assert_eq!(5, ls.len);
        assert_eq!(b"world".to_vec(), drain(ls));
    }

    #[test]
    fn truncated_window() {
        let ls = LiteralSource::of_window(
            io::Cursor::new(b"hello world".to_vec()),
            11,
            6,
            Some(3),
            false,
        );
        assert_eq!(3, ls.len);
        assert_eq!(b"wor".to_vec(), drain(ls));
    }

    #[test]
    fn window_past_end_is_empty() {
        let ls = LiteralSource::of_window(
            io::Cursor::new(b"hi".to_vec()),
            2,
            5,
            None,
            false,
        );
        assert_eq!(0, ls.len);
        assert_eq!(Vec::<u8>::new(), drain(ls));
    }
}
