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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Command line too long")]
    CommandLineTooLong,
    #[error("Literal too large")]
    LiteralTooLarge { length: u32, non_sync: bool },
    #[error("Malformed literal declaration")]
    BadLiteral,
    #[error("Unrecognised command syntax")]
    BadSyntax,
    #[error("Command not allowed in this state")]
    BadState,
    #[error("Connection upgrade in progress")]
    UpgradeInProgress,
    #[error("Authentication rejected")]
    AuthRejected,
    #[error("Transient storage failure")]
    Storage,
    #[error("Inconsistent mailbox state")]
    Inconsistent,
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error ends the connection with no farewell at all.
    ///
    /// Losing the peer mid-stream is routine; anything else gets logged at
    /// error level before the connection dies.
    pub fn is_silent_disconnect(&self) -> bool {
        match *self {
            Error::Io(ref e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionReset
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}
