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

//! Skua is a per-connection IMAP4rev1 server engine.
//!
//! It owns the protocol runtime of one client connection: framing the
//! command stream (literals included), assembling and dispatching commands,
//! serialising responses, multiplexing out-of-band mailbox notifications
//! into the reply stream with correct sequence/UID semantics, and surviving
//! TLS upgrades, compression toggles, IDLE, timeouts, and abrupt
//! disconnection.
//!
//! It deliberately does not own transport acceptance, the mailbox store, or
//! the command handlers; those arrive through the traits in
//! [`imap::server`] and [`imap::notify`].

pub mod imap;
pub mod support;

#[cfg(test)]
static INIT_TEST_LOG: std::sync::Once = std::sync::Once::new();

#[cfg(test)]
fn init_test_log() {
    INIT_TEST_LOG.call_once(|| {
        if !std::env::var("TEST_LOG").ok().map_or(false, |v| "1" == v) {
            return;
        }

        let stderr = log4rs::append::console::ConsoleAppender::builder()
            .target(log4rs::append::console::Target::Stderr)
            .encoder(Box::new(
                log4rs::encode::pattern::PatternEncoder::new(
                    "{d(%H:%M:%S%.3f)} [{l}][{t}] {m}{n}",
                ),
            ))
            .build();
        let log_config = log4rs::config::Config::builder()
            .appender(
                log4rs::config::Appender::builder()
                    .build("stderr", Box::new(stderr)),
            )
            .build(
                log4rs::config::Root::builder()
                    .appender("stderr")
                    .build(log::LevelFilter::Trace),
            )
            .unwrap();
        log4rs::init_config(log_config).unwrap();
    })
}
