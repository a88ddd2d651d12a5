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

//! Best-effort reverse resolution of the peer address.
//!
//! The resolved name is only used for logging and the session record, so
//! every failure mode (no resolver configured, NXDOMAIN, timeout) degrades to
//! the bracketed IP literal.

use std::net::IpAddr;
use std::time::Duration;

pub type Resolver = hickory_resolver::AsyncResolver<
    hickory_resolver::name_server::GenericConnector<
        hickory_resolver::name_server::TokioRuntimeProvider,
    >,
>;

/// Formats `addr` the way it appears when no PTR record is known.
pub fn ip_literal(addr: IpAddr) -> String {
    format!("[{}]", addr)
}

/// Resolves the client hostname for `addr`, never failing.
///
/// The lookup is capped at `limit`; on expiry or error the bracketed IP
/// literal is returned instead.
pub async fn client_hostname(
    resolver: Option<&Resolver>,
    addr: IpAddr,
    limit: Duration,
) -> String {
    let Some(resolver) = resolver else {
        return ip_literal(addr);
    };

    match tokio::time::timeout(limit, resolver.reverse_lookup(addr)).await {
        Ok(Ok(names)) => names
            .iter()
            .next()
            .map(|name| {
                let name = name.to_string();
                name.trim_end_matches('.').to_owned()
            })
            .unwrap_or_else(|| ip_literal(addr)),
        Ok(Err(_)) | Err(_) => ip_literal(addr),
    }
}
