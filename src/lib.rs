// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! Upstream forwarding core for a recursive/forwarding DNS server.
//!
//! This crate is the piece that sits between an already-parsed inbound DNS
//! query and a set of configured upstream resolvers: it owns a
//! per-upstream connection pool ([`transport`]), a selection policy
//! ([`policy`]) across a set of upstreams ([`proxy`]), an asynchronous
//! health-check loop ([`health`]) that tracks which upstreams are failing,
//! and the dispatch loop that ties them together ([`forward`]). A
//! DNS-over-HTTPS shim ([`doh`], behind the `doh` feature) adapts the same
//! dispatch path to an HTTP request/response body instead of a persistent
//! connection.
//!
//! What this crate deliberately does not do: serve authoritative zones,
//! cache DNS *answers* (only connections), validate DNSSEC, or host a
//! generic plugin chain. See `forward`'s directive table for the
//! configuration surface this crate expects to be driven by.

pub mod config;
pub mod error;
pub mod forward;
pub mod health;
pub mod policy;
pub mod proxy;
pub mod transport;
pub mod wire;

#[cfg(feature = "doh")]
pub mod doh;

pub use config::{ConfigError, ForwardConfig};
pub use error::{Error, Result};
pub use forward::{Forward, ForwardError};
pub use policy::Policy;
pub use proxy::Proxy;
pub use transport::{Transport, TransportError};

#[cfg(feature = "doh")]
pub use doh::DohError;
