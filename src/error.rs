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

//! This module provides the universal error type used in the library. The error type uses `thiserror`.

pub use crate::{config::ConfigError, forward::ForwardError, transport::TransportError};
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// `Error` enumerates all possible errors returned by this library.
#[derive(Error, Debug)]
pub enum Error {
    /// Error encountered while parsing the `forward` directive block.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Error related to the connection pool (transport) of an upstream.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Error returned while dispatching a query to the configured upstreams.
    #[error(transparent)]
    Forward(#[from] ForwardError),

    /// Error related to the DNS-over-HTTPS shim.
    #[cfg(feature = "doh")]
    #[error(transparent)]
    Doh(#[from] crate::doh::DohError),
}
