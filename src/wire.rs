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

//! Thin helpers over the `domain` wire-format crate.
//!
//! This is deliberately small: we only need enough of the DNS message to
//! make admission decisions (QNAME/QTYPE), retry decisions (RCODE/TC) and to
//! build the two synthetic messages the core needs to construct itself
//! (a SERVFAIL answer and a root SOA health-check query). Everything else
//! is passed through untouched as opaque wire bytes.

use bytes::{Bytes, BytesMut};
use domain::base::{
    iana::{Rcode, Rtype},
    Dname, Message, MessageBuilder,
};
use once_cell::sync::Lazy;
use std::str::FromStr;

/// Maximum size we ever allocate for an outgoing message buffer.
pub const MAX_LEN: usize = 1232;

/// A health-check query: `SOA .`, built once and cloned (only the ID is
/// randomized per use) since its shape never changes.
pub static ROOT_SOA_QUERY: Lazy<Message<Bytes>> = Lazy::new(|| {
    let name = Dname::<Bytes>::root();
    let mut builder = MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))
        .expect("buffer large enough for an empty message")
        .question();
    builder
        .push((&name, Rtype::Soa))
        .expect("single question always fits");
    builder.into_message()
});

/// Parse wire-format bytes into a `Message`. Garbage input surfaces as the
/// underlying `domain` parse error, which callers treat as "discard and
/// keep waiting" (for connection-oriented exchanges) or as a hard failure
/// (for a single UDP datagram).
pub fn parse(buf: Bytes) -> Result<Message<Bytes>, domain::base::ShortBuf> {
    Message::from_octets(buf)
}

/// Serialize a query with a fresh random ID, matching the convention used
/// throughout this codebase of never reusing a cached message's ID.
pub fn randomize_id(msg: &Message<Bytes>) -> Message<Bytes> {
    let mut msg = Message::from_octets(BytesMut::from(msg.as_slice()))
        .expect("re-parsing our own just-serialized message cannot fail");
    msg.header_mut().set_random_id();
    Message::from_octets(Bytes::copy_from_slice(msg.as_slice())).expect("round trip is lossless")
}

/// Rewrites `msg`'s header ID to `id`. Used to restore the client's
/// original query ID on a response after the outbound query to the
/// upstream was sent under a randomized one.
pub fn set_id(msg: &Message<Bytes>, id: u16) -> Message<Bytes> {
    let mut msg = Message::from_octets(BytesMut::from(msg.as_slice()))
        .expect("re-parsing our own just-serialized message cannot fail");
    msg.header_mut().set_id(id);
    Message::from_octets(Bytes::copy_from_slice(msg.as_slice())).expect("round trip is lossless")
}

/// True if the response's TC (truncation) bit is set.
pub fn is_truncated(msg: &Message<Bytes>) -> bool {
    msg.header().tc()
}

/// The response code carried in the message header.
pub fn rcode(msg: &Message<Bytes>) -> Rcode {
    msg.header().rcode()
}

/// True if this is a "good" response worth trusting: a successful rcode, or
/// at least not a hard server failure. Matches the go original's loose
/// "non-nil error or non-success rcode" health-check gate.
pub fn is_healthy_response(msg: &Message<Bytes>) -> bool {
    matches!(rcode(msg), Rcode::NoError)
}

/// Build a SERVFAIL answer for `query`, preserving its ID and question
/// section, the way a forwarder falls back when every upstream has failed.
pub fn servfail(query: &Message<Bytes>) -> Message<Bytes> {
    MessageBuilder::from_target(BytesMut::with_capacity(MAX_LEN))
        .expect("buffer large enough for a SERVFAIL answer")
        .start_answer(query, Rcode::ServFail)
        .expect("building a plain SERVFAIL answer cannot fail")
        .into_message()
}

/// Returns the QNAME of the sole question in `msg`, or `None` if the
/// message carries no question (which admission treats as "not ours").
pub fn qname(msg: &Message<Bytes>) -> Option<String> {
    msg.first_question()
        .map(|q| q.qname().to_string().to_ascii_lowercase())
}

/// Normalizes a zone/domain string the way `plugin.Host(...).Normalize()`
/// does in the reference design: lowercase, with a trailing dot.
pub fn normalize_zone(zone: &str) -> String {
    let mut z = zone.to_ascii_lowercase();
    if !z.ends_with('.') {
        z.push('.');
    }
    z
}

/// True if `name` falls within `zone`, comparing whole labels from the
/// right so that `evilexample.org.` does not match zone `example.org.`.
pub fn zone_matches(name: &str, zone: &str) -> bool {
    let zone = normalize_zone(zone);
    if zone == "." {
        return true;
    }
    let name = normalize_zone(name);

    let name_labels: Vec<&str> = name.trim_end_matches('.').split('.').rev().collect();
    let zone_labels: Vec<&str> = zone.trim_end_matches('.').split('.').rev().collect();
    if zone_labels.len() > name_labels.len() {
        return false;
    }
    name_labels
        .iter()
        .zip(zone_labels.iter())
        .all(|(n, z)| n == z)
}

/// Parses a bare domain name into a `Dname`, used only by configuration
/// validation (e.g. `tls_servername`).
pub fn parse_name(name: &str) -> Result<Dname<Bytes>, domain::base::name::FromStrError> {
    Dname::from_str(name)
}
