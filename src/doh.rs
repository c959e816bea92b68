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

//! Adapts an HTTP request carrying a wire-format DNS message onto
//! [`Forward::serve`], the same call path a plain UDP or TCP listener
//! would use.
//!
//! There is no persistent response-writer object here the way a
//! connection-oriented listener needs one: an HTTP handler already gets a
//! single request and produces a single response, so "capturing the
//! response in memory instead of emitting it to a wire" is simply this
//! function's return value. The response-writer capability set the
//! specification describes (remote/local address reporting, no-op TSIG and
//! hijack methods) collapses to the ordinary `axum` request/response types.

use crate::{forward::Admission, wire, Forward};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::sync::Arc;

/// The obsolete draft mimetype, still seen from older clients.
pub const MIME_DRAFT: &str = "application/dns-udpwireformat";
/// The mimetype the final RFC settled on; always used on output.
pub const MIME_RFC: &str = "application/dns-message";

/// Errors specific to the DoH shim. Always surfaced as an HTTP 400 with
/// the error text as the body.
#[derive(thiserror::Error, Debug)]
pub enum DohError {
    /// The request body was not a well-formed DNS message.
    #[error("malformed DNS message in request body: {0}")]
    Malformed(#[from] domain::base::ShortBuf),

    /// The request carried a `content-type` this shim does not accept.
    #[error("unsupported content-type {0:?}: expected {MIME_RFC:?} or {MIME_DRAFT:?}")]
    UnsupportedContentType(String),
}

impl IntoResponse for DohError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}

fn content_type_ok(headers: &HeaderMap) -> Result<(), DohError> {
    let ct = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    // Some clients append a charset or other parameter; compare only the
    // mimetype itself.
    let bare = ct.split(';').next().unwrap_or("").trim();
    if bare == MIME_RFC || bare == MIME_DRAFT {
        Ok(())
    } else {
        Err(DohError::UnsupportedContentType(ct.to_string()))
    }
}

/// `POST /*` handler: parses the body as a DNS query, dispatches it
/// through `forward` exactly as a plain listener would, and serializes
/// whatever answer comes back (including a SERVFAIL, if every upstream
/// failed) as the HTTP response body.
///
/// DoH is treated as a reliable, connection-oriented transport for the
/// purposes of `Forward::serve`'s protocol selection (i.e. never eligible
/// for the UDP truncate-and-retry path): HTTP itself never truncates a
/// response the way a single UDP datagram can.
pub async fn handle(
    State(forward): State<Arc<Forward>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, DohError> {
    content_type_ok(&headers)?;

    let query = wire::parse(body)?;

    let response = match forward.admit(&query) {
        Admission::Accept => match forward.serve(&query, false).await {
            Ok(resp) => resp,
            Err(e) => {
                log::warn!("doh request failed: {}", e);
                Forward::servfail(&query)
            }
        },
        // There is no `next` plugin chain at this layer (out of scope per
        // the purpose & scope section); a query outside this forwarder's
        // zone is the caller's routing mistake, so answer SERVFAIL rather
        // than silently dropping the request.
        Admission::Delegate => Forward::servfail(&query),
    };

    let mut headers = HeaderMap::new();
    headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(MIME_RFC));
    Ok((headers, Bytes::copy_from_slice(response.as_slice())).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{self, PolicyKind, UpstreamSpec};
    use axum::http::Request;
    use domain::base::{iana::Rtype, Dname, MessageBuilder};
    use std::{
        net::{Ipv4Addr, SocketAddr, SocketAddrV4},
        str::FromStr,
        time::Duration,
    };
    use tokio::net::UdpSocket;
    use tower::ServiceExt;

    fn dnskey_query(name: &str) -> Bytes {
        let dname = Dname::<Bytes>::from_str(name).unwrap();
        let mut builder = MessageBuilder::from_target(bytes::BytesMut::with_capacity(512))
            .unwrap()
            .question();
        builder.push((&dname, Rtype::Dnskey)).unwrap();
        Bytes::copy_from_slice(builder.into_message().as_slice())
    }

    async fn echo_server() -> SocketAddr {
        let sock = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
            .await
            .unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let (n, from) = match sock.recv_from(&mut buf).await {
                    Ok(v) => v,
                    Err(_) => return,
                };
                let _ = sock.send_to(&buf[..n], from).await;
            }
        });
        addr
    }

    fn router(forward: Arc<Forward>) -> axum::Router {
        axum::Router::new()
            .route("/dns-query", axum::routing::post(handle))
            .with_state(forward)
    }

    #[tokio::test]
    async fn round_trips_a_dnskey_query() {
        let addr = echo_server().await;
        let config = config::ForwardConfig {
            from: ".".into(),
            to: vec![UpstreamSpec { addr, tls: false }],
            except: vec![],
            max_fails: 2,
            health_check: Duration::from_millis(500),
            force_tcp: false,
            tls: None,
            tls_servername: None,
            expire: Duration::from_secs(10),
            policy: PolicyKind::Random,
        };
        let forward = Arc::new(Forward::from_config(&config));

        let body = dnskey_query("example.org.");
        let req = Request::builder()
            .method("POST")
            .uri("/dns-query")
            .header(header::CONTENT_TYPE, MIME_DRAFT)
            .body(axum::body::Body::from(body))
            .unwrap();

        let resp = router(forward).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            MIME_RFC
        );

        let bytes = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        let msg = wire::parse(bytes).unwrap();
        let q = msg.first_question().unwrap();
        assert_eq!(q.qname().to_string(), "example.org.");
        assert_eq!(q.qtype(), Rtype::Dnskey);
    }

    #[tokio::test]
    async fn rejects_unsupported_content_type() {
        let config = config::ForwardConfig {
            from: ".".into(),
            to: vec![],
            except: vec![],
            max_fails: 2,
            health_check: Duration::from_millis(500),
            force_tcp: false,
            tls: None,
            tls_servername: None,
            expire: Duration::from_secs(10),
            policy: PolicyKind::Random,
        };
        let forward = Arc::new(Forward::from_config(&config));

        let req = Request::builder()
            .method("POST")
            .uri("/dns-query")
            .header(header::CONTENT_TYPE, "text/plain")
            .body(axum::body::Body::from(dnskey_query("example.org.")))
            .unwrap();

        let resp = router(forward).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
