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

//! The top-level handler: picks an upstream per policy, dials it, performs
//! the exchange, retries on failure, and updates health state.

use crate::{
    config::ForwardConfig,
    policy::Policy,
    proxy::Proxy,
    transport::Protocol,
    wire::{self, MAX_LEN},
};
use bytes::Bytes;
use domain::base::Message;
use std::{sync::Arc, time::Instant};
use tokio_util::sync::CancellationToken;

/// Errors arising while dispatching a query to the configured upstreams.
#[derive(thiserror::Error, Debug)]
pub enum ForwardError {
    /// Every configured proxy was either down or failed the exchange.
    #[error("all upstreams failed or were marked down")]
    AllUpstreamsFailed,

    /// The caller's cancellation token fired mid-dispatch.
    #[error("query was cancelled")]
    Cancelled,
}

/// Outcome of routing admission for a query: either this `Forward` owns
/// it, or it should be passed along to whatever comes next in the plugin
/// chain.
pub enum Admission {
    /// This forwarder should handle the query.
    Accept,
    /// Not ours: caller should hand the query to its `next` fallback.
    Delegate,
}

/// Maximum number of upstreams a single `Forward` may hold, matching the
/// reference design's hard cap.
pub const MAX_PROXIES: usize = 15;

/// The forwarding core for one `forward FROM TO...` directive: owns its
/// proxies and drives the selection/retry/failover loop.
pub struct Forward {
    from: String,
    ignored: Vec<String>,
    proxies: Vec<Arc<Proxy>>,
    policy: Policy,
    max_fails: u32,
    hc_interval: std::time::Duration,
    force_tcp: bool,
    uses_tls: bool,
}

impl Forward {
    /// Builds a `Forward` from a validated configuration, dialing nothing
    /// yet — proxies start lazily on first use; call [`Forward::start`] to
    /// launch their health-probe loops eagerly at server startup.
    pub fn from_config(config: &ForwardConfig) -> Self {
        let proxies = config
            .to
            .iter()
            .map(|spec| {
                #[cfg(feature = "dot-rustls")]
                let proxy = Proxy::new(spec.addr, config.expire, config.tls.clone());
                #[cfg(not(feature = "dot-rustls"))]
                let proxy = Proxy::new(spec.addr, config.expire);
                Arc::new(proxy)
            })
            .collect();

        Self {
            from: wire::normalize_zone(&config.from),
            ignored: config.except.iter().map(|z| wire::normalize_zone(z)).collect(),
            proxies,
            policy: config.policy.build(),
            max_fails: config.max_fails,
            hc_interval: config.health_check,
            force_tcp: config.force_tcp,
            uses_tls: config.tls.is_some(),
        }
    }

    /// Starts every proxy's background health-probe loop. Call once at
    /// server startup.
    pub fn start(&self) {
        for proxy in &self.proxies {
            proxy.start(self.hc_interval);
        }
    }

    /// Stops every proxy's probe and connection pool, in that order, as
    /// the reference design's shutdown sequence requires.
    pub async fn close(&self) {
        for proxy in &self.proxies {
            proxy.close().await;
        }
    }

    /// Decides whether this `Forward` should handle `query`, based on its
    /// QNAME against `from` and the `except` list.
    pub fn admit(&self, query: &Message<Bytes>) -> Admission {
        let qname = match wire::qname(query) {
            Some(n) => n,
            None => return Admission::Delegate,
        };
        if !wire::zone_matches(&qname, &self.from) {
            return Admission::Delegate;
        }
        if self.ignored.iter().any(|z| wire::zone_matches(&qname, z)) {
            return Admission::Delegate;
        }
        Admission::Accept
    }

    /// The upstream protocol to use for a query arriving over
    /// `inbound_udp`, honoring `force_tcp` and the TLS override.
    fn outbound_protocol(&self, inbound_udp: bool) -> Protocol {
        if self.uses_tls {
            return Protocol::TcpTls;
        }
        if self.force_tcp {
            return Protocol::Tcp;
        }
        if inbound_udp {
            Protocol::Udp
        } else {
            Protocol::Tcp
        }
    }

    /// Dispatches `query`, which arrived over `inbound_udp`, to the
    /// configured upstreams in the order `self.policy` selects, retrying
    /// on the next candidate until one succeeds or all are exhausted.
    /// Equivalent to [`Forward::serve_cancellable`] with a token that is
    /// never cancelled.
    ///
    /// Assumes the caller has already confirmed `admit` returned
    /// [`Admission::Accept`].
    pub async fn serve(
        &self,
        query: &Message<Bytes>,
        inbound_udp: bool,
    ) -> Result<Message<Bytes>, ForwardError> {
        self.serve_cancellable(query, inbound_udp, &CancellationToken::new())
            .await
    }

    /// Same as [`Forward::serve`], but aborts at the next safe point if
    /// `cancel` fires: before attempting the next candidate proxy, or
    /// mid-exchange with the current one. A cancelled exchange's
    /// connection is always dropped, never yielded back to the pool.
    pub async fn serve_cancellable(
        &self,
        query: &Message<Bytes>,
        inbound_udp: bool,
        cancel: &CancellationToken,
    ) -> Result<Message<Bytes>, ForwardError> {
        if self.proxies.is_empty() {
            return Err(ForwardError::AllUpstreamsFailed);
        }

        let proto = self.outbound_protocol(inbound_udp);
        let order = self.policy.order(self.proxies.len());

        for idx in order {
            if cancel.is_cancelled() {
                return Err(ForwardError::Cancelled);
            }

            let proxy = &self.proxies[idx];
            if proxy.down(self.max_fails) {
                log::debug!("skipping down upstream {}", proxy.addr());
                continue;
            }

            let (mut conn, cached) = match proxy.dial(proto).await {
                Ok(v) => v,
                Err(e) => {
                    log::warn!("dial to {} failed: {}", proxy.addr(), e);
                    proxy.record_failure();
                    proxy.healthcheck(self.hc_interval);
                    continue;
                }
            };
            log::debug!(
                "dialed {} over {} (cached = {})",
                proxy.addr(),
                proto,
                cached
            );

            let started = Instant::now();
            let outbound = wire::randomize_id(query);
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    // `conn` is dropped here rather than yielded: a
                    // cancelled exchange's connection state is unknown.
                    log::debug!("query cancelled mid-exchange with {}", proxy.addr());
                    return Err(ForwardError::Cancelled);
                }
                res = conn.exchange(&outbound, crate::proxy::DEFAULT_TIMEOUT) => {
                    match res {
                        Ok(r) => r,
                        Err(e) => {
                            log::warn!("exchange with {} failed: {}", proxy.addr(), e);
                            proxy.record_failure();
                            proxy.healthcheck(self.hc_interval);
                            continue;
                        }
                    }
                }
            };

            if proto == Protocol::Udp && wire::is_truncated(&response) {
                log::debug!(
                    "{} returned a truncated response, retrying over tcp",
                    proxy.addr()
                );
                // The UDP connection is dropped without being yielded: the
                // reference design treats a truncated answer the same as
                // any other exchange failure for pooling purposes, and we
                // are about to open a fresh TCP connection anyway.
                match self.retry_over_tcp(proxy, query).await {
                    Ok(resp) => {
                        proxy.update_rtt(started.elapsed());
                        proxy.record_success();
                        return Ok(wire::set_id(&resp, query.header().id()));
                    }
                    Err(e) => {
                        log::warn!("tcp retry to {} failed: {}", proxy.addr(), e);
                        proxy.record_failure();
                        proxy.healthcheck(self.hc_interval);
                        continue;
                    }
                }
            }

            proxy.update_rtt(started.elapsed());
            proxy.yield_conn(conn).await;
            proxy.record_success();
            return Ok(wire::set_id(&response, query.header().id()));
        }

        Err(ForwardError::AllUpstreamsFailed)
    }

    /// Re-issues `query` over a fresh TCP connection to `proxy`, used when
    /// a UDP exchange came back truncated.
    async fn retry_over_tcp(
        &self,
        proxy: &Arc<Proxy>,
        query: &Message<Bytes>,
    ) -> std::io::Result<Message<Bytes>> {
        let (mut conn, _cached) = proxy
            .dial(Protocol::Tcp)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let outbound = wire::randomize_id(query);
        let response = conn.exchange(&outbound, crate::proxy::DEFAULT_TIMEOUT).await?;
        proxy.yield_conn(conn).await;
        Ok(response)
    }

    /// Builds a SERVFAIL answer for `query`, used by callers after `serve`
    /// returns [`ForwardError::AllUpstreamsFailed`].
    pub fn servfail(query: &Message<Bytes>) -> Message<Bytes> {
        wire::servfail(query)
    }

    /// Zone suffix this forwarder was configured for.
    pub fn from(&self) -> &str {
        &self.from
    }

    /// Read-only view of the configured proxies, for tests and metrics.
    pub fn proxies(&self) -> &[Arc<Proxy>] {
        &self.proxies
    }
}

/// An outgoing message cannot exceed this length; used when sizing
/// scratch buffers around `Forward`.
pub const _MAX_MESSAGE_LEN: usize = MAX_LEN;
