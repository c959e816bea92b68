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

//! A single upstream: its address, its connection pool, its failure
//! counter and RTT estimate, and the health probe that watches it.

use crate::{
    health::HealthProbe,
    transport::{Connection, Protocol, Transport, TransportError},
    wire::{self, ROOT_SOA_QUERY},
};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicI64, AtomicU32, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

#[cfg(feature = "dot-rustls")]
use crate::transport::TlsSetting;

/// Per-query timeout used both for the default RTT estimate and for the
/// exchange deadlines `Forward` applies, matching the reference design's
/// 2s read/write deadline.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

/// Weight given to the previous estimate in the RTT moving average
/// (`new = 0.75 * old + 0.25 * sample`).
const RTT_OLD_WEIGHT: f64 = 0.75;
const RTT_NEW_WEIGHT: f64 = 0.25;

/// One configured upstream. Cheap to clone: everything behind an `Arc` or
/// an atomic, so cloning a `Proxy` handle is just a handful of refcount
/// bumps, letting `Forward` pass owned handles into spawned health-check
/// tasks without lifetime gymnastics.
///
/// `fails` and `avg_rtt` are placed first so they stay 8-byte aligned on
/// 32-bit targets regardless of what else gets added to this struct.
pub struct Proxy {
    fails: AtomicU32,
    avg_rtt: AtomicI64,
    addr: SocketAddr,
    #[cfg(feature = "dot-rustls")]
    tls: Option<TlsSetting>,
    transport: Transport,
    probe: Arc<HealthProbe>,
}

impl Proxy {
    /// Builds a proxy for `addr`. `tls` is only meaningful for upstreams
    /// dialed over `tcp-tls`, and is threaded straight through to the
    /// underlying `Transport`.
    #[cfg(feature = "dot-rustls")]
    pub fn new(addr: SocketAddr, expire: Duration, tls: Option<TlsSetting>) -> Self {
        Self {
            fails: AtomicU32::new(0),
            avg_rtt: AtomicI64::new((DEFAULT_TIMEOUT.as_nanos() / 2) as i64),
            addr,
            tls: tls.clone(),
            transport: Transport::new(addr, expire, tls),
            probe: Arc::new(HealthProbe::new()),
        }
    }

    /// Builds a proxy for `addr` (TLS support compiled out).
    #[cfg(not(feature = "dot-rustls"))]
    pub fn new(addr: SocketAddr, expire: Duration) -> Self {
        Self {
            fails: AtomicU32::new(0),
            avg_rtt: AtomicI64::new((DEFAULT_TIMEOUT.as_nanos() / 2) as i64),
            addr,
            transport: Transport::new(addr, expire),
            probe: Arc::new(HealthProbe::new()),
        }
    }

    /// Upstream address this proxy talks to.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Current failure count.
    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::Acquire)
    }

    /// Current smoothed RTT estimate.
    pub fn avg_rtt(&self) -> Duration {
        Duration::from_nanos(self.avg_rtt.load(Ordering::Acquire).max(0) as u64)
    }

    /// True iff `fails` is strictly greater than `max_fails`. `max_fails ==
    /// 0` means "never considered down" regardless of the failure count.
    pub fn down(&self, max_fails: u32) -> bool {
        max_fails != 0 && self.fails() > max_fails
    }

    /// Borrows a connection for `proto` from this proxy's pool.
    pub async fn dial(&self, proto: Protocol) -> Result<(Connection, bool), TransportError> {
        self.transport.dial(proto).await
    }

    /// Returns `conn` to this proxy's pool.
    pub async fn yield_conn(&self, conn: Connection) {
        self.transport.yield_conn(conn).await;
    }

    /// Resets `fails` to zero, as happens after a successful exchange.
    pub fn record_success(&self) {
        self.fails.store(0, Ordering::Release);
    }

    /// Increments `fails` by one, as happens after a failed dial or
    /// exchange.
    pub fn record_failure(&self) {
        self.fails.fetch_add(1, Ordering::AcqRel);
    }

    /// Folds a freshly measured round trip into the smoothed estimate.
    pub fn update_rtt(&self, sample: Duration) {
        let old = self.avg_rtt.load(Ordering::Acquire) as f64;
        let new = RTT_OLD_WEIGHT * old + RTT_NEW_WEIGHT * sample.as_nanos() as f64;
        self.avg_rtt.store(new as i64, Ordering::Release);
    }

    fn health_check_protocol(&self) -> Protocol {
        #[cfg(feature = "dot-rustls")]
        {
            if self.tls.is_some() {
                return Protocol::TcpTls;
            }
        }
        Protocol::Udp
    }

    /// Runs a single `SOA .` probe against this upstream over a fresh
    /// connection (outside the pool: a probe should not consume or poison
    /// a pooled connection a real query might otherwise reuse), updating
    /// `fails` on the result.
    async fn probe_once(&self) {
        let proto = self.health_check_protocol();
        #[cfg(feature = "dot-rustls")]
        let tls = self.tls.as_ref();
        #[cfg(not(feature = "dot-rustls"))]
        let tls: Option<&crate::transport::TlsSetting> = None;

        let outcome = async {
            let mut conn = Connection::dial(proto, self.addr, tls).await?;
            conn.exchange(&wire::randomize_id(&ROOT_SOA_QUERY), DEFAULT_TIMEOUT)
                .await
        }
        .await;

        match outcome {
            Ok(resp) if wire::is_healthy_response(&resp) => {
                log::debug!("health check succeeded for {}", self.addr);
                self.record_success();
            }
            Ok(_) => {
                log::warn!("health check got a non-success rcode from {}", self.addr);
                self.record_failure();
            }
            Err(e) => {
                log::warn!("health check failed for {}: {}", self.addr, e);
                self.record_failure();
            }
        }
    }

    /// Fires a probe fire-and-forget; `HealthProbe` deduplicates concurrent
    /// or too-frequent calls. Intended to be called after any failed
    /// exchange.
    pub fn healthcheck(self: &Arc<Self>, interval: Duration) {
        let this = self.clone();
        let probe = this.probe.clone();
        tokio::spawn(async move {
            probe
                .check(interval, move || {
                    let this = this.clone();
                    async move { this.probe_once().await }
                })
                .await;
        });
    }

    /// Starts the background probe loop at `interval`.
    pub fn start(self: &Arc<Self>, interval: Duration) {
        let this = self.clone();
        let probe = this.probe.clone();
        probe.start(interval, move || {
            let this = this.clone();
            async move { this.probe_once().await }
        });
    }

    /// Updates the idle-connection expiry applied by this proxy's pool.
    pub async fn set_expire(&self, expire: Duration) {
        self.transport.set_expire(expire).await;
    }

    /// Stops the health probe, then the connection pool, in that order.
    pub async fn close(&self) {
        self.probe.stop().await;
        self.transport.close().await;
        log::info!("closed proxy {}", self.addr);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_proxy(addr: SocketAddr) -> Proxy {
        #[cfg(feature = "dot-rustls")]
        return Proxy::new(addr, Duration::from_secs(10), None);
        #[cfg(not(feature = "dot-rustls"))]
        return Proxy::new(addr, Duration::from_secs(10));
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:1".parse().unwrap()
    }

    #[test]
    fn down_is_false_for_zero_max_fails() {
        let proxy = new_proxy(loopback());
        proxy.record_failure();
        proxy.record_failure();
        proxy.record_failure();
        assert!(!proxy.down(0));
    }

    #[test]
    fn down_is_true_only_strictly_above_threshold() {
        let proxy = new_proxy(loopback());
        proxy.record_failure();
        proxy.record_failure();
        assert!(!proxy.down(2));
        proxy.record_failure();
        assert!(proxy.down(2));
    }

    #[test]
    fn success_resets_fails() {
        let proxy = new_proxy(loopback());
        proxy.record_failure();
        proxy.record_failure();
        proxy.record_success();
        assert_eq!(proxy.fails(), 0);
    }

    #[test]
    fn rtt_moves_toward_samples() {
        let proxy = new_proxy(loopback());
        let before = proxy.avg_rtt();
        proxy.update_rtt(Duration::from_millis(1));
        let after = proxy.avg_rtt();
        assert!(after < before);
    }
}
