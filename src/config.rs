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

//! Parses the `forward` plugin's own directive block, independent of any
//! outer Corefile/zone-file engine. The grammar is the token-per-line style
//! used throughout this family of plugins: one directive name followed by
//! its arguments, one directive per line.

use crate::{forward::MAX_PROXIES, policy::Policy};
use std::{net::SocketAddr, time::Duration};

#[cfg(feature = "dot-rustls")]
use crate::transport::TlsSetting;

/// Errors encountered while parsing a `forward` directive block. Always
/// fatal: a `ConfigError` prevents the server from starting.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// `forward` appeared more than once in one server block.
    #[error("\"forward\" directive may only be specified once per server block")]
    DuplicateForward,

    /// No `forward` directive was ever given.
    #[error("missing \"forward\" directive")]
    MissingForward,

    /// `forward` was given no upstream addresses.
    #[error("\"forward\" directive requires at least one upstream")]
    NoUpstreams,

    /// More than [`MAX_PROXIES`] upstreams were configured.
    #[error("\"forward\" directive accepts at most {MAX_PROXIES} upstreams, got {0}")]
    TooManyUpstreams(usize),

    /// An upstream address could not be parsed as `host:port`.
    #[error("invalid upstream address {0:?}: {1}")]
    InvalidAddress(String, std::net::AddrParseError),

    /// An upstream used an unsupported scheme (only `dns://` and `tls://`
    /// are implemented; `grpc://` is explicitly out of scope here).
    #[error("unsupported upstream scheme {0:?}")]
    UnsupportedScheme(String),

    /// A directive known to this parser was given a malformed or missing
    /// argument.
    #[error("directive {0:?}: {1}")]
    BadArgument(String, String),

    /// A duration-valued directive was given a bare integer or an
    /// unrecognized unit suffix; see REDESIGN FLAGS for why bare integers
    /// are rejected rather than guessed at.
    #[error("directive {0:?}: duration {1:?} needs an explicit unit suffix (ms, s, m, h)")]
    MissingDurationUnit(String, String),

    /// `policy` named something other than `random` or `round_robin`.
    #[error("unknown policy {0:?}")]
    UnknownPolicy(String),

    /// An unrecognized directive name appeared in the block.
    #[error("unknown directive {0:?}")]
    UnknownDirective(String),
}

/// One upstream as named in a `forward` directive: its dial address and
/// whether it was given the `tls://` scheme.
#[derive(Debug, Clone)]
pub struct UpstreamSpec {
    pub addr: SocketAddr,
    pub tls: bool,
}

/// The `policy` directive's two variants, kept separate from [`Policy`]
/// itself (which carries runtime state) so a `ForwardConfig` stays plain
/// data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyKind {
    Random,
    RoundRobin,
}

impl PolicyKind {
    fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "random" => Ok(Self::Random),
            "round_robin" => Ok(Self::RoundRobin),
            other => Err(ConfigError::UnknownPolicy(other.to_string())),
        }
    }

    /// Builds the runtime [`Policy`] this kind names.
    pub fn build(self) -> Policy {
        match self {
            Self::Random => Policy::Random,
            Self::RoundRobin => Policy::round_robin(),
        }
    }
}

/// Default down threshold (`max_fails`); zero means "never considered
/// down".
pub const DEFAULT_MAX_FAILS: u32 = 2;
/// Default health-check probe interval.
pub const DEFAULT_HEALTH_CHECK: Duration = Duration::from_millis(500);
/// Default idle-connection pool expiry.
pub const DEFAULT_EXPIRE: Duration = Duration::from_secs(10);
/// Port upstreams are rewritten to when TLS is enabled and the user left
/// the plain DNS port (53) in place.
const DOT_PORT: u16 = 853;
const PLAIN_PORT: u16 = 53;

/// The validated, in-memory result of parsing a `forward` block. Consumed
/// by [`crate::forward::Forward::from_config`] to build the running
/// handler.
pub struct ForwardConfig {
    pub from: String,
    pub to: Vec<UpstreamSpec>,
    pub except: Vec<String>,
    pub max_fails: u32,
    pub health_check: Duration,
    pub force_tcp: bool,
    #[cfg(feature = "dot-rustls")]
    pub tls: Option<TlsSetting>,
    #[cfg(not(feature = "dot-rustls"))]
    pub tls: Option<()>,
    pub tls_servername: Option<String>,
    pub expire: Duration,
    pub policy: PolicyKind,
}

/// Parses a duration literal with an explicit unit suffix (`ms`, `s`, `m`,
/// `h`); a bare integer is rejected rather than silently interpreted as
/// seconds or nanoseconds (see REDESIGN FLAGS).
fn parse_duration(directive: &str, raw: &str) -> Result<Duration, ConfigError> {
    let (digits, unit) = raw
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| raw.split_at(i))
        .ok_or_else(|| ConfigError::MissingDurationUnit(directive.to_string(), raw.to_string()))?;

    if digits.is_empty() {
        return Err(ConfigError::BadArgument(
            directive.to_string(),
            format!("not a duration: {raw:?}"),
        ));
    }
    let n: u64 = digits
        .parse()
        .map_err(|_| ConfigError::BadArgument(directive.to_string(), format!("not a number: {digits:?}")))?;

    match unit {
        "ms" => Ok(Duration::from_millis(n)),
        "s" => Ok(Duration::from_secs(n)),
        "m" => Ok(Duration::from_secs(n * 60)),
        "h" => Ok(Duration::from_secs(n * 3600)),
        _ => Err(ConfigError::MissingDurationUnit(
            directive.to_string(),
            raw.to_string(),
        )),
    }
}

/// Splits `scheme://host:port` (or a bare `host:port`, defaulting to the
/// `dns://` scheme) and resolves it to a dial address, rewriting port 53
/// to 853 when the scheme (or an outer `tls` directive) requires TLS.
fn parse_upstream(token: &str, force_tls: bool) -> Result<UpstreamSpec, ConfigError> {
    let (scheme, rest) = match token.split_once("://") {
        Some((scheme, rest)) => (scheme, rest),
        None => ("dns", token),
    };

    let tls = match scheme {
        "dns" => force_tls,
        "tls" => true,
        "grpc" => return Err(ConfigError::UnsupportedScheme(token.to_string())),
        other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
    };

    let mut addr: SocketAddr = rest
        .parse()
        .map_err(|e| ConfigError::InvalidAddress(rest.to_string(), e))?;

    if tls && addr.port() == PLAIN_PORT {
        addr.set_port(DOT_PORT);
    }

    Ok(UpstreamSpec { addr, tls })
}

/// Parses a `forward` directive block: one directive per line, already
/// split into whitespace-separated tokens by the caller (this does not
/// parse an outer Corefile; it only understands the tokens that belong to
/// this plugin's own block).
pub fn parse(lines: &[Vec<&str>]) -> Result<ForwardConfig, ConfigError> {
    let mut from: Option<String> = None;
    let mut to: Vec<UpstreamSpec> = Vec::new();
    let mut except = Vec::new();
    let mut max_fails = DEFAULT_MAX_FAILS;
    let mut health_check = DEFAULT_HEALTH_CHECK;
    let mut force_tcp = false;
    let mut tls_servername = None;
    let mut expire = DEFAULT_EXPIRE;
    let mut policy = PolicyKind::Random;
    let mut explicit_tls = false;

    for tokens in lines {
        let (head, args) = match tokens.split_first() {
            Some(v) => v,
            None => continue,
        };

        match *head {
            "forward" => {
                if from.is_some() {
                    return Err(ConfigError::DuplicateForward);
                }
                let (zone, upstreams) = args
                    .split_first()
                    .ok_or_else(|| ConfigError::BadArgument("forward".into(), "missing FROM zone".into()))?;
                if upstreams.is_empty() {
                    return Err(ConfigError::NoUpstreams);
                }
                if upstreams.len() > MAX_PROXIES {
                    return Err(ConfigError::TooManyUpstreams(upstreams.len()));
                }
                from = Some(zone.to_string());
                for u in upstreams {
                    let spec = parse_upstream(u, explicit_tls)?;
                    // A forwarder shares one TLS config across all of its
                    // upstreams; a single `tls://`-scheme upstream is
                    // enough to turn that on for the whole block.
                    explicit_tls |= spec.tls;
                    to.push(spec);
                }
            }
            "except" => except.extend(args.iter().map(|s| s.to_string())),
            "max_fails" => {
                let raw = args.first().ok_or_else(|| {
                    ConfigError::BadArgument("max_fails".into(), "missing value".into())
                })?;
                max_fails = raw
                    .parse()
                    .map_err(|_| ConfigError::BadArgument("max_fails".into(), format!("not a number: {raw:?}")))?;
            }
            "health_check" => {
                let raw = args.first().ok_or_else(|| {
                    ConfigError::BadArgument("health_check".into(), "missing value".into())
                })?;
                health_check = parse_duration("health_check", raw)?;
            }
            "force_tcp" => force_tcp = true,
            "tls" => {
                explicit_tls = true;
                for spec in &mut to {
                    spec.tls = true;
                    if spec.addr.port() == PLAIN_PORT {
                        spec.addr.set_port(DOT_PORT);
                    }
                }
            }
            "tls_servername" => {
                let raw = args.first().ok_or_else(|| {
                    ConfigError::BadArgument("tls_servername".into(), "missing value".into())
                })?;
                tls_servername = Some(raw.to_string());
            }
            "expire" => {
                let raw = args.first().ok_or_else(|| {
                    ConfigError::BadArgument("expire".into(), "missing value".into())
                })?;
                expire = parse_duration("expire", raw)?;
            }
            "policy" => {
                let raw = args.first().ok_or_else(|| {
                    ConfigError::BadArgument("policy".into(), "missing value".into())
                })?;
                policy = PolicyKind::parse(raw)?;
            }
            other => return Err(ConfigError::UnknownDirective(other.to_string())),
        }
    }

    let from = from.ok_or(ConfigError::MissingForward)?;

    #[cfg(feature = "dot-rustls")]
    let tls = if explicit_tls {
        let server_name = tls_servername.clone().unwrap_or_else(|| "dns".to_string());
        Some(TlsSetting::with_webpki_roots(server_name))
    } else {
        None
    };
    #[cfg(not(feature = "dot-rustls"))]
    let tls = None;

    Ok(ForwardConfig {
        from,
        to,
        except,
        max_fails,
        health_check,
        force_tcp,
        tls,
        tls_servername,
        expire,
        policy,
    })
}

/// Tokenizes a raw directive block (one directive per line, `#` starts a
/// trailing comment, blank lines ignored) the way this family of plugin
/// parsers reads a Corefile block, and feeds it to [`parse`].
pub fn parse_block(block: &str) -> Result<ForwardConfig, ConfigError> {
    let lines: Vec<Vec<&str>> = block
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(|line| line.split_whitespace().collect())
        .collect();
    parse(&lines)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_block() {
        let config = parse_block(
            "forward example.org. 127.0.0.1:53 127.0.0.1:5353\n\
             max_fails 3\n\
             policy round_robin\n",
        )
        .unwrap();
        assert_eq!(config.from, "example.org.");
        assert_eq!(config.to.len(), 2);
        assert_eq!(config.max_fails, 3);
        assert_eq!(config.policy, PolicyKind::RoundRobin);
        assert_eq!(config.health_check, DEFAULT_HEALTH_CHECK);
    }

    #[test]
    fn rejects_duplicate_forward() {
        let err = parse_block(
            "forward a.org. 127.0.0.1:53\nforward b.org. 127.0.0.1:54\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateForward));
    }

    #[test]
    fn rejects_too_many_upstreams() {
        let targets: Vec<String> = (0..20).map(|i| format!("127.0.0.1:{}", 1000 + i)).collect();
        let block = format!("forward a.org. {}\n", targets.join(" "));
        let err = parse_block(&block).unwrap_err();
        assert!(matches!(err, ConfigError::TooManyUpstreams(20)));
    }

    #[test]
    fn rejects_bare_integer_durations() {
        let err = parse_block("forward a.org. 127.0.0.1:53\nexpire 10\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingDurationUnit(_, _)));
    }

    #[test]
    fn accepts_unit_suffixed_durations() {
        let config =
            parse_block("forward a.org. 127.0.0.1:53\nexpire 10s\nhealth_check 250ms\n").unwrap();
        assert_eq!(config.expire, Duration::from_secs(10));
        assert_eq!(config.health_check, Duration::from_millis(250));
    }

    #[test]
    fn rewrites_plain_port_to_853_under_tls() {
        let config = parse_block("forward a.org. tls://1.1.1.1:53\n").unwrap();
        assert_eq!(config.to[0].addr.port(), DOT_PORT);
        assert!(config.to[0].tls);
    }

    #[test]
    fn rejects_grpc_scheme() {
        let err = parse_block("forward a.org. grpc://1.1.1.1:53\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedScheme(_)));
    }

    #[test]
    fn rejects_unknown_directive() {
        let err = parse_block("forward a.org. 127.0.0.1:53\nbogus foo\n").unwrap_err();
        assert!(matches!(err, ConfigError::UnknownDirective(_)));
    }

    #[test]
    fn missing_forward_is_an_error() {
        let err = parse_block("max_fails 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::MissingForward));
    }
}
