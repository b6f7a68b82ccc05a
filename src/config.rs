//! # Server Configuration
//!
//! Every setting can come from the command line or from a `WEBQ_*` environment
//! variable, and every setting is optional: an empty command line in an empty
//! environment yields a working server.
//!
//! ## Examples
//!
//! ```bash
//! webqueue-server --addr 127.0.0.1:9000 --pool-size 8 --queue-size 256
//! WEBQ_SERVER_TYPE=fcgi WEBQ_PORT=9000 webqueue-server
//! ```
//!
//! ## Fallbacks
//!
//! | Accessor | Fallback |
//! |---|---|
//! | `pool_size()` | 4 when unset or non-positive |
//! | `queue_size()` | 100 when unset or non-positive |
//! | `addr()` | `host:port` when both are set, else `0.0.0.0:8090` |
//! | `server_type()` | HTTP unless `fcgi` |
//! | `public_host()` | `localhost:8090` |

use crate::runtime_config::{parse_size, resolve_max_procs, DEFAULT_STACK_SIZE};
use crate::worker_pool::{DEFAULT_POOL_SIZE, DEFAULT_QUEUE_SIZE};
use clap::Parser;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Listen address used when none is configured
pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:8090";
/// Host used by [`ServerConfig::url`] when no public host is configured
pub const DEFAULT_SERVER_HOST: &str = "localhost:8090";
/// Server name used when none is configured
pub const DEFAULT_SERVER_NAME: &str = "webqueue";

/// Transport served on the listener, chosen once at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerType {
    #[default]
    Http,
    Fcgi,
}

impl FromStr for ServerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" | "" => Ok(Self::Http),
            "fcgi" | "fastcgi" => Ok(Self::Fcgi),
            other => Err(format!("unknown server type '{other}'")),
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerType::Http => f.write_str("http"),
            ServerType::Fcgi => f.write_str("fcgi"),
        }
    }
}

/// Server configuration
#[derive(Debug, Clone, Default, Parser)]
#[command(name = "webqueue-server")]
#[command(about = "Bounded worker-pool HTTP/FastCGI server")]
#[command(version)]
pub struct ServerConfig {
    /// Server name, used in log lines and as the worker pool name
    #[arg(long, env = "WEBQ_NAME")]
    pub name: Option<String>,

    /// Listen address; overrides --host/--port
    #[arg(long, env = "WEBQ_ADDR")]
    pub addr: Option<String>,

    /// Listen host, combined with --port
    #[arg(long, env = "WEBQ_HOST")]
    pub host: Option<String>,

    /// Listen port, combined with --host
    #[arg(long, env = "WEBQ_PORT")]
    pub port: Option<u16>,

    /// Number of workers executing requests
    #[arg(
        long,
        env = "WEBQ_POOL_SIZE",
        alias = "num-server-workers",
        allow_negative_numbers = true
    )]
    pub pool_size: Option<i64>,

    /// Number of requests allowed to wait for a worker
    #[arg(
        long,
        env = "WEBQ_QUEUE_SIZE",
        alias = "num-worker-jobs",
        allow_negative_numbers = true
    )]
    pub queue_size: Option<i64>,

    /// Transport: http or fcgi
    #[arg(long, env = "WEBQ_SERVER_TYPE")]
    pub server_type: Option<String>,

    /// Per-request wait limit in milliseconds, 0 waits without a deadline
    #[arg(long, env = "WEBQ_REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: Option<u64>,

    /// Scheduler threads: -1 for all CPUs, 0 for the runtime default
    #[arg(long, env = "WEBQ_MAX_PROCS", allow_negative_numbers = true)]
    pub max_procs: Option<i32>,

    /// Coroutine stack size in bytes (decimal or 0x-hex)
    #[arg(long, env = "WEBQ_STACK_SIZE", value_parser = parse_size)]
    pub stack_size: Option<usize>,

    /// Host used when building absolute URLs
    #[arg(long, env = "WEBQ_PUBLIC_HOST")]
    pub public_host: Option<String>,

    /// Build https:// URLs
    #[arg(long, env = "WEBQ_SECURE")]
    pub secure: bool,
}

impl ServerConfig {
    pub fn name(&self) -> &str {
        self.name
            .as_deref()
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_SERVER_NAME)
    }

    pub fn pool_size(&self) -> usize {
        positive_or(self.pool_size, DEFAULT_POOL_SIZE)
    }

    pub fn queue_size(&self) -> usize {
        positive_or(self.queue_size, DEFAULT_QUEUE_SIZE)
    }

    /// Effective listen address
    pub fn addr(&self) -> String {
        if let Some(addr) = self.addr.as_deref().filter(|a| !a.is_empty()) {
            return addr.to_string();
        }
        match (self.host.as_deref(), self.port) {
            (Some(host), Some(port)) if !host.is_empty() => format!("{host}:{port}"),
            _ => DEFAULT_SERVER_ADDR.to_string(),
        }
    }

    /// Lenient: anything other than `fcgi`/`fastcgi` means HTTP.
    pub fn server_type(&self) -> ServerType {
        self.server_type
            .as_deref()
            .and_then(|s| s.parse().ok())
            .unwrap_or_default()
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }

    pub fn scheduler_threads(&self) -> Option<usize> {
        resolve_max_procs(self.max_procs)
    }

    pub fn stack_size(&self) -> usize {
        self.stack_size
            .filter(|s| *s > 0)
            .unwrap_or(DEFAULT_STACK_SIZE)
    }

    pub fn public_host(&self) -> &str {
        self.public_host
            .as_deref()
            .filter(|h| !h.is_empty())
            .unwrap_or(DEFAULT_SERVER_HOST)
    }

    /// Absolute URL for `path` on the public host.
    ///
    /// Each `{{key}}` placeholder is replaced (first occurrence) by its value.
    pub fn url(&self, path: &str, params: &[(&str, &str)]) -> String {
        let scheme = if self.secure { "https" } else { "http" };
        let mut url = format!("{scheme}://{}{path}", self.public_host());
        for (key, value) in params {
            url = url.replacen(&format!("{{{{{key}}}}}"), value, 1);
        }
        url
    }
}

fn positive_or(value: Option<i64>, fallback: usize) -> usize {
    value
        .filter(|v| *v > 0)
        .and_then(|v| usize::try_from(v).ok())
        .unwrap_or(fallback)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.name(), "webqueue");
        assert_eq!(cfg.pool_size(), 4);
        assert_eq!(cfg.queue_size(), 100);
        assert_eq!(cfg.addr(), "0.0.0.0:8090");
        assert_eq!(cfg.server_type(), ServerType::Http);
        assert_eq!(cfg.request_timeout(), None);
        assert_eq!(cfg.stack_size(), DEFAULT_STACK_SIZE);
    }

    #[test]
    fn test_non_positive_sizes_fall_back() {
        let cfg = ServerConfig {
            pool_size: Some(0),
            queue_size: Some(-5),
            ..Default::default()
        };
        assert_eq!(cfg.pool_size(), 4);
        assert_eq!(cfg.queue_size(), 100);
    }

    #[test]
    fn test_addr_resolution() {
        let cfg = ServerConfig {
            host: Some("127.0.0.1".into()),
            port: Some(9000),
            ..Default::default()
        };
        assert_eq!(cfg.addr(), "127.0.0.1:9000");

        let cfg = ServerConfig {
            addr: Some("[::1]:7000".into()),
            host: Some("127.0.0.1".into()),
            port: Some(9000),
            ..Default::default()
        };
        assert_eq!(cfg.addr(), "[::1]:7000");

        let cfg = ServerConfig {
            port: Some(9000),
            ..Default::default()
        };
        assert_eq!(cfg.addr(), DEFAULT_SERVER_ADDR);
    }

    #[test]
    fn test_server_type_parsing() {
        assert_eq!("fcgi".parse::<ServerType>(), Ok(ServerType::Fcgi));
        assert_eq!("FastCGI".parse::<ServerType>(), Ok(ServerType::Fcgi));
        assert_eq!("http".parse::<ServerType>(), Ok(ServerType::Http));
        assert!("gopher".parse::<ServerType>().is_err());

        let cfg = ServerConfig {
            server_type: Some("gopher".into()),
            ..Default::default()
        };
        assert_eq!(cfg.server_type(), ServerType::Http);
    }

    #[test]
    fn test_url_builder() {
        let cfg = ServerConfig::default();
        assert_eq!(
            cfg.url("/users/{{id}}/posts/{{post}}", &[("id", "7"), ("post", "42")]),
            "http://localhost:8090/users/7/posts/42"
        );

        let cfg = ServerConfig {
            secure: true,
            public_host: Some("example.com".into()),
            ..Default::default()
        };
        assert_eq!(cfg.url("/a/{{x}}/{{x}}", &[("x", "1")]), "https://example.com/a/1/{{x}}");
    }

    #[test]
    fn test_cli_parsing_with_aliases() {
        let cfg = ServerConfig::try_parse_from([
            "webqueue-server",
            "--num-server-workers",
            "8",
            "--num-worker-jobs",
            "16",
            "--server-type",
            "fcgi",
            "--request-timeout-ms",
            "250",
            "--stack-size",
            "0x8000",
        ])
        .unwrap();
        assert_eq!(cfg.pool_size(), 8);
        assert_eq!(cfg.queue_size(), 16);
        assert_eq!(cfg.server_type(), ServerType::Fcgi);
        assert_eq!(cfg.request_timeout(), Some(Duration::from_millis(250)));
        assert_eq!(cfg.stack_size(), 0x8000);
    }
}
