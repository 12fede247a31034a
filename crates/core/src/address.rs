//! Remote address kinds and the hostname-preserving normalization applied before a proxied
//! connect is issued.
use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    str::FromStr,
};

/// Destination of an outbound connect.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RemoteAddress {
    /// A host name that was already resolved to `addr`.
    Resolved { host: String, addr: SocketAddr },
    /// A host name and port that nobody resolved yet.
    Unresolved { host: String, port: u16 },
    /// A unix domain socket path.
    Unix(PathBuf),
}

impl RemoteAddress {
    pub fn resolved(host: impl Into<String>, addr: SocketAddr) -> Self {
        Self::Resolved {
            host: host.into(),
            addr,
        }
    }

    pub fn unresolved(host: impl Into<String>, port: u16) -> Self {
        Self::Unresolved {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> Option<&str> {
        match self {
            Self::Resolved { host, .. } | Self::Unresolved { host, .. } => Some(host),
            Self::Unix(_) => None,
        }
    }

    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Resolved { addr, .. } => Some(addr.port()),
            Self::Unresolved { port, .. } => Some(*port),
            Self::Unix(_) => None,
        }
    }

    /// `host:port` form suitable for a request line or `Host` header; IPv6 literals are
    /// bracketed.
    pub fn authority(&self) -> Option<String> {
        let host = self.host()?;
        let port = self.port()?;
        if host.parse::<std::net::Ipv6Addr>().is_ok() {
            Some(format!("[{host}]:{port}"))
        } else {
            Some(format!("{host}:{port}"))
        }
    }
}

/// Rewrites a resolved address into an unresolved one carrying the original host name and
/// port, so a proxy sees the name rather than the IP it resolved to. Other kinds pass
/// through unchanged.
pub fn normalize(address: RemoteAddress) -> RemoteAddress {
    match address {
        RemoteAddress::Resolved { host, addr } => RemoteAddress::Unresolved {
            host,
            port: addr.port(),
        },
        other => other,
    }
}

impl From<SocketAddr> for RemoteAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::Resolved {
            host: addr.ip().to_string(),
            addr,
        }
    }
}

impl fmt::Display for RemoteAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved { host, addr } if host == &addr.ip().to_string() => write!(f, "{addr}"),
            Self::Resolved { host, addr } => write!(f, "{host}/{addr}"),
            Self::Unresolved { .. } => {
                write!(f, "{}", self.authority().unwrap_or_default())
            }
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AddressParseError {
    #[error("missing port in `{0}`")]
    MissingPort(String),
    #[error("invalid port in `{0}`")]
    InvalidPort(String),
    #[error("empty host in `{0}`")]
    EmptyHost(String),
}

impl FromStr for RemoteAddress {
    type Err = AddressParseError;

    /// Accepts `ip:port`, `[ipv6]:port`, `host:port` and `unix:/path`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(path) = s.strip_prefix("unix:") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(addr.into());
        }
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| AddressParseError::MissingPort(s.to_owned()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| AddressParseError::InvalidPort(s.to_owned()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(AddressParseError::EmptyHost(s.to_owned()));
        }
        match host.parse::<IpAddr>() {
            Ok(ip) => Ok(SocketAddr::new(ip, port).into()),
            Err(_) => Ok(Self::unresolved(host, port)),
        }
    }
}
