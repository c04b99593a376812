//! Server address parsing: `host`, `host:port`, `[v6]:port`, `bnj://host:port`

use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

pub fn parse_endpoint(s: &str, default_port: u16) -> Option<Endpoint> {
    let s = s.trim();
    let mut rest = s;
    if let Some(scheme_end) = s.find("://") {
        if !s[..scheme_end].eq_ignore_ascii_case("bnj") {
            return None;
        }
        rest = &s[scheme_end + 3..];
    }
    let (hp, _path) = rest.split_once('/').unwrap_or((rest, ""));
    if hp.is_empty() {
        return None;
    }

    let (host, port) = if let Some(v6) = hp.strip_prefix('[') {
        let (host, after) = v6.split_once(']')?;
        let port = match after.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if after.is_empty() => default_port,
            None => return None,
        };
        (host, port)
    } else {
        match hp.split_once(':') {
            Some((h, p)) => (h, p.parse().ok()?),
            None => (hp, default_port),
        }
    };
    if host.is_empty() {
        return None;
    }
    Some(Endpoint {
        host: host.to_string(),
        port,
    })
}
