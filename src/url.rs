use tracing::info;

use crate::error::{LdapError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Ldap,
    Ldaps,
}

impl Scheme {
    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Ldap => 389,
            Scheme::Ldaps => 636,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Ldap => "ldap",
            Scheme::Ldaps => "ldaps",
        }
    }
}

/// A directory server endpoint. Only scheme, host and port matter for
/// connecting; everything else in a full LDAP URL is dropped at parse time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LdapUrl {
    pub scheme: Scheme,
    pub host: String,
    pub port: u16,
}

impl LdapUrl {
    pub fn parse(url: &str) -> Result<Self> {
        let (scheme, rest) = if let Some(rest) = url.strip_prefix("ldap://") {
            (Scheme::Ldap, rest)
        } else if let Some(rest) = url.strip_prefix("ldaps://") {
            (Scheme::Ldaps, rest)
        } else {
            return Err(LdapError::param(format!("'{}' is not an LDAP url", url)));
        };

        let authority = rest
            .split(|c| c == '/' || c == '?')
            .next()
            .unwrap_or_default();
        let (host, port) = split_host_port(authority, url)?;
        if host.is_empty() {
            return Err(LdapError::param(format!("'{}' has no host", url)));
        }
        let port = port.unwrap_or_else(|| scheme.default_port());

        let parsed = LdapUrl {
            scheme,
            host: host.to_owned(),
            port,
        };
        if authority.len() != rest.len() {
            info!("simplified URL {} to {}", url, parsed);
        }
        Ok(parsed)
    }

    /// `host:port` as accepted by the socket connector.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn split_host_port<'a>(authority: &'a str, url: &str) -> Result<(&'a str, Option<u16>)> {
    // bracketed IPv6 literal
    if let Some(rest) = authority.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| LdapError::param(format!("unterminated address in '{}'", url)))?;
        let host = &rest[..end];
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((host, None));
        }
        let port = tail
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| LdapError::param(format!("invalid port in '{}'", url)))?;
        return Ok((host, Some(port)));
    }
    match authority.rsplit_once(':') {
        Some((host, port_str)) => {
            let port = port_str
                .parse()
                .map_err(|_| LdapError::param(format!("invalid port in '{}'", url)))?;
            Ok((host, Some(port)))
        }
        None => Ok((authority, None)),
    }
}

impl std::fmt::Display for LdapUrl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_with_default_ports() {
        let u = LdapUrl::parse("ldap://ldap.example.com").unwrap();
        assert_eq!(u.scheme, Scheme::Ldap);
        assert_eq!(u.host, "ldap.example.com");
        assert_eq!(u.port, 389);

        let u = LdapUrl::parse("ldaps://ldap.example.com").unwrap();
        assert_eq!(u.scheme, Scheme::Ldaps);
        assert_eq!(u.port, 636);
    }

    #[test]
    fn parse_with_explicit_port() {
        let u = LdapUrl::parse("ldap://localhost:3890").unwrap();
        assert_eq!(u.port, 3890);
        assert_eq!(u.addr(), "localhost:3890");
    }

    #[test]
    fn extra_components_are_dropped() {
        let u = LdapUrl::parse("ldap://h.example.com:389/dc=example,dc=com?cn?sub").unwrap();
        assert_eq!(u.host, "h.example.com");
        assert_eq!(u.port, 389);
    }

    #[test]
    fn ipv6_literal() {
        let u = LdapUrl::parse("ldap://[::1]:3890").unwrap();
        assert_eq!(u.host, "::1");
        assert_eq!(u.port, 3890);
    }

    #[test]
    fn rejects_non_ldap() {
        assert!(LdapUrl::parse("http://example.com").is_err());
        assert!(LdapUrl::parse("ldap://").is_err());
        assert!(LdapUrl::parse("ldap://host:notaport").is_err());
    }
}
