//! Parsed `[scheme://]host[:port]` endpoints.
//!
//! KEK descriptors carry endpoints for key vaults and KMS endpoint overrides.
//! An [`Endpoint`] is immutable after parse and always exposes the
//! `host_and_port` form written back on the wire.

use common::{Error, Result};

/// A parsed network endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    scheme: Option<String>,
    host: String,
    port: Option<u16>,
    host_and_port: String,
}

impl Endpoint {
    /// Parse an endpoint of the form `[scheme://]host[:port]`.
    ///
    /// # Errors
    ///
    /// Returns a client error if the host is empty, contains whitespace or a
    /// path separator, or if the port is not a valid decimal port number.
    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme, rest) = match raw.split_once("://") {
            Some((s, rest)) => {
                if s.is_empty() {
                    return Err(Error::client(format!("invalid endpoint: '{raw}'")));
                }
                (Some(s.to_owned()), rest)
            }
            None => (None, raw),
        };

        let (host, port) = match rest.rsplit_once(':') {
            Some((host, port_str)) => {
                let port: u16 = port_str.parse().map_err(|_| {
                    Error::client(format!("invalid port in endpoint: '{raw}'"))
                })?;
                (host, Some(port))
            }
            None => (rest, None),
        };

        if host.is_empty() {
            return Err(Error::client(format!("invalid endpoint: '{raw}'")));
        }
        if host.contains(char::is_whitespace) || host.contains('/') {
            return Err(Error::client(format!("invalid endpoint: '{raw}'")));
        }

        let host_and_port = match port {
            Some(p) => format!("{host}:{p}"),
            None => host.to_owned(),
        };

        Ok(Self {
            scheme,
            host: host.to_owned(),
            port,
            host_and_port,
        })
    }

    /// The scheme, when one was present in the input.
    pub fn scheme(&self) -> Option<&str> {
        self.scheme.as_deref()
    }

    /// The host portion.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port, when one was present in the input.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The `host[:port]` form used on the wire.
    pub fn host_and_port(&self) -> &str {
        &self.host_and_port
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.host_and_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_port() {
        let e = Endpoint::parse("vault.example:443").unwrap();
        assert_eq!(e.host(), "vault.example");
        assert_eq!(e.port(), Some(443));
        assert_eq!(e.host_and_port(), "vault.example:443");
        assert_eq!(e.scheme(), None);
    }

    #[test]
    fn bare_host() {
        let e = Endpoint::parse("kms.us-east-1.amazonaws.com").unwrap();
        assert_eq!(e.port(), None);
        assert_eq!(e.host_and_port(), "kms.us-east-1.amazonaws.com");
    }

    #[test]
    fn scheme_is_stripped_from_host_and_port() {
        let e = Endpoint::parse("https://vault.example:8200").unwrap();
        assert_eq!(e.scheme(), Some("https"));
        assert_eq!(e.host_and_port(), "vault.example:8200");
    }

    #[test]
    fn empty_host_rejected() {
        assert!(Endpoint::parse("").is_err());
        assert!(Endpoint::parse(":443").is_err());
        assert!(Endpoint::parse("https://").is_err());
    }

    #[test]
    fn bad_port_rejected() {
        assert!(Endpoint::parse("host:notaport").is_err());
        assert!(Endpoint::parse("host:99999").is_err());
    }

    #[test]
    fn whitespace_and_path_rejected() {
        assert!(Endpoint::parse("va ult.example").is_err());
        assert!(Endpoint::parse("vault.example/path").is_err());
    }

    #[test]
    fn display_matches_host_and_port() {
        let e = Endpoint::parse("host:27017").unwrap();
        assert_eq!(e.to_string(), "host:27017");
    }
}
