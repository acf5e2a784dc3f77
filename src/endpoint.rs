use std::fmt;
use std::str::FromStr;

/// A remote server the pool may connect to, identified by host and port.
///
/// Endpoints are cheap to clone and are used as the key of the top level
/// pool map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new<T: Into<String>>(host: T, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Endpoint {
    type Err = ParseEndpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.rsplitn(2, ':');
        let port = parts
            .next()
            .ok_or_else(|| ParseEndpointError(format!("'{}' is not a valid endpoint", s)))?;
        let host = parts
            .next()
            .ok_or_else(|| ParseEndpointError(format!("'{}' is missing a port", s)))?;

        if host.is_empty() {
            return Err(ParseEndpointError(format!("'{}' is missing a host", s)));
        }

        let port = port
            .parse::<u16>()
            .map_err(|err| ParseEndpointError(format!("invalid port in '{}': {}", s, err)))?;

        Ok(Endpoint::new(host, port))
    }
}

#[derive(Debug)]
pub struct ParseEndpointError(String);

impl fmt::Display for ParseEndpointError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "could not parse Endpoint: {}", self.0)
    }
}

impl std::error::Error for ParseEndpointError {}

/// The TLS mode to use when connecting to an endpoint.
///
/// The first request for an endpoint fixes the mode for the lifetime of
/// that endpoint's pool. Requesting the same endpoint with a different
/// mode afterwards is a programming error and aborts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslMode {
    /// Use whatever the process wide TLS configuration says.
    Global,
    /// Always negotiate TLS on this connection.
    Enabled,
    /// Never negotiate TLS on this connection.
    Disabled,
}

impl Default for SslMode {
    fn default() -> Self {
        SslMode::Global
    }
}

/// A bitmask attached to every endpoint pool, used to address groups of
/// pools in fleet wide drop operations.
pub type TagMask = u32;

/// The tag every pool starts out with.
pub const TAG_PENDING: TagMask = 1;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_endpoint() {
        let endpoint: Endpoint = "db1.example.com:27017".parse().unwrap();
        assert_eq!(endpoint.host(), "db1.example.com");
        assert_eq!(endpoint.port(), 27017);
        assert_eq!(endpoint.to_string(), "db1.example.com:27017");
    }

    #[test]
    fn parse_endpoint_rejects_garbage() {
        assert!("no-port".parse::<Endpoint>().is_err());
        assert!(":27017".parse::<Endpoint>().is_err());
        assert!("host:notaport".parse::<Endpoint>().is_err());
    }
}
