use std::fmt;

/// Concrete address of a single service instance.
///
/// Endpoints are the unit handed to the invocation transport and the key
/// (together with the service name) under which circuit state is tracked.
///
/// # Examples
///
/// ```rust
/// use tower_locator::Endpoint;
///
/// let ep = Endpoint::new("10.0.0.7", 8080).with_zone("us-east-1a");
/// assert_eq!(ep.authority(), "10.0.0.7:8080");
/// assert_eq!(ep.zone(), Some("us-east-1a"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
    zone: Option<String>,
    weight: Option<u32>,
}

impl Endpoint {
    /// Creates an endpoint from a host and port.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            zone: None,
            weight: None,
        }
    }

    /// Attaches an availability-zone label.
    pub fn with_zone(mut self, zone: impl Into<String>) -> Self {
        self.zone = Some(zone.into());
        self
    }

    /// Attaches a relative weight for custom selection strategies.
    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    /// The endpoint's host.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// The endpoint's port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The availability zone, if one was set.
    pub fn zone(&self) -> Option<&str> {
        self.zone.as_deref()
    }

    /// The relative weight, if one was set.
    pub fn weight(&self) -> Option<u32> {
        self.weight
    }

    /// The `host:port` authority string.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_is_authority() {
        let ep = Endpoint::new("user-service.internal", 80);
        assert_eq!(ep.to_string(), "user-service.internal:80");
        assert_eq!(ep.to_string(), ep.authority());
    }

    #[test]
    fn metadata_does_not_affect_equality_of_distinct_hosts() {
        let a = Endpoint::new("a", 80).with_zone("z1");
        let b = Endpoint::new("b", 80).with_zone("z1");
        assert_ne!(a, b);
    }
}
