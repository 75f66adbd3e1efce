use serde::Deserialize;
use serde::Serialize;

/// Default port of the overlay service.
pub const OVERLAY_PORT: u16 = 2030;

/// Totally ordered node identifier: a 32-bit address plus a service port.
///
/// Distance between addresses is the absolute difference of the address
/// component; the port only disambiguates co-located services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddr {
    ip: u32,
    port: u16,
}

impl NodeAddr {
    pub fn new(ip: u32, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn ip(self) -> u32 {
        self.ip
    }

    pub fn port(self) -> u16 {
        self.port
    }

    /// Absolute distance on the address axis.
    pub fn distance(self, other: Self) -> u64 {
        self.ip.abs_diff(other.ip) as u64
    }
}

impl From<u32> for NodeAddr {
    fn from(ip: u32) -> Self {
        Self { ip, port: OVERLAY_PORT }
    }
}

impl stars_core::Arbitrary for NodeAddr {
    fn random() -> Self {
        use rand::Rng;
        Self { ip: rand::rng().random(), port: OVERLAY_PORT }
    }
}

impl std::fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn distance_ignores_the_port() {
        let a = NodeAddr::new(10, 2030);
        let b = NodeAddr::new(14, 9999);
        assert_eq!(a.distance(b), 4);
        assert_eq!(b.distance(a), 4);
    }
    #[test]
    fn ordering_is_total() {
        assert!(NodeAddr::from(1) < NodeAddr::from(2));
        assert!(NodeAddr::new(1, 1) < NodeAddr::new(1, 2));
    }
    #[test]
    fn random_addresses_agree_on_the_service_port() {
        use stars_core::Arbitrary;
        let a = NodeAddr::random();
        let b = NodeAddr::random();
        assert_eq!(a.port(), OVERLAY_PORT);
        assert_eq!(a.distance(b), b.distance(a));
    }
}
