use std::fmt::{Debug, Display, Formatter};
use std::net::{IpAddr, SocketAddr};

/// Identifies a remote endpoint by network address and port. This is the key for the connection
///  table and the sender reported to message listeners.
///
/// NB: There is no name resolution here - callers resolve host names before creating a
///      [PeerAddress]
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PeerAddress(SocketAddr);

impl PeerAddress {
    pub fn new(ip: IpAddr, port: u16) -> PeerAddress {
        PeerAddress(SocketAddr::new(ip, port))
    }

    #[cfg(test)]
    pub fn localhost(port: u16) -> PeerAddress {
        PeerAddress::new(IpAddr::V4(std::net::Ipv4Addr::LOCALHOST), port)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        // IPv4-mapped IPv6 addresses (dual-stack sockets) are canonicalized so that the same
        //  peer always maps to the same key
        match addr {
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(v4) => PeerAddress(SocketAddr::new(IpAddr::V4(v4), v6.port())),
                None => PeerAddress(addr),
            },
            SocketAddr::V4(_) => PeerAddress(addr),
        }
    }
}

impl Debug for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.0)
    }
}

impl Display for PeerAddress {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::collections::HashSet;
    use std::str::FromStr;

    #[rstest]
    #[case::v4("127.0.0.1:3956", "127.0.0.1:3956")]
    #[case::v6("[::1]:3956", "[::1]:3956")]
    #[case::v4_mapped("[::ffff:10.0.0.1]:80", "10.0.0.1:80")]
    fn test_from_socket_addr(#[case] raw: &str, #[case] expected: &str) {
        let addr = PeerAddress::from(SocketAddr::from_str(raw).unwrap());
        assert_eq!(addr.socket_addr(), SocketAddr::from_str(expected).unwrap());
    }

    #[test]
    fn test_value_equality() {
        let a = PeerAddress::new(IpAddr::from_str("10.1.2.3").unwrap(), 5);
        let b = PeerAddress::from(SocketAddr::from_str("10.1.2.3:5").unwrap());
        let c = PeerAddress::localhost(5);

        assert_eq!(a, b);
        assert_ne!(a, c);

        let set: HashSet<_> = [a, b, c].into_iter().collect();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_debug() {
        assert_eq!(format!("{:?}", PeerAddress::localhost(7)), "[127.0.0.1:7]");
    }
}
