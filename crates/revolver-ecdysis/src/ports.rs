//! Ephemeral port allocation for new backends.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};

/// Reserve one free loopback TCP port per logical name.
///
/// Every probe listener stays bound until all ports are chosen, so the
/// returned ports are distinct. They are released before returning; the
/// service is expected to bind them shortly afterwards.
pub fn allocate_ports<'a, I>(names: I) -> std::io::Result<HashMap<String, u16>>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut probes = Vec::new();
    let mut ports = HashMap::new();

    for name in names {
        let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))?;
        let port = listener.local_addr()?.port();
        ports.insert(name.to_string(), port);
        probes.push(listener);
    }

    drop(probes);
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_allocates_distinct_ports_per_name() {
        let ports = allocate_ports(["http", "grpc", "metrics"]).unwrap();
        assert_eq!(ports.len(), 3);

        let unique: HashSet<u16> = ports.values().copied().collect();
        assert_eq!(unique.len(), 3);
        assert!(ports.values().all(|p| *p != 0));
    }

    #[test]
    fn test_allocated_port_is_bindable() {
        let ports = allocate_ports(["http"]).unwrap();
        let listener = TcpListener::bind(("127.0.0.1", ports["http"]));
        assert!(listener.is_ok());
    }

    #[test]
    fn test_no_names_no_ports() {
        let ports = allocate_ports(std::iter::empty()).unwrap();
        assert!(ports.is_empty());
    }
}
