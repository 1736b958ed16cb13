use std::collections::BTreeSet;

use crate::error::{AgentError, AgentResult};

/// Ports reserved for REPL plumbing; never handed out as service ports.
pub const RESERVED_PORTS: [u16; 2] = [2000, 2001];

/// Free host-port pool drawn from a configured inclusive range.
#[derive(Debug, Clone)]
pub struct PortPool {
    free: BTreeSet<u16>,
    lo: u16,
    hi: u16,
}

impl PortPool {
    pub fn new(lo: u16, hi: u16) -> Self {
        Self {
            free: (lo..=hi).collect(),
            lo,
            hi,
        }
    }

    pub fn range(&self) -> (u16, u16) {
        (self.lo, self.hi)
    }

    /// Draw `n` ports from the pool as a single group, so a failed
    /// container create can return them atomically.
    pub fn alloc_group(&mut self, n: usize) -> AgentResult<Vec<u16>> {
        if n > self.free.len() {
            return Err(AgentError::InsufficientPorts {
                requested: n,
                available: self.free.len(),
            });
        }
        let taken: Vec<u16> = self.free.iter().take(n).copied().collect();
        for p in &taken {
            self.free.remove(p);
        }
        Ok(taken)
    }

    /// Return ports to the pool. Ports outside the configured range are
    /// silently ignored (e.g. legacy bindings from a reconfigured range).
    pub fn free_group(&mut self, ports: &[u16]) {
        for &p in ports {
            if p >= self.lo && p <= self.hi {
                self.free.insert(p);
            }
        }
    }

    /// Mark ports as taken without allocating — used during startup
    /// reconciliation of already-running containers.
    pub fn mark_taken(&mut self, ports: &[u16]) {
        for p in ports {
            self.free.remove(p);
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    pub fn total_count(&self) -> usize {
        (self.hi - self.lo + 1) as usize
    }
}

/// Protocol a declared service port speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServicePortProtocol {
    Tcp,
    Pty,
    Http,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ServicePortDecl {
    pub name: String,
    pub protocol: ServicePortProtocol,
    pub container_port: u16,
}

/// Parse "name:protocol:port". protocol must be tcp/pty/http; port must be
/// > 1024 and not one of the reserved REPL ports.
pub fn parse_service_port(raw: &str) -> AgentResult<ServicePortDecl> {
    let mut parts = raw.splitn(3, ':');
    let (name, protocol, port) = match (parts.next(), parts.next(), parts.next()) {
        (Some(n), Some(p), Some(port)) => (n, p, port),
        _ => {
            return Err(AgentError::Other(anyhow::anyhow!(
                "malformed service port declaration: {raw}"
            )))
        }
    };

    let protocol = match protocol {
        "tcp" => ServicePortProtocol::Tcp,
        "pty" => ServicePortProtocol::Pty,
        "http" => ServicePortProtocol::Http,
        other => {
            return Err(AgentError::Other(anyhow::anyhow!(
                "unknown service port protocol: {other}"
            )))
        }
    };

    let port: u16 = port
        .parse()
        .map_err(|_| AgentError::Other(anyhow::anyhow!("invalid service port number: {port}")))?;

    if port <= 1024 || RESERVED_PORTS.contains(&port) {
        return Err(AgentError::Other(anyhow::anyhow!(
            "service port {port} is reserved or out of range"
        )));
    }

    Ok(ServicePortDecl {
        name: name.to_string(),
        protocol,
        container_port: port,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_group_draws_requested_count() {
        let mut pool = PortPool::new(30000, 30005);
        let ports = pool.alloc_group(3).unwrap();
        assert_eq!(ports.len(), 3);
        assert_eq!(pool.free_count(), 3);
    }

    #[test]
    fn alloc_group_rejects_over_budget() {
        let mut pool = PortPool::new(30000, 30001);
        let err = pool.alloc_group(5).unwrap_err();
        match err {
            AgentError::InsufficientPorts { requested, available } => {
                assert_eq!(requested, 5);
                assert_eq!(available, 2);
            }
            _ => panic!("wrong error kind"),
        }
    }

    #[test]
    fn free_group_restores_pool() {
        let mut pool = PortPool::new(30000, 30005);
        let ports = pool.alloc_group(3).unwrap();
        pool.free_group(&ports);
        assert_eq!(pool.free_count(), 6);
    }

    #[test]
    fn free_group_ignores_out_of_range_ports() {
        let mut pool = PortPool::new(30000, 30005);
        pool.free_group(&[9999]);
        assert_eq!(pool.free_count(), 6);
    }

    #[test]
    fn port_conservation_after_alloc_and_free_cycle() {
        let mut pool = PortPool::new(30000, 30005);
        let a = pool.alloc_group(2).unwrap();
        let b = pool.alloc_group(2).unwrap();
        pool.free_group(&a);
        pool.free_group(&b);
        assert_eq!(pool.free_count(), pool.total_count());
    }

    #[test]
    fn parse_service_port_accepts_valid_tcp() {
        let decl = parse_service_port("jupyter:tcp:8080").unwrap();
        assert_eq!(decl.name, "jupyter");
        assert_eq!(decl.protocol, ServicePortProtocol::Tcp);
        assert_eq!(decl.container_port, 8080);
    }

    #[test]
    fn parse_service_port_accepts_http_and_pty() {
        assert_eq!(
            parse_service_port("web:http:8888").unwrap().protocol,
            ServicePortProtocol::Http
        );
        assert_eq!(
            parse_service_port("tty:pty:9000").unwrap().protocol,
            ServicePortProtocol::Pty
        );
    }

    #[test]
    fn parse_service_port_rejects_reserved_ports() {
        assert!(parse_service_port("x:tcp:2000").is_err());
        assert!(parse_service_port("x:tcp:2001").is_err());
    }

    #[test]
    fn parse_service_port_rejects_low_ports() {
        assert!(parse_service_port("x:tcp:1024").is_err());
        assert!(parse_service_port("x:tcp:80").is_err());
    }

    #[test]
    fn parse_service_port_rejects_unknown_protocol() {
        assert!(parse_service_port("x:udp:9000").is_err());
    }

    #[test]
    fn parse_service_port_rejects_malformed_input() {
        assert!(parse_service_port("justaname").is_err());
        assert!(parse_service_port("name:tcp").is_err());
    }
}
