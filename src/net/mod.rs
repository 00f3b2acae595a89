use std::net::{IpAddr, Ipv4Addr};

use tracing::warn;

/// A non-loopback IPv4 address the server can be reached on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateAddr {
    pub interface: String,
    pub ip: Ipv4Addr,
}

impl CandidateAddr {
    pub fn url(&self, port: u16, route: &str) -> String {
        format!("http://{}:{}{}", self.ip, port, route)
    }

    /// Whether the address lives in the subnet the operator should pick
    pub fn is_preferred(&self, prefix: Option<&str>) -> bool {
        prefix.is_some_and(|p| !p.is_empty() && self.ip.to_string().starts_with(p))
    }
}

/// Enumerate the host's non-loopback IPv4 interfaces.
///
/// Enumeration failures are logged and yield an empty list; the server keeps
/// running without the URL hints.
pub fn candidate_addrs() -> Vec<CandidateAddr> {
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => filter_candidates(
            interfaces
                .into_iter()
                .map(|iface| (iface.name.clone(), iface.ip())),
        ),
        Err(e) => {
            warn!("Failed to enumerate network interfaces: {}", e);
            Vec::new()
        }
    }
}

fn filter_candidates(
    interfaces: impl IntoIterator<Item = (String, IpAddr)>,
) -> Vec<CandidateAddr> {
    interfaces
        .into_iter()
        .filter_map(|(interface, ip)| match ip {
            IpAddr::V4(ip) if !ip.is_loopback() => Some(CandidateAddr { interface, ip }),
            _ => None,
        })
        .collect()
}
