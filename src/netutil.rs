//! IP classification and ordering helpers shared by the address resolver and
//! the CIDR allocator.

use std::net::{IpAddr, Ipv6Addr};

/// Links that never carry node-identifying public addresses: the loopback,
/// CNI-internal links, and the encrypted mesh links.
const IGNORED_LINKS: &[&str] = &["lo", "cilium_host", "kubespan", "siderolink"];

/// True for links skipped during public IP and prefix discovery.
pub fn is_ignored_link(name: &str) -> bool {
    IGNORED_LINKS.contains(&name) || name.starts_with("dummy")
}

/// True if the address is a routable unicast address: not unspecified, not
/// loopback, not multicast and not link-local.
pub fn is_global_unicast(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !v4.is_unspecified() && !v4.is_loopback() && !v4.is_multicast() && !v4.is_link_local()
        }
        IpAddr::V6(v6) => {
            !v6.is_unspecified()
                && !v6.is_loopback()
                && !v6.is_multicast()
                && !is_link_local_v6(v6)
        }
    }
}

/// True if the address belongs to a private range (RFC 1918 for IPv4, unique
/// local fc00::/7 for IPv6).
pub fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

fn is_link_local_v6(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Parse an address string and return its canonical textual form.
///
/// The kubelet and the machine API are not always consistent about zero
/// compression in IPv6 literals, so every address is normalized before it is
/// compared or written to the node object.
pub fn canonical_ip(addr: &str) -> Option<String> {
    addr.trim().parse::<IpAddr>().ok().map(|ip| ip.to_string())
}

/// Reduce a list of addresses to at most one address per IP family, ordered by
/// the preferred family.
///
/// The first IPv4 and the first IPv6 address win; the relative order of the
/// two is decided by `prefer_ipv6`. Invalid entries are dropped.
pub fn preferred_dual_stack_node_ips(prefer_ipv6: bool, ips: &[String]) -> Vec<String> {
    let mut first_v4: Option<String> = None;
    let mut first_v6: Option<String> = None;

    for raw in ips {
        match raw.trim().parse::<IpAddr>() {
            Ok(IpAddr::V4(v4)) => {
                if first_v4.is_none() {
                    first_v4 = Some(v4.to_string());
                }
            }
            Ok(IpAddr::V6(v6)) => {
                if first_v6.is_none() {
                    first_v6 = Some(v6.to_string());
                }
            }
            Err(_) => continue,
        }
    }

    let (first, second) = if prefer_ipv6 {
        (first_v6, first_v4)
    } else {
        (first_v4, first_v6)
    };

    first.into_iter().chain(second).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ignored_links() {
        for link in ["lo", "cilium_host", "kubespan", "siderolink", "dummy0", "dummy12"] {
            assert!(is_ignored_link(link), "{link}");
        }

        for link in ["eth0", "bond0", "external", ""] {
            assert!(!is_ignored_link(link), "{link}");
        }
    }

    #[test]
    fn global_unicast_classification() {
        for ip in ["8.8.8.8", "192.168.0.1", "2001:db8::1", "fd00::1"] {
            assert!(is_global_unicast(&ip.parse().unwrap()), "{ip}");
        }

        for ip in ["127.0.0.1", "0.0.0.0", "169.254.1.1", "fe80::1", "ff02::1", "::"] {
            assert!(!is_global_unicast(&ip.parse().unwrap()), "{ip}");
        }
    }

    #[test]
    fn private_classification() {
        for ip in ["10.3.4.6", "172.16.0.1", "192.168.0.1", "fd00:db8::1"] {
            assert!(is_private(&ip.parse().unwrap()), "{ip}");
        }

        for ip in ["8.8.8.8", "2001:db8:123:445:204::1", "1.2.3.4"] {
            assert!(!is_private(&ip.parse().unwrap()), "{ip}");
        }
    }

    #[test]
    fn canonical_ip_compresses_zero_runs() {
        assert_eq!(
            canonical_ip("fd00:192:168:0::1").as_deref(),
            Some("fd00:192:168::1")
        );
        assert_eq!(canonical_ip("192.168.0.1").as_deref(), Some("192.168.0.1"));
        assert_eq!(canonical_ip("not-an-ip"), None);
    }

    #[test]
    fn dual_stack_prefers_ipv4_by_default() {
        let ips = vec![
            "192.168.0.1".to_string(),
            "1.2.3.4".to_string(),
            "2001:1234::1".to_string(),
            "2001:1234::2".to_string(),
        ];

        assert_eq!(
            preferred_dual_stack_node_ips(false, &ips),
            vec!["192.168.0.1", "2001:1234::1"]
        );
        assert_eq!(
            preferred_dual_stack_node_ips(true, &ips),
            vec!["2001:1234::1", "192.168.0.1"]
        );
    }

    #[test]
    fn dual_stack_single_family() {
        let ips = vec!["192.168.0.1".to_string()];
        assert_eq!(preferred_dual_stack_node_ips(true, &ips), vec!["192.168.0.1"]);

        let ips = vec!["2001:1234::1".to_string()];
        assert_eq!(preferred_dual_stack_node_ips(false, &ips), vec!["2001:1234::1"]);
    }

    #[test]
    fn dual_stack_skips_invalid_entries() {
        let ips = vec!["garbage".to_string(), "1.2.3.4".to_string()];
        assert_eq!(preferred_dual_stack_node_ips(false, &ips), vec!["1.2.3.4"]);
    }
}
