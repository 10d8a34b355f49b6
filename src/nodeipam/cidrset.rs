//! Bitmap-backed CIDR allocator.
//!
//! A [`CidrSet`] divides one cluster CIDR into fixed-size node subnets and
//! tracks their use in a flat bitmap. Allocation scans linearly from a
//! rotating hint, which keeps it amortized O(1) at low occupancy; occupy and
//! release address whole index ranges so that overlapping ranges (the
//! service CIDR carve-out) can be marked in one call.

use std::fmt;
use std::net::IpAddr;

use ipnet::{IpNet, Ipv6Net};
use parking_lot::Mutex;

use crate::{Error, Result};

/// Hard cap on the number of node subnets one set may track (2^20).
const MAX_SUBNET_BITS: u8 = 20;

#[derive(Debug, Default)]
struct Bitmap {
    words: Vec<u64>,
    allocated: u64,
    next: u64,
}

impl Bitmap {
    fn get(&self, index: u64) -> bool {
        self.words[(index / 64) as usize] & (1 << (index % 64)) != 0
    }

    fn set(&mut self, index: u64) -> bool {
        let word = &mut self.words[(index / 64) as usize];
        let bit = 1 << (index % 64);
        let was_free = *word & bit == 0;

        *word |= bit;

        if was_free {
            self.allocated += 1;
        }

        was_free
    }

    fn clear(&mut self, index: u64) {
        let word = &mut self.words[(index / 64) as usize];
        let bit = 1 << (index % 64);

        if *word & bit != 0 {
            *word &= !bit;
            self.allocated -= 1;
        }
    }
}

/// Dense allocator over one cluster CIDR with node subnets of a fixed size.
#[derive(Debug)]
pub struct CidrSet {
    cluster_cidr: IpNet,
    base: u128,
    node_mask_bits: u8,
    addr_bits: u8,
    max_cidrs: u64,
    state: Mutex<Bitmap>,
}

impl CidrSet {
    /// Construct an allocator handing out `/node_mask_bits` subnets of the
    /// cluster CIDR.
    pub fn new(cluster_cidr: IpNet, node_mask_bits: u8) -> Result<Self> {
        let cluster_cidr = cluster_cidr.trunc();
        let addr_bits = match cluster_cidr {
            IpNet::V4(_) => 32,
            IpNet::V6(_) => 128,
        };

        if node_mask_bits < cluster_cidr.prefix_len() {
            return Err(Error::validation(format!(
                "node mask /{node_mask_bits} must not be wider than cluster CIDR {cluster_cidr}"
            )));
        }

        if node_mask_bits > addr_bits {
            return Err(Error::validation(format!(
                "node mask /{node_mask_bits} does not fit the address family of {cluster_cidr}"
            )));
        }

        let subnet_bits = node_mask_bits - cluster_cidr.prefix_len();
        if subnet_bits > MAX_SUBNET_BITS {
            return Err(Error::validation(format!(
                "cluster CIDR {cluster_cidr} with node mask /{node_mask_bits} spans 2^{subnet_bits} subnets, more than the allocator supports"
            )));
        }

        let max_cidrs = 1u64 << subnet_bits;

        Ok(Self {
            base: addr_to_u128(cluster_cidr.network()),
            cluster_cidr,
            node_mask_bits,
            addr_bits,
            max_cidrs,
            state: Mutex::new(Bitmap {
                words: vec![0; max_cidrs.div_ceil(64) as usize],
                ..Default::default()
            }),
        })
    }

    /// The cluster CIDR this set allocates from.
    pub fn cluster_cidr(&self) -> IpNet {
        self.cluster_cidr
    }

    /// Number of subnets currently marked used.
    pub fn allocated(&self) -> u64 {
        self.state.lock().allocated
    }

    /// True if the IP falls inside the cluster CIDR.
    pub fn contains(&self, ip: &IpAddr) -> bool {
        self.cluster_cidr.contains(ip)
    }

    /// Hand out the next free subnet.
    pub fn allocate_next(&self) -> Result<IpNet> {
        let mut state = self.state.lock();

        if state.allocated == self.max_cidrs {
            return Err(Error::CidrExhausted);
        }

        for offset in 0..self.max_cidrs {
            let index = (state.next + offset) % self.max_cidrs;

            if !state.get(index) {
                state.set(index);
                state.next = (index + 1) % self.max_cidrs;

                return self.subnet_at(index);
            }
        }

        Err(Error::CidrExhausted)
    }

    /// Mark every subnet overlapping the CIDR as used. A no-op on already
    /// occupied slots.
    pub fn occupy(&self, cidr: &IpNet) -> Result<()> {
        let (begin, end) = self.index_range(cidr)?;
        let mut state = self.state.lock();

        for index in begin..=end {
            state.set(index);
        }

        Ok(())
    }

    /// Return every subnet overlapping the CIDR to the pool. A no-op on
    /// already free slots.
    pub fn release(&self, cidr: &IpNet) -> Result<()> {
        let (begin, end) = self.index_range(cidr)?;
        let mut state = self.state.lock();

        for index in begin..=end {
            state.clear(index);
        }

        Ok(())
    }

    fn subnet_at(&self, index: u64) -> Result<IpNet> {
        let host_bits = self.addr_bits - self.node_mask_bits;
        let addr = self.base + ((index as u128) << host_bits);

        IpNet::new(
            addr_from_u128(addr, matches!(self.cluster_cidr, IpNet::V4(_))),
            self.node_mask_bits,
        )
        .map_err(|e| Error::validation(format!("subnet index {index}: {e}")))
    }

    fn index_of(&self, ip: IpAddr) -> u64 {
        let host_bits = self.addr_bits - self.node_mask_bits;

        (addr_to_u128(ip).wrapping_sub(self.base) >> host_bits) as u64
    }

    /// Bitmap index range covered by the CIDR; the whole range when the CIDR
    /// contains the cluster CIDR.
    fn index_range(&self, cidr: &IpNet) -> Result<(u64, u64)> {
        let cidr = cidr.trunc();

        if cidr.contains(&self.cluster_cidr.network()) && cidr.prefix_len() <= self.cluster_cidr.prefix_len() {
            return Ok((0, self.max_cidrs - 1));
        }

        if !self.cluster_cidr.contains(&cidr.network()) {
            return Err(Error::cidr_conflict(format!(
                "cidr {cidr} is out the range of cluster cidr {}",
                self.cluster_cidr
            )));
        }

        let begin = self.index_of(cidr.network());
        let end = self.index_of(cidr.broadcast()).min(self.max_cidrs - 1);

        Ok((begin, end))
    }
}

impl fmt::Display for CidrSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} used {} of {}",
            self.cluster_cidr,
            self.node_mask_bits,
            self.allocated(),
            self.max_cidrs
        )
    }
}

/// Normalize an IPv6 prefix into an allocator-compatible cluster CIDR and
/// node mask size.
///
/// Prefixes wider than /64 are narrowed to the /64 of their address with an
/// /80 node mask; /64 through /119 keep their width and get up to sixteen
/// subnet bits; /120 through /123 are used as they are; anything smaller is
/// rejected.
pub fn normalize_v6(prefix: Ipv6Net) -> Result<(Ipv6Net, u8)> {
    let mask = prefix.prefix_len();

    let (prefix, node_mask) = match mask {
        0..=63 => {
            let widened = Ipv6Net::new(prefix.addr(), 64)
                .map_err(|e| Error::validation(format!("failed to widen {prefix}: {e}")))?;

            (widened, 80)
        }
        64..=119 => (prefix, (mask + 16).min(128)),
        120..=123 => (prefix, mask),
        _ => {
            return Err(Error::validation(format!(
                "CIDRv6 is too small: {prefix}"
            )))
        }
    };

    Ok((prefix.trunc(), node_mask))
}

fn addr_to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

fn addr_from_u128(value: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::from(std::net::Ipv4Addr::from(value as u32))
    } else {
        IpAddr::from(std::net::Ipv6Addr::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNet {
        s.parse().unwrap()
    }

    #[test]
    fn allocates_sequential_subnets() {
        let set = CidrSet::new(net("10.244.0.0/16"), 24).unwrap();

        assert_eq!(set.allocate_next().unwrap(), net("10.244.0.0/24"));
        assert_eq!(set.allocate_next().unwrap(), net("10.244.1.0/24"));
        assert_eq!(set.allocate_next().unwrap(), net("10.244.2.0/24"));
        assert_eq!(set.allocated(), 3);
    }

    #[test]
    fn exhaustion_is_reported() {
        let set = CidrSet::new(net("10.0.0.0/30"), 32).unwrap();

        for _ in 0..4 {
            set.allocate_next().unwrap();
        }

        assert!(matches!(set.allocate_next(), Err(Error::CidrExhausted)));
    }

    #[test]
    fn release_feeds_the_next_allocation() {
        let set = CidrSet::new(net("10.244.0.0/16"), 24).unwrap();
        let first = set.allocate_next().unwrap();
        let _second = set.allocate_next().unwrap();

        set.release(&first).unwrap();
        // The hint moved past the released slot; the scan wraps to find it.
        let third = set.allocate_next().unwrap();
        assert_eq!(third, net("10.244.2.0/24"));

        let fourth = set.allocate_next().unwrap();
        assert_eq!(fourth, net("10.244.3.0/24"));
    }

    #[test]
    fn occupy_and_release_are_idempotent() {
        let set = CidrSet::new(net("10.244.0.0/16"), 24).unwrap();
        let subnet = net("10.244.5.0/24");

        set.occupy(&subnet).unwrap();
        set.occupy(&subnet).unwrap();
        assert_eq!(set.allocated(), 1);

        set.release(&subnet).unwrap();
        set.release(&subnet).unwrap();
        assert_eq!(set.allocated(), 0);
    }

    #[test]
    fn allocated_minus_released_balances_to_zero() {
        let set = CidrSet::new(net("10.244.0.0/16"), 24).unwrap();
        let mut held = Vec::new();

        for _ in 0..32 {
            held.push(set.allocate_next().unwrap());
        }

        for subnet in &held {
            set.release(subnet).unwrap();
        }

        assert_eq!(set.allocated(), 0);
    }

    #[test]
    fn occupied_subnets_are_skipped() {
        let set = CidrSet::new(net("10.244.0.0/16"), 24).unwrap();
        set.occupy(&net("10.244.0.0/24")).unwrap();

        assert_eq!(set.allocate_next().unwrap(), net("10.244.1.0/24"));
    }

    #[test]
    fn occupy_covers_ranges_wider_than_the_node_mask() {
        let set = CidrSet::new(net("10.244.0.0/16"), 24).unwrap();
        // A service CIDR overlapping 16 node subnets.
        set.occupy(&net("10.244.16.0/20")).unwrap();

        assert_eq!(set.allocated(), 16);
        assert_eq!(set.allocate_next().unwrap(), net("10.244.0.0/24"));
    }

    #[test]
    fn occupy_outside_the_cluster_fails() {
        let set = CidrSet::new(net("10.244.0.0/16"), 24).unwrap();

        let err = set.occupy(&net("10.250.0.0/24")).unwrap_err();
        assert!(err.to_string().contains("out the range"));
    }

    #[test]
    fn occupy_of_a_covering_cidr_fills_the_set() {
        let set = CidrSet::new(net("10.244.0.0/16"), 24).unwrap();
        set.occupy(&net("10.0.0.0/8")).unwrap();

        assert_eq!(set.allocated(), 256);
        assert!(matches!(set.allocate_next(), Err(Error::CidrExhausted)));
    }

    #[test]
    fn contains_covers_the_prefix() {
        let set = CidrSet::new(net("10.244.0.0/16"), 24).unwrap();

        assert!(set.contains(&"10.244.12.34".parse().unwrap()));
        assert!(!set.contains(&"10.245.0.1".parse().unwrap()));
    }

    #[test]
    fn subnet_count_limit_is_enforced() {
        let err = CidrSet::new(net("10.0.0.0/8"), 32).unwrap_err();
        assert!(err.to_string().contains("more than the allocator supports"));
    }

    #[test]
    fn ipv6_allocation() {
        let set = CidrSet::new(net("2001:db8:1234::/64"), 80).unwrap();

        assert_eq!(set.allocate_next().unwrap(), net("2001:db8:1234::/80"));
        assert_eq!(set.allocate_next().unwrap(), net("2001:db8:1234:0:1::/80"));
    }

    #[test]
    fn normalize_v6_widens_and_expands() {
        // Wider than /64: widened to the address's /64, node mask 80.
        let (prefix, mask) =
            normalize_v6("2000::1111:aaaa:bbbb:cccc:123/56".parse().unwrap()).unwrap();
        assert_eq!(prefix, "2000:0:0:1111::/64".parse::<Ipv6Net>().unwrap());
        assert_eq!(mask, 80);

        // /64 through /119: sixteen subnet bits.
        for (input, expected_prefix, expected_mask) in [
            ("2000::aaaa:bbbb:cccc:123/64", "2000::/64", 80),
            ("2000::aaaa:bbbb:cccc:123/80", "2000::aaaa:0:0:0/80", 96),
            ("2000::aaaa:bbbb:cccc:123/96", "2000::aaaa:bbbb:0:0/96", 112),
            ("2000::aaaa:bbbb:cccc:123/100", "2000::aaaa:bbbb:c000:0/100", 116),
            ("2000::aaaa:bbbb:cccc:123/110", "2000::aaaa:bbbb:cccc:0/110", 126),
            ("2000::aaaa:bbbb:cccc:123/119", "2000::aaaa:bbbb:cccc:0/119", 128),
        ] {
            let (prefix, mask) = normalize_v6(input.parse().unwrap()).unwrap();
            assert_eq!(prefix, expected_prefix.parse::<Ipv6Net>().unwrap(), "{input}");
            assert_eq!(mask, expected_mask, "{input}");
        }

        // /120 through /123: used as-is.
        let (prefix, mask) =
            normalize_v6("2000::aaaa:bbbb:cccc:123/120".parse().unwrap()).unwrap();
        assert_eq!(prefix, "2000::aaaa:bbbb:cccc:100/120".parse::<Ipv6Net>().unwrap());
        assert_eq!(mask, 120);

        let (prefix, mask) =
            normalize_v6("2000::aaaa:bbbb:cccc:123/123".parse().unwrap()).unwrap();
        assert_eq!(prefix, "2000::aaaa:bbbb:cccc:120/123".parse::<Ipv6Net>().unwrap());
        assert_eq!(mask, 123);
    }

    #[test]
    fn normalize_v6_rejects_tiny_prefixes() {
        let err = normalize_v6("2000::aaaa:bbbb:cccc:123/124".parse().unwrap()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "validation error: CIDRv6 is too small: 2000::aaaa:bbbb:cccc:123/124"
        );
    }

    #[test]
    fn normalized_prefix_builds_a_working_set() {
        let (prefix, mask) =
            normalize_v6("2000::1111:aaaa:bbbb:cccc:123/56".parse().unwrap()).unwrap();
        let set = CidrSet::new(IpNet::V6(prefix), mask).unwrap();

        assert_eq!(set.allocate_next().unwrap(), net("2000:0:0:1111::/80"));
    }
}
