//! Subnet, carrier address and listen port allocation.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use rand::Rng;

use crate::error::{NetworkError, NetworkResult};

/// First third octet handed out; `.0` and `.1` stay unused.
const FIRST_OCTET: u8 = 2;

/// Hands out `/24`s of a `/16` by third octet, skipping reserved ones.
#[derive(Debug, Clone)]
pub struct SubnetAllocator {
    range: Ipv4Net,
    reserved: BTreeSet<u8>,
    next: u8,
}

impl SubnetAllocator {
    pub fn new(range: Ipv4Net) -> NetworkResult<Self> {
        if range.prefix_len() != 16 {
            return Err(NetworkError::InvalidRange(range));
        }
        Ok(Self {
            range: range.trunc(),
            reserved: BTreeSet::new(),
            next: FIRST_OCTET,
        })
    }

    /// Mark `subnet` as taken. Subnets outside the range are ignored.
    pub fn reserve(&mut self, subnet: Ipv4Net) {
        if self.range.contains(&subnet) {
            self.reserved.insert(subnet.network().octets()[2]);
        }
    }

    pub fn allocate(&mut self) -> NetworkResult<Ipv4Net> {
        while self.next < u8::MAX {
            let octet = self.next;
            self.next += 1;
            if self.reserved.insert(octet) {
                let [a, b, ..] = self.range.network().octets();
                return Ipv4Net::new(Ipv4Addr::new(a, b, octet, 0), 24)
                    .map_err(|_| NetworkError::SubnetsExhausted(self.range));
            }
        }
        Err(NetworkError::SubnetsExhausted(self.range))
    }
}

/// The `/32` carrier address paired with a `/24` member subnet: the
/// subnet's second and third octets placed inside `carrier_range`.
pub fn carrier_ip(carrier_range: Ipv4Net, subnet: Ipv4Net) -> Ipv4Net {
    let [a, b, ..] = carrier_range.network().octets();
    let [_, x, y, _] = subnet.network().octets();
    Ipv4Net::from(Ipv4Addr::new(a, b, x, y))
}

/// Random port in `[min, max)` that is neither in `used` nor `taken`.
pub fn pick_port(
    used: &BTreeSet<u16>,
    taken: &BTreeSet<u16>,
    min: u16,
    max: u16,
) -> Option<u16> {
    let free = |port: &u16| !used.contains(port) && !taken.contains(port);
    if min >= max {
        return None;
    }
    let mut rng = rand::thread_rng();
    for _ in 0..64 {
        let port = rng.gen_range(min..max);
        if free(&port) {
            return Some(port);
        }
    }
    (min..max).find(free)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn allocation_starts_at_two_and_skips_reserved() {
        let mut alloc = SubnetAllocator::new(net("10.20.0.0/16")).unwrap();
        alloc.reserve(net("10.20.3.0/24"));
        alloc.reserve(net("10.99.4.0/24"));
        assert_eq!(alloc.allocate().unwrap(), net("10.20.2.0/24"));
        assert_eq!(alloc.allocate().unwrap(), net("10.20.4.0/24"));
        assert_eq!(alloc.allocate().unwrap(), net("10.20.5.0/24"));
    }

    #[test]
    fn range_runs_out_at_255() {
        let mut alloc = SubnetAllocator::new(net("10.20.0.0/16")).unwrap();
        for _ in 2..255 {
            alloc.allocate().unwrap();
        }
        assert!(matches!(alloc.allocate(), Err(NetworkError::SubnetsExhausted(_))));
    }

    #[test]
    fn only_slash_16_ranges() {
        assert!(matches!(
            SubnetAllocator::new(net("10.20.0.0/24")),
            Err(NetworkError::InvalidRange(_))
        ));
    }

    #[test]
    fn carrier_ip_mirrors_subnet_octets() {
        let carrier = carrier_ip(net("100.64.0.0/16"), net("10.20.7.0/24"));
        assert_eq!(carrier, net("100.64.20.7/32"));
    }

    #[test]
    fn port_avoids_used_and_taken() {
        let used: BTreeSet<u16> = (1024..1030).collect();
        let taken = BTreeSet::from([1030]);
        assert_eq!(pick_port(&used, &taken, 1024, 1032), Some(1031));
        assert_eq!(pick_port(&used, &taken, 1024, 1031), None);
        assert_eq!(pick_port(&used, &taken, 2000, 2000), None);

        let port = pick_port(&BTreeSet::new(), &BTreeSet::new(), 1024, 32767).unwrap();
        assert!((1024..32767).contains(&port));
    }
}
