use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnetwork::IpNetwork;

/// Largest block a pool may be carved into, in host bits.
pub const MAX_BLOCK_HOST_BITS: u8 = 16;

pub fn to_bits(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u32::from(v4) as u128,
        IpAddr::V6(v6) => u128::from(v6),
    }
}

pub fn from_bits(bits: u128, ipv4: bool) -> IpAddr {
    if ipv4 {
        IpAddr::V4(Ipv4Addr::from(bits as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(bits))
    }
}

pub fn max_prefix(net: &IpNetwork) -> u8 {
    if net.is_ipv4() { 32 } else { 128 }
}

fn mask(prefix: u8, width: u8) -> u128 {
    let all = if width == 32 {
        u32::MAX as u128
    } else {
        u128::MAX
    };
    if prefix == 0 {
        0
    } else {
        (all << (width - prefix)) & all
    }
}

/// Number of `prefix`-sized subnets inside `parent`, saturating at `u128::MAX`.
pub fn subnet_count(parent: &IpNetwork, prefix: u8) -> u128 {
    if prefix < parent.prefix() {
        return 0;
    }
    1u128
        .checked_shl(u32::from(prefix - parent.prefix()))
        .unwrap_or(u128::MAX)
}

/// The `n`th `prefix`-aligned subnet of `parent`, counting from its network address.
pub fn nth_subnet(parent: &IpNetwork, prefix: u8, n: u128) -> Option<IpNetwork> {
    let width = max_prefix(parent);
    if prefix < parent.prefix() || prefix > width || n >= subnet_count(parent, prefix) {
        return None;
    }
    let step = 1u128.checked_shl(u32::from(width - prefix))?;
    let base = to_bits(parent.network());
    let start = base.checked_add(n.checked_mul(step)?)?;
    IpNetwork::new(from_bits(start, parent.is_ipv4()), prefix).ok()
}

/// The `prefix`-aligned subnet holding `addr`.
pub fn containing_subnet(addr: IpAddr, prefix: u8) -> Option<IpNetwork> {
    let width = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > width {
        return None;
    }
    let start = to_bits(addr) & mask(prefix, width);
    IpNetwork::new(from_bits(start, addr.is_ipv4()), prefix).ok()
}

/// Offset of `addr` from the network address of `net`, if `net` holds it.
pub fn offset(net: &IpNetwork, addr: IpAddr) -> Option<u128> {
    if !net.contains(addr) {
        return None;
    }
    Some(to_bits(addr) - to_bits(net.network()))
}

pub fn nth_address(net: &IpNetwork, n: u128) -> Option<IpAddr> {
    let host_bits = max_prefix(net) - net.prefix();
    if host_bits < 128 && n >> host_bits != 0 {
        return None;
    }
    let bits = to_bits(net.network()).checked_add(n)?;
    Some(from_bits(bits, net.is_ipv4()))
}

pub fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    if a.is_ipv4() != b.is_ipv4() {
        return false;
    }
    a.contains(b.network()) || b.contains(a.network())
}

/// A CIDR is canonical when no host bits are set.
pub fn is_canonical(net: &IpNetwork) -> bool {
    net.ip() == net.network()
}
