use std::net::{IpAddr, Ipv6Addr};

use crate::error::{Error, Result};

/// Normalize a client address string to the 128-bit key used for lookups.
///
/// IPv4 addresses become IPv4-mapped IPv6 addresses (`::ffff:a.b.c.d`) so a
/// single lookup path serves both families. Surrounding whitespace and an
/// IPv6 zone id (`fe80::1%eth0`) are ignored.
pub fn normalize(addr: &str) -> Result<Ipv6Addr> {
    let trimmed = addr.trim();
    let without_zone = match trimmed.split_once('%') {
        Some((ip, _zone)) if ip.contains(':') => ip,
        _ => trimmed,
    };
    match without_zone.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => Ok(v4.to_ipv6_mapped()),
        Ok(IpAddr::V6(v6)) => Ok(v6),
        Err(_) => Err(Error::AddressParse {
            addr: addr.to_string(),
        }),
    }
}

/// Undo [`normalize`] for IPv4-mapped keys.
pub fn canonical(key: Ipv6Addr) -> IpAddr {
    match key.to_ipv4_mapped() {
        Some(v4) => IpAddr::V4(v4),
        None => IpAddr::V6(key),
    }
}
