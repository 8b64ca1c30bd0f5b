//! IPv4 range helpers for manual network subnets.

use std::net::Ipv4Addr;

use crate::error::{CoreError, CoreResult};

/// A parsed CIDR block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    pub base: Ipv4Addr,
    pub prefix: u8,
}

impl Cidr {
    pub fn parse(s: &str) -> CoreResult<Self> {
        let (addr, prefix) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| CoreError::Network(format!("'{s}' is not a CIDR range")))?;
        let base: Ipv4Addr = addr
            .trim()
            .parse()
            .map_err(|_| CoreError::Network(format!("invalid address in '{s}'")))?;
        let prefix: u8 = prefix
            .trim()
            .parse()
            .ok()
            .filter(|p| *p <= 32)
            .ok_or_else(|| CoreError::Network(format!("invalid prefix in '{s}'")))?;
        let mask = Self::mask(prefix);
        Ok(Self {
            base: Ipv4Addr::from(u32::from(base) & mask),
            prefix,
        })
    }

    fn mask(prefix: u8) -> u32 {
        if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask(self.prefix) == u32::from(self.base)
    }

    pub fn network(&self) -> Ipv4Addr {
        self.base
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.base) | !Self::mask(self.prefix))
    }

    /// Usable host addresses (network and broadcast excluded).
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.network()).saturating_add(1);
        let last = u32::from(self.broadcast()).saturating_sub(1);
        (first..=last).map(Ipv4Addr::from)
    }
}

/// Parse `10.0.0.5` or `10.0.0.5 - 10.0.0.9` into an inclusive list.
pub fn parse_ip_range(s: &str) -> CoreResult<Vec<Ipv4Addr>> {
    let parse = |v: &str| -> CoreResult<Ipv4Addr> {
        v.trim()
            .parse()
            .map_err(|_| CoreError::Network(format!("invalid address '{}'", v.trim())))
    };
    match s.split_once('-') {
        Some((lo, hi)) => {
            let (lo, hi) = (u32::from(parse(lo)?), u32::from(parse(hi)?));
            if lo > hi {
                return Err(CoreError::Network(format!("range '{s}' is reversed")));
            }
            Ok((lo..=hi).map(Ipv4Addr::from).collect())
        }
        None => Ok(vec![parse(s)?]),
    }
}

/// Expand a list of single addresses and ranges.
pub fn expand_ranges(entries: &[String]) -> CoreResult<Vec<Ipv4Addr>> {
    let mut out = Vec::new();
    for entry in entries {
        out.extend(parse_ip_range(entry)?);
    }
    Ok(out)
}
