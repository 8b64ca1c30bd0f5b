//! IP reservations on manual and static networks.
//!
//! Reservations live on the instance record, so they survive VM deletion
//! (hard stop, recreate) and are only freed when the instance is deleted.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use armada_core::cloud::NetworkKind;
use armada_core::desired::{DesiredNetwork, DesiredSubnet};
use armada_core::network::Cidr;
use armada_state::{IpKind, IpReservation};
use tracing::debug;

use crate::error::{DirectorError, DirectorResult};

#[derive(Debug, Default, Clone)]
pub struct IpAllocator {
    used: HashMap<String, HashSet<Ipv4Addr>>,
}

impl IpAllocator {
    /// Seed with every reservation currently held across the director.
    pub fn new<'a>(existing: impl IntoIterator<Item = &'a IpReservation>) -> Self {
        let mut allocator = Self::default();
        for r in existing {
            allocator.mark(&r.network, r.ip);
        }
        allocator
    }

    fn mark(&mut self, network: &str, ip: Ipv4Addr) -> bool {
        self.used.entry(network.to_string()).or_default().insert(ip)
    }

    pub fn is_used(&self, network: &str, ip: Ipv4Addr) -> bool {
        self.used.get(network).is_some_and(|s| s.contains(&ip))
    }

    pub fn release(&mut self, reservation: &IpReservation) {
        if let Some(set) = self.used.get_mut(&reservation.network) {
            set.remove(&reservation.ip);
        }
    }

    /// Claim a static IP. Fails if another instance already holds it.
    pub fn reserve_static(&mut self, network: &str, ip: Ipv4Addr) -> DirectorResult<IpReservation> {
        if !self.mark(network, ip) {
            return Err(DirectorError::Conflict(format!(
                "static IP {ip} on network '{network}' is already in use"
            )));
        }
        Ok(IpReservation {
            network: network.to_string(),
            ip,
            kind: IpKind::Static,
        })
    }

    /// Allocate a dynamic address from a manual network's subnets serving
    /// `az`. Dynamic and VIP networks hand out no director-managed IP.
    pub fn allocate_dynamic(
        &mut self,
        network: &DesiredNetwork,
        az: Option<&str>,
    ) -> DirectorResult<Option<IpReservation>> {
        if network.kind != NetworkKind::Manual {
            return Ok(None);
        }
        for subnet in network.subnets.iter().filter(|s| s.serves_az(az)) {
            if let Some(ip) = self.free_in(&network.name, subnet)? {
                self.mark(&network.name, ip);
                debug!(network = %network.name, %ip, "allocated dynamic ip");
                return Ok(Some(IpReservation {
                    network: network.name.clone(),
                    ip,
                    kind: IpKind::Dynamic,
                }));
            }
        }
        Err(DirectorError::Conflict(format!(
            "no more IPs available in network '{}'{}",
            network.name,
            az.map(|a| format!(" for az '{a}'")).unwrap_or_default()
        )))
    }

    fn free_in(&self, network: &str, subnet: &DesiredSubnet) -> DirectorResult<Option<Ipv4Addr>> {
        let Some(range) = subnet.cidr.as_deref() else {
            return Ok(None);
        };
        let cidr = Cidr::parse(range)?;
        Ok(cidr.hosts().find(|ip| {
            Some(*ip) != subnet.gateway
                && !subnet.reserved.contains(ip)
                && !subnet.static_pool.contains(ip)
                && !self.is_used(network, *ip)
        }))
    }
}

/// Whether a held dynamic reservation is still valid for `az`.
pub fn dynamic_still_valid(network: &DesiredNetwork, reservation: &IpReservation, az: Option<&str>) -> bool {
    network.kind == NetworkKind::Manual
        && network.subnets.iter().any(|s| {
            s.serves_az(az)
                && s.contains(reservation.ip)
                && Some(reservation.ip) != s.gateway
                && !s.reserved.contains(&reservation.ip)
                && !s.static_pool.contains(&reservation.ip)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn network() -> DesiredNetwork {
        DesiredNetwork {
            name: "private".into(),
            kind: NetworkKind::Manual,
            static_ips: vec![],
            default: vec![],
            subnets: vec![
                DesiredSubnet {
                    cidr: Some("10.0.0.0/29".into()),
                    gateway: Some("10.0.0.1".parse().unwrap()),
                    reserved: vec!["10.0.0.2".parse().unwrap()],
                    static_pool: vec!["10.0.0.3".parse().unwrap()],
                    azs: vec!["z1".into()],
                    cloud_properties: Value::Null,
                },
                DesiredSubnet {
                    cidr: Some("10.0.1.0/30".into()),
                    gateway: None,
                    reserved: vec![],
                    static_pool: vec![],
                    azs: vec!["z2".into()],
                    cloud_properties: Value::Null,
                },
            ],
            cloud_properties: Value::Null,
        }
    }

    #[test]
    fn skips_gateway_reserved_static_and_used() {
        let held = IpReservation {
            network: "private".into(),
            ip: "10.0.0.4".parse().unwrap(),
            kind: IpKind::Dynamic,
        };
        let mut alloc = IpAllocator::new([&held]);
        let ip = alloc.allocate_dynamic(&network(), Some("z1")).unwrap().unwrap();
        assert_eq!(ip.ip, "10.0.0.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(ip.kind, IpKind::Dynamic);
    }

    #[test]
    fn az_selects_subnet_and_exhaustion_errors() {
        let mut alloc = IpAllocator::default();
        let net = network();
        let a = alloc.allocate_dynamic(&net, Some("z2")).unwrap().unwrap();
        let b = alloc.allocate_dynamic(&net, Some("z2")).unwrap().unwrap();
        assert_eq!(a.ip, "10.0.1.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(b.ip, "10.0.1.2".parse::<Ipv4Addr>().unwrap());
        let err = alloc.allocate_dynamic(&net, Some("z2")).unwrap_err();
        assert!(err.to_string().contains("no more IPs available in network 'private'"));

        alloc.release(&a);
        assert_eq!(alloc.allocate_dynamic(&net, Some("z2")).unwrap().unwrap().ip, a.ip);
    }

    #[test]
    fn static_ips_are_exclusive() {
        let mut alloc = IpAllocator::default();
        let ip: Ipv4Addr = "10.0.0.3".parse().unwrap();
        alloc.reserve_static("private", ip).unwrap();
        assert!(alloc.reserve_static("private", ip).is_err());
        assert!(alloc.reserve_static("other", ip).is_ok());
    }

    #[test]
    fn dynamic_networks_need_no_reservation() {
        let mut net = network();
        net.kind = NetworkKind::Dynamic;
        assert!(IpAllocator::default().allocate_dynamic(&net, None).unwrap().is_none());
    }

    #[test]
    fn held_reservation_validity_follows_az() {
        let net = network();
        let r = IpReservation {
            network: "private".into(),
            ip: "10.0.0.5".parse().unwrap(),
            kind: IpKind::Dynamic,
        };
        assert!(dynamic_still_valid(&net, &r, Some("z1")));
        assert!(!dynamic_still_valid(&net, &r, Some("z2")));
    }
}
