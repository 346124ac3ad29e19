use std::collections::BTreeMap;
use std::net::IpAddr;
use chrono::{DateTime, Utc};

/// Resolutions of one FQDN observed from a host: resolved IP -> expiration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsLogEntry {
    fqdn: String,
    ips: BTreeMap<IpAddr, DateTime<Utc>>,
}

impl DnsLogEntry {
    pub fn new(fqdn: impl Into<String>) -> Self {
        Self {
            fqdn: fqdn.into(),
            ips: BTreeMap::new(),
        }
    }

    /// Record a resolution. Returns true if the IP is new or its expiration moved.
    pub fn ips_set(&mut self, ip: IpAddr, expiration: DateTime<Utc>) -> bool {
        match self.ips.insert(ip, expiration) {
            Some(previous) => previous != expiration,
            None => true,
        }
    }

    pub fn ips(&self) -> impl Iterator<Item = &IpAddr> {
        self.ips.keys()
    }

    pub fn resolutions(&self) -> &BTreeMap<IpAddr, DateTime<Utc>> {
        &self.ips
    }

    /// Drop resolutions that have expired. Returns how many were removed.
    pub fn prune_ips(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.ips.len();
        self.ips.retain(|_, expiration| now <= *expiration);
        let pruned = before - self.ips.len();
        if pruned > 0 {
            tracing::debug!("Dropped {} expired resolutions of {}", pruned, self.fqdn);
        }
        pruned
    }

    /// An entry expires once every resolution it holds has expired
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.ips.values().all(|expiration| now > *expiration)
    }
}
