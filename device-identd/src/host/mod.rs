pub mod dns;
pub mod flow;
pub mod matcher;
pub mod stats;

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use chrono::{DateTime, Duration, Utc};
use shared::protocol::MAC_OID_LEN;
use shared::types::{DhcpRequest, SsdpDescription, SsdpInfo};

pub use dns::DnsLogEntry;
pub use flow::{FlowEntry, FlowEntryList};
pub use matcher::TracingTrace;

/// Outcome of an SSDP attribute update
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SsdpUpdate {
    Unchanged,
    /// The bundle changed; `location` is the description URL to fetch, if any
    Changed { location: Option<String> },
}

/// Everything known about one device on the LAN, keyed by its MAC address.
///
/// `first_seen` is set on creation and on a DHCP identity change, `last_seen` on any
/// observation, `last_modified` only on observations that changed state.
/// `last_modified <= last_seen` holds after every operation.
#[derive(Debug, Clone)]
pub struct Host {
    mac_address: String,
    ipv4_address: Option<Ipv4Addr>,
    dhcp: DhcpRequest,
    ssdp: SsdpInfo,
    dns_cache: BTreeMap<String, DnsLogEntry>,
    flow_cache: BTreeMap<IpAddr, FlowEntryList>,
    uuid: Option<String>,
    match_time: Option<DateTime<Utc>>,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    last_modified: DateTime<Utc>,
}

/// Absolute expiration `ttl_secs` from `now`
pub fn expires_in(now: DateTime<Utc>, ttl_secs: u32) -> DateTime<Utc> {
    now + Duration::seconds(i64::from(ttl_secs))
}

impl Host {
    pub fn new(mac_address: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            mac_address: mac_address.into(),
            ipv4_address: None,
            dhcp: DhcpRequest::default(),
            ssdp: SsdpInfo::default(),
            dns_cache: BTreeMap::new(),
            flow_cache: BTreeMap::new(),
            uuid: None,
            match_time: None,
            first_seen: now,
            last_seen: now,
            last_modified: now,
        }
    }

    /// Rebuild a host from a persisted match so stickiness survives a restart
    pub fn restore(
        mac_address: impl Into<String>,
        ipv4_address: Option<Ipv4Addr>,
        uuid: String,
        match_time: DateTime<Utc>,
        first_seen: DateTime<Utc>,
        last_seen: DateTime<Utc>,
    ) -> Self {
        let mut host = Self::new(mac_address, first_seen);
        host.ipv4_address = ipv4_address;
        host.uuid = Some(uuid).filter(|uuid| !uuid.is_empty());
        host.match_time = Some(match_time);
        host.last_seen = last_seen.max(first_seen);
        host
    }

    pub fn mac_address(&self) -> &str {
        &self.mac_address
    }

    /// Leading OUI part of the MAC address, e.g. "aa:bb:cc"
    pub fn mac_oid(&self) -> &str {
        self.mac_address.get(..MAC_OID_LEN).unwrap_or(&self.mac_address)
    }

    pub fn ipv4_address(&self) -> Option<Ipv4Addr> {
        self.ipv4_address
    }

    #[cfg(test)]
    pub fn set_ipv4_address(&mut self, address: Ipv4Addr) {
        self.ipv4_address = Some(address);
    }

    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    pub fn is_matched(&self) -> bool {
        self.uuid.is_some()
    }

    pub fn match_time(&self) -> Option<DateTime<Utc>> {
        self.match_time
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }

    #[cfg(test)]
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    #[cfg(test)]
    pub fn dhcp(&self) -> &DhcpRequest {
        &self.dhcp
    }

    #[cfg(test)]
    pub fn ssdp(&self) -> &SsdpInfo {
        &self.ssdp
    }

    #[cfg(test)]
    pub fn dns_cache(&self) -> &BTreeMap<String, DnsLogEntry> {
        &self.dns_cache
    }

    #[cfg(test)]
    pub fn flow_cache(&self) -> &BTreeMap<IpAddr, FlowEntryList> {
        &self.flow_cache
    }

    fn touch(&mut self, now: DateTime<Utc>, modified: bool) {
        self.last_seen = self.last_seen.max(now);
        if modified {
            self.last_modified = self.last_seen;
        }
    }

    /// Replace the DHCP bundle. Returns false, touching nothing, when the bundle is unchanged.
    pub fn dhcp_set(&mut self, request: DhcpRequest, ttl_secs: u32, now: DateTime<Utc>) -> bool {
        if self.dhcp == request {
            return false;
        }

        self.first_seen = now;
        self.last_modified = now;
        self.last_seen = now;

        self.dhcp = request;
        self.dhcp.expiration = Some(expires_in(now, ttl_secs));
        if let Ok(address) = self.dhcp.ip_address.parse::<Ipv4Addr>() {
            self.ipv4_address = Some(address);
        }
        true
    }

    /// Replace the SSDP bundle. A changed bundle with a location asks the caller to fetch it.
    pub fn ssdp_info_set(&mut self, mut info: SsdpInfo, ttl_secs: u32, now: DateTime<Utc>) -> SsdpUpdate {
        // Announcements rarely carry description fields; keep the ones fetched for this location.
        if info.location == self.ssdp.location {
            keep_if_empty(&mut info.friendly_name, &self.ssdp.friendly_name);
            keep_if_empty(&mut info.manufacturer, &self.ssdp.manufacturer);
            keep_if_empty(&mut info.manufacturer_url, &self.ssdp.manufacturer_url);
            keep_if_empty(&mut info.model_name, &self.ssdp.model_name);
            keep_if_empty(&mut info.model_url, &self.ssdp.model_url);
            keep_if_empty(&mut info.serial_number, &self.ssdp.serial_number);
        }

        if self.ssdp == info {
            return SsdpUpdate::Unchanged;
        }

        self.touch(now, true);
        self.ssdp = info;
        self.ssdp.expiration = Some(expires_in(now, ttl_secs));

        let location = Some(self.ssdp.location.clone()).filter(|location| !location.is_empty());
        SsdpUpdate::Changed { location }
    }

    /// Overlay fields fetched from the SSDP location. Never triggers another fetch.
    /// A description fetched from a location the host no longer announces is ignored.
    pub fn ssdp_location_set(
        &mut self,
        location: &str,
        description: SsdpDescription,
        now: DateTime<Utc>,
    ) -> bool {
        if location != self.ssdp.location {
            tracing::debug!(
                "Ignoring description of {} for host {}, now at {:?}",
                location,
                self.mac_address,
                self.ssdp.location
            );
            return false;
        }

        let mut changed = false;
        changed |= overlay(&mut self.ssdp.friendly_name, description.friendly_name);
        changed |= overlay(&mut self.ssdp.manufacturer, description.manufacturer);
        changed |= overlay(&mut self.ssdp.manufacturer_url, description.manufacturer_url);
        changed |= overlay(&mut self.ssdp.model_name, description.model_name);
        changed |= overlay(&mut self.ssdp.model_url, description.model_url);
        changed |= overlay(&mut self.ssdp.serial_number, description.serial_number);

        self.touch(now, changed);
        changed
    }

    /// Record that `fqdn` resolved to `ip`.
    /// Returns true if a new DnsLogEntry was created, false if an existing one was updated.
    pub fn dns_log_entry_set(
        &mut self,
        fqdn: &str,
        ip: IpAddr,
        expiration: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        let mut created = false;
        let entry = self.dns_cache.entry(fqdn.to_string()).or_insert_with(|| {
            tracing::debug!("Creating DnsLogEntry for {}", fqdn);
            created = true;
            DnsLogEntry::new(fqdn)
        });

        let changed = entry.ips_set(ip, expiration);
        self.touch(now, changed);
        created
    }

    /// Add or refresh a flow from this host to `dst_ip`.
    /// Returns true if a flow entry was added, false if an existing flow was updated.
    pub fn flow_entry_set(
        &mut self,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        protocol: u8,
        expiration: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        self.touch(now, true);
        let flow = FlowEntry::new(src_port, dst_port, protocol, expiration);

        let flows = self.flow_cache.entry(dst_ip).or_default();
        if let Some(existing) = flows.iter_mut().find(|existing| **existing == flow) {
            tracing::debug!(
                "Updating expiration of existing flow to {}:{} protocol {}",
                dst_ip,
                dst_port,
                protocol
            );
            existing.expiration = expiration;
            return false;
        }

        tracing::debug!(
            "Adding flow from port {} to {}:{} protocol {}",
            src_port,
            dst_ip,
            dst_port,
            protocol
        );
        flows.push(flow);
        true
    }

    /// Remove expired entries (all entries when `force` is set) from the flow and DNS caches.
    /// Returns true if anything was removed.
    pub fn prune(&mut self, force: bool, now: DateTime<Utc>) -> bool {
        let mut pruned_flow_entries = 0usize;
        let mut pruned_flows = 0usize;
        self.flow_cache.retain(|_, flows| {
            let before = flows.len();
            flows.retain(|flow| !force && !flow.is_expired(now));
            pruned_flow_entries += before - flows.len();

            if force || flows.is_empty() {
                pruned_flows += 1;
                false
            } else {
                true
            }
        });

        let mut pruned_dns_ips = 0usize;
        let before = self.dns_cache.len();
        self.dns_cache.retain(|_, entry| {
            if force {
                return false;
            }
            pruned_dns_ips += entry.prune_ips(now);
            !entry.is_expired(now)
        });
        let pruned_dns_queries = before - self.dns_cache.len();

        tracing::debug!(
            "Pruned host {}: {} flow entries, {} flows, {} DNS resolutions, {} DNS queries",
            self.mac_address,
            pruned_flow_entries,
            pruned_flows,
            pruned_dns_ips,
            pruned_dns_queries
        );
        pruned_flow_entries + pruned_flows + pruned_dns_ips + pruned_dns_queries > 0
    }
}

fn keep_if_empty(field: &mut String, current: &str) {
    if field.is_empty() {
        field.push_str(current);
    }
}

fn overlay(field: &mut String, value: String) -> bool {
    if value.is_empty() || *field == value {
        return false;
    }
    *field = value;
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn test_host() -> Host {
        Host::new("aa:bb:cc:dd:ee:ff", t(0))
    }

    #[test]
    fn test_flow_repeat_updates_expiration() {
        let mut host = test_host();

        let created = host.flow_entry_set(1234, ip("10.0.0.5"), 443, 6, t(100), t(1));
        assert!(created, "First flow should be created");

        let created = host.flow_entry_set(1234, ip("10.0.0.5"), 443, 6, t(200), t(2));
        assert!(!created, "Same tuple should update, not create");

        let flows = &host.flow_cache()[&ip("10.0.0.5")];
        assert_eq!(flows.len(), 1);
        assert_eq!(flows[0].expiration, t(200));
    }

    #[test]
    fn test_flow_distinct_tuples_append() {
        let mut host = test_host();
        assert!(host.flow_entry_set(1234, ip("10.0.0.5"), 443, 6, t(100), t(1)));
        assert!(host.flow_entry_set(1235, ip("10.0.0.5"), 443, 6, t(100), t(1)));
        assert!(host.flow_entry_set(1234, ip("10.0.0.5"), 443, 17, t(100), t(1)));
        assert!(host.flow_entry_set(1234, ip("10.0.0.6"), 443, 6, t(100), t(1)));

        assert_eq!(host.flow_cache().len(), 2);
        assert_eq!(host.flow_cache()[&ip("10.0.0.5")].len(), 3);
    }

    #[test]
    fn test_flow_always_counts_as_modification() {
        let mut host = test_host();
        host.flow_entry_set(1234, ip("10.0.0.5"), 443, 6, t(100), t(5));
        host.flow_entry_set(1234, ip("10.0.0.5"), 443, 6, t(100), t(9));
        assert_eq!(host.last_seen(), t(9));
        assert_eq!(host.last_modified(), t(9));
    }

    #[test]
    fn test_dns_repeat_is_not_new() {
        let mut host = test_host();

        let created = host.dns_log_entry_set("a.example.com", ip("93.184.216.34"), t(100), t(1));
        assert!(created);
        assert_eq!(host.last_modified(), t(1));

        let created = host.dns_log_entry_set("a.example.com", ip("93.184.216.34"), t(100), t(5));
        assert!(!created, "Repeat resolution should not create an entry");
        assert_eq!(host.last_seen(), t(5));
        assert_eq!(host.last_modified(), t(1), "Identical resolution is not a modification");

        host.dns_log_entry_set("a.example.com", ip("93.184.216.34"), t(300), t(7));
        assert_eq!(host.last_modified(), t(7), "New expiration is a modification");

        host.dns_log_entry_set("a.example.com", ip("93.184.216.35"), t(300), t(8));
        assert_eq!(host.last_modified(), t(8), "New IP is a modification");
        assert_eq!(host.dns_cache().len(), 1);
        assert_eq!(host.dns_cache()["a.example.com"].ips().count(), 2);
    }

    #[test]
    fn test_prune_expired_only() {
        let mut host = test_host();
        host.dns_log_entry_set("a.example.com", ip("10.1.0.1"), t(500), t(1));
        host.dns_log_entry_set("b.example.com", ip("10.1.0.2"), t(50), t(1));
        host.dns_log_entry_set("b.example.com", ip("10.1.0.3"), t(60), t(1));
        host.flow_entry_set(1000, ip("10.0.0.5"), 443, 6, t(500), t(1));
        host.flow_entry_set(1001, ip("10.0.0.5"), 443, 6, t(50), t(1));
        host.flow_entry_set(1002, ip("10.0.0.6"), 80, 6, t(50), t(1));

        assert!(host.prune(false, t(100)));

        assert!(host.dns_cache().contains_key("a.example.com"));
        assert!(!host.dns_cache().contains_key("b.example.com"));

        let remaining = &host.flow_cache()[&ip("10.0.0.5")];
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].src_port, 1000);
        assert!(
            !host.flow_cache().contains_key(&ip("10.0.0.6")),
            "Emptied bucket should be removed"
        );

        assert!(!host.prune(false, t(100)), "Nothing left to prune");
    }

    #[test]
    fn test_prune_drops_expired_resolutions_of_live_entry() {
        let mut host = test_host();
        host.dns_log_entry_set("b.example.com", ip("10.1.0.2"), t(50), t(1));
        host.dns_log_entry_set("b.example.com", ip("10.1.0.3"), t(500), t(1));

        assert!(host.prune(false, t(100)), "Expired resolution counts as pruned");
        let ips: Vec<&IpAddr> = host.dns_cache()["b.example.com"].ips().collect();
        assert_eq!(ips, vec![&ip("10.1.0.3")]);
        assert!(!host.prune(false, t(100)));
    }

    #[test]
    fn test_rotating_resolutions_stay_bounded() {
        let mut host = test_host();
        for round in 0..1000u32 {
            let now = t(i64::from(round) * 60);
            let addr = IpAddr::from(std::net::Ipv4Addr::from(0x0a00_0000 + round));
            host.dns_log_entry_set("cdn.example.com", addr, now + Duration::seconds(120), now);
            host.prune(false, now);
        }

        let entry = &host.dns_cache()["cdn.example.com"];
        assert!(entry.ips().count() <= 3, "held {} resolutions", entry.ips().count());
        assert!(!entry.ips().any(|addr| *addr == ip("10.0.0.0")));
    }

    #[test]
    fn test_prune_force_empties_everything() {
        let mut host = test_host();
        host.dns_log_entry_set("a.example.com", ip("10.1.0.1"), t(500), t(1));
        host.flow_entry_set(1000, ip("10.0.0.5"), 443, 6, t(500), t(1));

        assert!(host.prune(true, t(2)));
        assert!(host.dns_cache().is_empty());
        assert!(host.flow_cache().is_empty());
        assert!(!host.prune(true, t(3)), "Nothing to prune on an empty host");
    }

    #[test]
    fn test_dhcp_set_unchanged_touches_nothing() {
        let mut host = test_host();
        let request = DhcpRequest {
            ip_address: "192.168.1.20".to_string(),
            mac_address: "aa:bb:cc:dd:ee:ff".to_string(),
            hostname: "hue".to_string(),
            dhcp_hostname: "Philips-hue".to_string(),
            dhcp_vendor: "udhcp 1.24".to_string(),
            expiration: None,
        };

        assert!(host.dhcp_set(request.clone(), 3600, t(10)));
        assert_eq!(host.first_seen(), t(10));
        assert_eq!(host.last_modified(), t(10));
        assert_eq!(host.dhcp().expiration, Some(t(3610)));
        assert_eq!(host.ipv4_address(), Some(Ipv4Addr::new(192, 168, 1, 20)));

        assert!(!host.dhcp_set(request.clone(), 3600, t(20)));
        assert_eq!(host.last_seen(), t(10));
        assert_eq!(host.last_modified(), t(10));

        let mut renamed = request;
        renamed.hostname = "bridge".to_string();
        assert!(host.dhcp_set(renamed, 3600, t(30)));
        assert_eq!(host.first_seen(), t(30));
        assert_eq!(host.last_seen(), t(30));
    }

    #[test]
    fn test_ssdp_set_reports_location() {
        let mut host = test_host();
        let info = SsdpInfo {
            server: "Linux/3.14 UPnP/1.0 IpBridge/1.17".to_string(),
            location: "http://192.168.1.20:80/description.xml".to_string(),
            ..Default::default()
        };

        let update = host.ssdp_info_set(info.clone(), 1800, t(10));
        assert_eq!(
            update,
            SsdpUpdate::Changed {
                location: Some("http://192.168.1.20:80/description.xml".to_string())
            }
        );
        assert_eq!(host.last_modified(), t(10));
        assert_eq!(host.ssdp().expiration, Some(t(1810)));

        assert_eq!(host.ssdp_info_set(info, 1800, t(20)), SsdpUpdate::Unchanged);
        assert_eq!(host.last_modified(), t(10));
    }

    #[test]
    fn test_ssdp_without_location_requests_no_fetch() {
        let mut host = test_host();
        let info = SsdpInfo {
            user_agent: "Chromecast".to_string(),
            ..Default::default()
        };
        assert_eq!(
            host.ssdp_info_set(info, 1800, t(10)),
            SsdpUpdate::Changed { location: None }
        );
    }

    #[test]
    fn test_ssdp_location_fields_survive_reannounce() {
        let mut host = test_host();
        let info = SsdpInfo {
            location: "http://192.168.1.20/description.xml".to_string(),
            ..Default::default()
        };
        host.ssdp_info_set(info.clone(), 1800, t(1));

        let description = SsdpDescription {
            manufacturer: "Royal Philips Electronics".to_string(),
            model_name: "Philips hue bridge 2015".to_string(),
            ..Default::default()
        };
        assert!(host.ssdp_location_set(&info.location, description.clone(), t(2)));
        assert_eq!(host.last_modified(), t(2));
        assert!(!host.ssdp_location_set(&info.location, description, t(3)));
        assert_eq!(host.last_modified(), t(2));

        assert_eq!(host.ssdp_info_set(info, 1800, t(4)), SsdpUpdate::Unchanged);
        assert_eq!(host.ssdp().model_name, "Philips hue bridge 2015");
    }

    #[test]
    fn test_ssdp_description_from_previous_location_is_ignored() {
        let mut host = test_host();
        let old_location = "http://192.168.1.20/old.xml";
        host.ssdp_info_set(
            SsdpInfo {
                location: old_location.to_string(),
                ..Default::default()
            },
            1800,
            t(1),
        );
        host.ssdp_info_set(
            SsdpInfo {
                location: "http://192.168.1.20/new.xml".to_string(),
                model_name: "BSB002".to_string(),
                ..Default::default()
            },
            1800,
            t(2),
        );

        let stale = SsdpDescription {
            model_name: "Philips hue bridge 2012".to_string(),
            ..Default::default()
        };
        assert!(!host.ssdp_location_set(old_location, stale, t(3)));
        assert_eq!(host.ssdp().model_name, "BSB002");
        assert_eq!(host.last_seen(), t(2));
    }

    #[test]
    fn test_last_modified_never_exceeds_last_seen() {
        let mut host = test_host();
        host.dns_log_entry_set("a.example.com", ip("10.1.0.1"), t(500), t(5));
        host.flow_entry_set(1000, ip("10.0.0.5"), 443, 6, t(500), t(3));
        host.dns_log_entry_set("a.example.com", ip("10.1.0.2"), t(500), t(4));
        assert!(host.last_modified() <= host.last_seen());
        assert_eq!(host.last_seen(), t(5));
    }

    #[test]
    fn test_mac_oid() {
        assert_eq!(test_host().mac_oid(), "aa:bb:cc");
        assert_eq!(Host::new("aa:bb", t(0)).mac_oid(), "aa:bb");
    }

    #[test]
    fn test_restore_keeps_match() {
        let host = Host::restore(
            "aa:bb:cc:dd:ee:ff",
            Some(Ipv4Addr::new(192, 168, 1, 20)),
            "profile-1".to_string(),
            t(50),
            t(0),
            t(60),
        );
        assert!(host.is_matched());
        assert_eq!(host.uuid(), Some("profile-1"));
        assert_eq!(host.match_time(), Some(t(50)));
        assert_eq!(host.last_seen(), t(60));
    }
}
