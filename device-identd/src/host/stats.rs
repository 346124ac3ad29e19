use std::collections::HashSet;
use std::net::IpAddr;
use chrono::{DateTime, Duration, Utc};
use shared::protocol::DETAILED_EXPORT_WINDOW_SECS;
use shared::types::{DeviceExport, DeviceStats, DnsQueries, DnsResolutions, TrafficStats};
use super::Host;

impl Host {
    fn modified_within(&self, window: Duration, now: DateTime<Utc>) -> bool {
        self.last_modified >= now - window
    }

    /// Attribute summary for hosts still waiting for a match.
    /// `None` unless forced, or the host is unmatched and was modified within `window`.
    pub fn device_stats(
        &self,
        window: Duration,
        force: bool,
        detailed: bool,
        now: DateTime<Utc>,
    ) -> Option<DeviceStats> {
        if !force && (self.is_matched() || !self.modified_within(window, now)) {
            return None;
        }

        let dns_queries = if detailed {
            let resolutions: DnsResolutions = self
                .dns_cache
                .iter()
                .map(|(fqdn, entry)| (fqdn.clone(), entry.resolutions().clone()))
                .collect();
            DnsQueries::Detailed(resolutions)
        } else {
            let fqdns: Vec<&str> = self.dns_cache.keys().map(String::as_str).collect();
            DnsQueries::Summary(fqdns.join(" "))
        };

        Some(DeviceStats {
            mac_oid: self.mac_oid().to_string(),
            dhcp_hostname: self.dhcp.dhcp_hostname.clone(),
            dhcp_vendor: self.dhcp.dhcp_vendor.clone(),
            hostname: self.dhcp.hostname.clone(),
            ssdp_friendly_name: self.ssdp.friendly_name.clone(),
            ssdp_manufacturer: self.ssdp.manufacturer.clone(),
            ssdp_manufacturer_url: self.ssdp.manufacturer_url.clone(),
            ssdp_model_name: self.ssdp.model_name.clone(),
            ssdp_model_url: self.ssdp.model_url.clone(),
            ssdp_serial_number: self.ssdp.serial_number.clone(),
            ssdp_user_agent: self.ssdp.user_agent.clone(),
            ssdp_server: self.ssdp.server.clone(),
            ssdp_location: self.ssdp.location.clone(),
            dns_queries,
        })
    }

    /// DNS and flow activity of a matched host.
    /// Flow destinations already explained by one of the host's DNS answers are left out.
    pub fn traffic_stats(&self, window: Duration, force: bool, now: DateTime<Utc>) -> Option<TrafficStats> {
        if !force && (!self.is_matched() || !self.modified_within(window, now)) {
            return None;
        }

        let resolved: HashSet<&IpAddr> = self.dns_cache.values().flat_map(|entry| entry.ips()).collect();
        let traffic_stats = self
            .flow_cache
            .keys()
            .filter(|dst_ip| !resolved.contains(dst_ip))
            .copied()
            .collect();

        Some(TrafficStats {
            device_profile_uuid: self.uuid.clone().unwrap_or_default(),
            dns_queries: self.dns_cache.keys().cloned().collect(),
            traffic_stats,
        })
    }

    pub fn export_device_info(&self, detailed: bool, now: DateTime<Utc>) -> DeviceExport {
        let details = if detailed {
            self.device_stats(Duration::seconds(DETAILED_EXPORT_WINDOW_SECS), true, false, now)
        } else {
            None
        };

        DeviceExport {
            mac_address: self.mac_address.clone(),
            device_profile_uuid: self.uuid.clone().unwrap_or_default(),
            ipv4_address: self.ipv4_address.map(|ip| ip.to_string()).unwrap_or_default(),
            ssdp_manufacturer: self.ssdp.manufacturer.clone(),
            ssdp_model_name: self.ssdp.model_name.clone(),
            details,
        }
    }
}
