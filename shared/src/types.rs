use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer, Deserialize};

/// Ranks how well a host matches a device profile.
/// The derived ordering (`None < Low < Medium < High`) drives every tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum ConfidenceLevel {
    #[default]
    None,
    Low,
    Medium,
    High,
}

/// A single rule comparing one host attribute against a pattern, or checking
/// membership of the value in a host-tracked set when `subset_match` is set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchCondition {
    pub key: String,
    pub value: String,
    pub subset_match: bool,
}

impl MatchCondition {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            subset_match: false,
        }
    }

    pub fn subset(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            subset_match: true,
        }
    }
}

/// Conjunction of match conditions granting `confidence` when all of them hold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identifier {
    pub confidence: ConfidenceLevel,
    pub conditions: Vec<MatchCondition>,
}

/// A known device type and the identifiers used to recognise it.
/// Owned by the profile catalog; the matcher only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub uuid: String,
    pub version: u32,
    pub manufacturer: String,
    pub model: String,
    pub last_updated: DateTime<Utc>,
    pub upload_stats: bool,
    pub identifiers: Vec<Identifier>,
}

/// Profile catalog keyed by profile UUID
pub type DeviceProfileMap = HashMap<String, DeviceProfile>;

/// Attributes observed in a DHCP request.
/// Equality ignores `expiration`, which the host record sets itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DhcpRequest {
    #[serde(default)]
    pub ip_address: String,
    pub mac_address: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub dhcp_hostname: String,
    #[serde(default)]
    pub dhcp_vendor: String,
    #[serde(skip)]
    pub expiration: Option<DateTime<Utc>>,
}

impl PartialEq for DhcpRequest {
    fn eq(&self, other: &Self) -> bool {
        self.ip_address == other.ip_address
            && self.mac_address == other.mac_address
            && self.hostname == other.hostname
            && self.dhcp_hostname == other.dhcp_hostname
            && self.dhcp_vendor == other.dhcp_vendor
    }
}

/// Attributes announced by a host over SSDP, plus the fields later filled in
/// from its location URL. Equality ignores `expiration`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SsdpInfo {
    pub friendly_name: String,
    pub manufacturer: String,
    pub manufacturer_url: String,
    pub model_name: String,
    pub model_url: String,
    pub serial_number: String,
    pub user_agent: String,
    pub server: String,
    pub location: String,
    #[serde(skip)]
    pub expiration: Option<DateTime<Utc>>,
}

impl PartialEq for SsdpInfo {
    fn eq(&self, other: &Self) -> bool {
        self.friendly_name == other.friendly_name
            && self.manufacturer == other.manufacturer
            && self.manufacturer_url == other.manufacturer_url
            && self.model_name == other.model_name
            && self.model_url == other.model_url
            && self.serial_number == other.serial_number
            && self.user_agent == other.user_agent
            && self.server == other.server
            && self.location == other.location
    }
}

/// Device fields extracted from the UPnP description served at an SSDP location
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct SsdpDescription {
    pub friendly_name: String,
    pub manufacturer: String,
    pub manufacturer_url: String,
    pub model_name: String,
    pub model_url: String,
    pub serial_number: String,
}

/// Observation fed to the daemon by a protocol listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostEvent {
    Dhcp(DhcpRequest),
    Ssdp {
        mac_address: String,
        info: SsdpInfo,
    },
    Dns {
        mac_address: String,
        fqdn: String,
        ip: IpAddr,
        ttl_secs: u32,
    },
    Flow {
        mac_address: String,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        protocol: u8,
        #[serde(default)]
        ttl_secs: Option<u32>,
    },
    /// Description fetched from `location`, the URL announced by the host
    SsdpLocation {
        mac_address: String,
        location: String,
        description: SsdpDescription,
    },
}

impl HostEvent {
    pub fn mac_address(&self) -> &str {
        match self {
            HostEvent::Dhcp(request) => &request.mac_address,
            HostEvent::Ssdp { mac_address, .. }
            | HostEvent::Dns { mac_address, .. }
            | HostEvent::Flow { mac_address, .. }
            | HostEvent::SsdpLocation { mac_address, .. } => mac_address,
        }
    }
}

/// Resolution detail per FQDN: resolved IP -> expiration
pub type DnsResolutions = BTreeMap<String, BTreeMap<IpAddr, DateTime<Utc>>>;

/// DNS activity in a device stats object: a space-joined FQDN list, or per-FQDN detail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DnsQueries {
    Summary(String),
    Detailed(DnsResolutions),
}

/// Attribute summary reported for hosts that are not yet matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeviceStats {
    pub mac_oid: String,
    pub dhcp_hostname: String,
    pub dhcp_vendor: String,
    pub hostname: String,
    pub ssdp_friendly_name: String,
    pub ssdp_manufacturer: String,
    pub ssdp_manufacturer_url: String,
    pub ssdp_model_name: String,
    pub ssdp_model_url: String,
    pub ssdp_serial_number: String,
    pub ssdp_user_agent: String,
    pub ssdp_server: String,
    pub ssdp_location: String,
    pub dns_queries: DnsQueries,
}

impl DeviceStats {
    /// Attribute fields in reporting order, keyed by their wire names
    pub fn attributes(&self) -> [(&'static str, &str); 13] {
        [
            ("MacOid", self.mac_oid.as_str()),
            ("DhcpHostname", self.dhcp_hostname.as_str()),
            ("DhcpVendor", self.dhcp_vendor.as_str()),
            ("Hostname", self.hostname.as_str()),
            ("SsdpFriendlyName", self.ssdp_friendly_name.as_str()),
            ("SsdpManufacturer", self.ssdp_manufacturer.as_str()),
            ("SsdpManufacturerUrl", self.ssdp_manufacturer_url.as_str()),
            ("SsdpModelName", self.ssdp_model_name.as_str()),
            ("SsdpModelUrl", self.ssdp_model_url.as_str()),
            ("SsdpSerialNumber", self.ssdp_serial_number.as_str()),
            ("SsdpUserAgent", self.ssdp_user_agent.as_str()),
            ("SsdpServer", self.ssdp_server.as_str()),
            ("SsdpLocation", self.ssdp_location.as_str()),
        ]
    }
}

/// Activity summary reported for matched hosts.
/// `traffic_stats` holds flow destinations not already covered by a DNS resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TrafficStats {
    pub device_profile_uuid: String,
    pub dns_queries: Vec<String>,
    pub traffic_stats: Vec<IpAddr>,
}

/// Per-host export record, optionally merged with the detailed device stats
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceExport {
    pub mac_address: String,
    pub device_profile_uuid: String,
    pub ipv4_address: String,
    pub ssdp_manufacturer: String,
    pub ssdp_model_name: String,
    pub details: Option<DeviceStats>,
}

// Hand-written so merged detail fields don't repeat the keys the export already carries.
impl Serialize for DeviceExport {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("MacAddress", &self.mac_address)?;
        map.serialize_entry("DeviceProfileUuid", &self.device_profile_uuid)?;
        map.serialize_entry("Ipv4Address", &self.ipv4_address)?;
        map.serialize_entry("SsdpManufacturer", &self.ssdp_manufacturer)?;
        map.serialize_entry("SsdpModelName", &self.ssdp_model_name)?;
        if let Some(details) = &self.details {
            for (key, value) in details.attributes() {
                if key == "SsdpManufacturer" || key == "SsdpModelName" {
                    continue;
                }
                map.serialize_entry(key, value)?;
            }
            map.serialize_entry("DnsQueries", &details.dns_queries)?;
        }
        map.end()
    }
}
