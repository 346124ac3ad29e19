//! Rule evaluation of a host against the device profile catalog.
//!
//! The evaluators never log on their own: they report what they did into a
//! [`MatchTrace`] sink, so matching stays a pure function of host state and catalog.

use chrono::{DateTime, Utc};
use shared::protocol::{SUBSET_DNS_QUERIES, WILDCARD};
use shared::types::{ConfidenceLevel, DeviceProfile, DeviceProfileMap, Identifier, MatchCondition};
use super::Host;

/// Something worth knowing about a single evaluation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// Condition key names no host attribute; it was compared against ""
    UnknownAttribute { key: String },
    UnsupportedSubsetKey { key: String },
    ConditionEvaluated { key: String, pattern: String, matched: bool },
    DnsQueryLookup { fqdn: String, found: bool },
    ProfileEvaluated { uuid: String, confidence: ConfidenceLevel },
    /// Existing match kept without rescanning the catalog
    MatchRetained { uuid: String },
}

pub trait MatchTrace {
    fn record(&mut self, diagnostic: Diagnostic);
}

impl MatchTrace for Vec<Diagnostic> {
    fn record(&mut self, diagnostic: Diagnostic) {
        self.push(diagnostic);
    }
}

/// Forwards diagnostics to `tracing` at debug level, tagged with the host's MAC
pub struct TracingTrace<'a> {
    pub mac_address: &'a str,
}

impl MatchTrace for TracingTrace<'_> {
    fn record(&mut self, diagnostic: Diagnostic) {
        let mac = self.mac_address;
        match diagnostic {
            Diagnostic::UnknownAttribute { key } => {
                tracing::debug!("Host {}: unknown match condition key {}", mac, key);
            }
            Diagnostic::UnsupportedSubsetKey { key } => {
                tracing::debug!("Host {}: unsupported subset key {}", mac, key);
            }
            Diagnostic::ConditionEvaluated { key, pattern, matched } => {
                tracing::debug!("Host {}: {} against {:?} -> {}", mac, key, pattern, matched);
            }
            Diagnostic::DnsQueryLookup { fqdn, found } => {
                tracing::debug!("Host {}: DNS query for {} found={}", mac, fqdn, found);
            }
            Diagnostic::ProfileEvaluated { uuid, confidence } => {
                tracing::debug!("Host {}: device profile {} -> {:?}", mac, uuid, confidence);
            }
            Diagnostic::MatchRetained { uuid } => {
                tracing::debug!("Host {}: keeping match with device profile {}", mac, uuid);
            }
        }
    }
}

/// Host attributes a match condition can reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeKey {
    MacOid,
    DhcpHostname,
    DhcpVendor,
    Hostname,
    SsdpFriendlyName,
    SsdpManufacturer,
    SsdpManufacturerUrl,
    SsdpModelName,
    SsdpModelUrl,
    SsdpSerialNumber,
    SsdpUserAgent,
    SsdpServer,
    SsdpLocation,
}

const ATTRIBUTE_KEYS: [(&str, AttributeKey); 13] = [
    ("MacOid", AttributeKey::MacOid),
    ("DhcpHostname", AttributeKey::DhcpHostname),
    ("DhcpVendor", AttributeKey::DhcpVendor),
    ("Hostname", AttributeKey::Hostname),
    ("SsdpFriendlyName", AttributeKey::SsdpFriendlyName),
    ("SsdpManufacturer", AttributeKey::SsdpManufacturer),
    ("SsdpManufacturerUrl", AttributeKey::SsdpManufacturerUrl),
    ("SsdpModelName", AttributeKey::SsdpModelName),
    ("SsdpModelUrl", AttributeKey::SsdpModelUrl),
    ("SsdpSerialNumber", AttributeKey::SsdpSerialNumber),
    ("SsdpUserAgent", AttributeKey::SsdpUserAgent),
    ("SsdpServer", AttributeKey::SsdpServer),
    ("SsdpLocation", AttributeKey::SsdpLocation),
];

impl AttributeKey {
    pub fn from_name(name: &str) -> Option<Self> {
        ATTRIBUTE_KEYS
            .iter()
            .find(|(key_name, _)| *key_name == name)
            .map(|(_, key)| *key)
    }

    fn value(self, host: &Host) -> &str {
        match self {
            AttributeKey::MacOid => host.mac_oid(),
            AttributeKey::DhcpHostname => &host.dhcp.dhcp_hostname,
            AttributeKey::DhcpVendor => &host.dhcp.dhcp_vendor,
            AttributeKey::Hostname => &host.dhcp.hostname,
            AttributeKey::SsdpFriendlyName => &host.ssdp.friendly_name,
            AttributeKey::SsdpManufacturer => &host.ssdp.manufacturer,
            AttributeKey::SsdpManufacturerUrl => &host.ssdp.manufacturer_url,
            AttributeKey::SsdpModelName => &host.ssdp.model_name,
            AttributeKey::SsdpModelUrl => &host.ssdp.model_url,
            AttributeKey::SsdpSerialNumber => &host.ssdp.serial_number,
            AttributeKey::SsdpUserAgent => &host.ssdp.user_agent,
            AttributeKey::SsdpServer => &host.ssdp.server,
            AttributeKey::SsdpLocation => &host.ssdp.location,
        }
    }
}

/// Condition value split into its comparison mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pattern<'a> {
    Exact(&'a str),
    Prefix(&'a str),
    Suffix(&'a str),
}

impl<'a> Pattern<'a> {
    fn parse(value: &'a str) -> Self {
        if let Some(rest) = value.strip_prefix(WILDCARD) {
            Pattern::Suffix(rest)
        } else if let Some(rest) = value.strip_suffix(WILDCARD) {
            Pattern::Prefix(rest)
        } else {
            Pattern::Exact(value)
        }
    }

    fn matches(self, value: &str) -> bool {
        match self {
            Pattern::Exact(pattern) => value == pattern,
            Pattern::Prefix(pattern) => value.starts_with(pattern),
            Pattern::Suffix(pattern) => value.ends_with(pattern),
        }
    }
}

impl Host {
    /// Evaluate a single condition against this host's attributes
    pub fn match_condition(&self, condition: &MatchCondition, trace: &mut dyn MatchTrace) -> bool {
        if condition.subset_match {
            return self.match_subset(condition, trace);
        }

        let value = match AttributeKey::from_name(&condition.key) {
            Some(key) => key.value(self),
            None => {
                // Unknown keys compare against "" so profiles relying on an empty match keep working.
                trace.record(Diagnostic::UnknownAttribute {
                    key: condition.key.clone(),
                });
                ""
            }
        };

        let matched = Pattern::parse(&condition.value).matches(value);
        trace.record(Diagnostic::ConditionEvaluated {
            key: condition.key.clone(),
            pattern: condition.value.clone(),
            matched,
        });
        matched
    }

    /// Set-membership evaluation; only `DnsQueries` is supported
    pub fn match_subset(&self, condition: &MatchCondition, trace: &mut dyn MatchTrace) -> bool {
        if condition.key != SUBSET_DNS_QUERIES {
            trace.record(Diagnostic::UnsupportedSubsetKey {
                key: condition.key.clone(),
            });
            return false;
        }

        let found = self.dns_cache.contains_key(&condition.value);
        trace.record(Diagnostic::DnsQueryLookup {
            fqdn: condition.value.clone(),
            found,
        });
        found
    }

    /// True iff every condition of the identifier holds. Stops at the first failure.
    pub fn match_identifier(&self, identifier: &Identifier, trace: &mut dyn MatchTrace) -> bool {
        identifier
            .conditions
            .iter()
            .all(|condition| self.match_condition(condition, trace))
    }

    /// Best confidence any identifier of the profile grants this host.
    /// Returns as soon as an identifier grants `High`.
    pub fn match_profile(&self, profile: &DeviceProfile, trace: &mut dyn MatchTrace) -> ConfidenceLevel {
        let mut best = ConfidenceLevel::None;
        for identifier in &profile.identifiers {
            if !self.match_identifier(identifier, trace) {
                continue;
            }
            if identifier.confidence >= ConfidenceLevel::High {
                return identifier.confidence;
            }
            best = best.max(identifier.confidence);
        }
        best
    }

    /// Match against the whole catalog and commit the winning profile.
    ///
    /// An existing match is kept without rescanning unless its profile has been
    /// updated after the match was made (or has left the catalog). Returns true
    /// if the host ends up matched by this call.
    pub fn match_catalog(
        &mut self,
        catalog: &DeviceProfileMap,
        now: DateTime<Utc>,
        trace: &mut dyn MatchTrace,
    ) -> bool {
        if let (Some(uuid), Some(match_time)) = (self.uuid.as_deref(), self.match_time) {
            if let Some(profile) = catalog.get(uuid) {
                if profile.last_updated <= match_time {
                    trace.record(Diagnostic::MatchRetained {
                        uuid: uuid.to_string(),
                    });
                    return true;
                }
            }
        }

        let mut best = ConfidenceLevel::None;
        let mut best_uuid: Option<&str> = None;
        for (uuid, profile) in catalog {
            let confidence = self.match_profile(profile, trace);
            trace.record(Diagnostic::ProfileEvaluated {
                uuid: uuid.clone(),
                confidence,
            });
            if confidence > best {
                best = confidence;
                best_uuid = Some(uuid.as_str());
                self.match_time = Some(self.match_time.map_or(now, |previous| previous.max(now)));
            }
        }

        match best_uuid {
            Some(uuid) if best >= ConfidenceLevel::Low => {
                self.uuid = Some(uuid.to_string());
                true
            }
            _ => false,
        }
    }
}
