use chrono::{DateTime, Utc};

/// Outbound flow from a host to one destination address (the cache key).
/// Two entries are the same flow when `(src_port, dst_port, protocol)` match;
/// `expiration` is not part of equality and is refreshed on repeat observations.
#[derive(Debug, Clone, Copy)]
pub struct FlowEntry {
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
    pub expiration: DateTime<Utc>,
}

pub type FlowEntryList = Vec<FlowEntry>;

impl FlowEntry {
    pub fn new(src_port: u16, dst_port: u16, protocol: u8, expiration: DateTime<Utc>) -> Self {
        Self {
            src_port,
            dst_port,
            protocol,
            expiration,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expiration
    }
}

impl PartialEq for FlowEntry {
    fn eq(&self, other: &Self) -> bool {
        self.src_port == other.src_port
            && self.dst_port == other.dst_port
            && self.protocol == other.protocol
    }
}

impl Eq for FlowEntry {}
