/// Marker that turns a match-condition value into a prefix ("abc*") or suffix ("*abc") pattern
pub const WILDCARD: char = '*';

/// Number of leading characters of a MAC address string that form its OUI, e.g. "aa:bb:cc"
pub const MAC_OID_LEN: usize = 8;

/// Subset-match key selecting the set of FQDNs a host has resolved
pub const SUBSET_DNS_QUERIES: &str = "DnsQueries";

/// Reporting window used when detailed device info is merged into an export
pub const DETAILED_EXPORT_WINDOW_SECS: i64 = 604_800;
