use std::net::Ipv4Addr;
use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params, OptionalExtension};
use crate::host::Host;

/// Persisted match of one host, restored at start-up so stickiness survives a restart
#[derive(Debug, Clone, PartialEq)]
pub struct StoredHost {
    pub mac_address: String,
    pub ipv4_address: Option<Ipv4Addr>,
    pub profile_uuid: String,
    pub match_time: DateTime<Utc>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl StoredHost {
    /// Snapshot of a matched host; `None` for hosts without a match
    pub fn from_host(host: &Host) -> Option<Self> {
        let profile_uuid = host.uuid()?.to_string();
        let match_time = host.match_time()?;
        Some(Self {
            mac_address: host.mac_address().to_string(),
            ipv4_address: host.ipv4_address(),
            profile_uuid,
            match_time,
            first_seen: host.first_seen(),
            last_seen: host.last_seen(),
        })
    }

    pub fn into_host(self) -> Host {
        Host::restore(
            self.mac_address,
            self.ipv4_address,
            self.profile_uuid,
            self.match_time,
            self.first_seen,
            self.last_seen,
        )
    }
}

pub struct HostDb {
    conn: Connection,
}

impl HostDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS hosts (
                mac_address   TEXT PRIMARY KEY,
                ipv4_address  TEXT,
                profile_uuid  TEXT NOT NULL,
                match_time    TEXT NOT NULL,
                first_seen    TEXT NOT NULL,
                last_seen     TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_profile_uuid ON hosts(profile_uuid);
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    /// Insert or update a stored match. Returns true if the match itself changed.
    pub fn upsert_host(&self, host: &StoredHost) -> Result<bool> {
        let existing = self.get_host(&host.mac_address)?;
        let changed = match &existing {
            Some(old) => match_changed(old, host),
            None => true,
        };

        self.conn.execute(
            r#"
            INSERT INTO hosts (
                mac_address, ipv4_address, profile_uuid, match_time, first_seen, last_seen
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(mac_address) DO UPDATE SET
                ipv4_address = excluded.ipv4_address,
                profile_uuid = excluded.profile_uuid,
                match_time = excluded.match_time,
                first_seen = excluded.first_seen,
                last_seen = excluded.last_seen
            "#,
            params![
                &host.mac_address,
                host.ipv4_address.map(|ip| ip.to_string()),
                &host.profile_uuid,
                host.match_time.to_rfc3339(),
                host.first_seen.to_rfc3339(),
                host.last_seen.to_rfc3339(),
            ],
        )
        .context("Failed to upsert host")?;

        Ok(changed)
    }

    pub fn get_all_hosts(&self) -> Result<Vec<StoredHost>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT mac_address, ipv4_address, profile_uuid, match_time, first_seen, last_seen
                 FROM hosts"
            )
            .context("Failed to prepare query")?;

        let hosts = stmt
            .query_map([], |row| Self::row_to_host(row))
            .context("Failed to query hosts")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect hosts")?;

        Ok(hosts)
    }

    pub fn get_host(&self, mac_address: &str) -> Result<Option<StoredHost>> {
        let result = self
            .conn
            .query_row(
                "SELECT mac_address, ipv4_address, profile_uuid, match_time, first_seen, last_seen
                 FROM hosts WHERE mac_address = ?1",
                params![mac_address],
                |row| Self::row_to_host(row),
            )
            .optional()
            .context("Failed to query host")?;

        Ok(result)
    }

    /// Delete hosts not seen for `inactive_after_secs`
    pub fn prune_inactive(&self, inactive_after_secs: u64, now: DateTime<Utc>) -> Result<u64> {
        let cutoff = now - chrono::Duration::seconds(inactive_after_secs as i64);

        let count = self.conn.execute(
            "DELETE FROM hosts WHERE last_seen < ?1",
            params![cutoff.to_rfc3339()],
        )
        .context("Failed to prune inactive hosts")?;

        Ok(count as u64)
    }

    fn row_to_host(row: &rusqlite::Row) -> Result<StoredHost, rusqlite::Error> {
        let ipv4_str: Option<String> = row.get(1)?;
        let ipv4_address = ipv4_str
            .map(|s| s.parse::<Ipv4Addr>())
            .transpose()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
                1,
                rusqlite::types::Type::Text,
                Box::new(e),
            ))?;

        Ok(StoredHost {
            mac_address: row.get(0)?,
            ipv4_address,
            profile_uuid: row.get(2)?,
            match_time: parse_timestamp(row, 3)?,
            first_seen: parse_timestamp(row, 4)?,
            last_seen: parse_timestamp(row, 5)?,
        })
    }
}

fn parse_timestamp(row: &rusqlite::Row, idx: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    let value: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            Box::new(e),
        ))
}

/// Only the match and address count as a change; seen timestamps move on every sweep.
fn match_changed(old: &StoredHost, new: &StoredHost) -> bool {
    old.profile_uuid != new.profile_uuid
        || old.match_time != new.match_time
        || old.ipv4_address != new.ipv4_address
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn test_host() -> StoredHost {
        StoredHost {
            mac_address: "00:17:88:aa:bb:cc".to_string(),
            ipv4_address: Some(Ipv4Addr::new(192, 168, 1, 20)),
            profile_uuid: "hue-bridge".to_string(),
            match_time: t(10),
            first_seen: t(0),
            last_seen: t(20),
        }
    }

    #[test]
    fn test_create_and_query() {
        let db = HostDb::open(":memory:").unwrap();
        let host = test_host();

        let changed = db.upsert_host(&host).unwrap();
        assert!(changed, "First insert should report change");

        let retrieved = db.get_host(&host.mac_address).unwrap().unwrap();
        assert_eq!(retrieved, host);
        assert_eq!(db.get_all_hosts().unwrap().len(), 1);
        assert!(db.get_host("ff:ff:ff:ff:ff:ff").unwrap().is_none());
    }

    #[test]
    fn test_upsert_detects_changes() {
        let db = HostDb::open(":memory:").unwrap();
        let mut host = test_host();
        db.upsert_host(&host).unwrap();

        host.last_seen = t(40);
        assert!(!db.upsert_host(&host).unwrap(), "Seen timestamps alone are not a change");
        assert_eq!(db.get_host(&host.mac_address).unwrap().unwrap().last_seen, t(40));

        host.profile_uuid = "other".to_string();
        assert!(db.upsert_host(&host).unwrap());
    }

    #[test]
    fn test_host_without_address() {
        let db = HostDb::open(":memory:").unwrap();
        let mut host = test_host();
        host.ipv4_address = None;
        db.upsert_host(&host).unwrap();
        assert_eq!(db.get_host(&host.mac_address).unwrap().unwrap().ipv4_address, None);
    }

    #[test]
    fn test_prune_inactive() {
        let db = HostDb::open(":memory:").unwrap();
        let old = test_host();
        let mut recent = test_host();
        recent.mac_address = "b8:27:eb:12:34:56".to_string();
        recent.last_seen = t(5_000);

        db.upsert_host(&old).unwrap();
        db.upsert_host(&recent).unwrap();

        assert_eq!(db.prune_inactive(1_000, t(5_500)).unwrap(), 1);
        let remaining = db.get_all_hosts().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].mac_address, "b8:27:eb:12:34:56");
    }

    #[test]
    fn test_round_trip_through_host() {
        let stored = test_host();
        let host = stored.clone().into_host();
        assert!(host.is_matched());
        assert_eq!(StoredHost::from_host(&host), Some(stored));

        let unmatched = Host::new("aa:bb:cc:dd:ee:ff", t(0));
        assert_eq!(StoredHost::from_host(&unmatched), None);
    }
}
