use std::collections::{BTreeMap, HashMap};
use std::thread;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use anyhow::Result;
use shared::types::{DeviceExport, DeviceProfileMap, DeviceStats, HostEvent, TrafficStats};
use crate::config::CacheConfig;
use crate::host::{expires_in, Host, SsdpUpdate, TracingTrace};
use crate::ssdp::location::LocationRequest;
use crate::store::db::{HostDb, StoredHost};
use crate::store::hash;

/// Commands sent to the host thread
pub enum HostCommand {
    Event(HostEvent, oneshot::Sender<bool>),
    MatchAll(oneshot::Sender<Result<usize>>),
    Maintenance {
        force: bool,
        reply: oneshot::Sender<Result<MaintenanceReport>>,
    },
    DeviceStats {
        force: bool,
        detailed: bool,
        reply: oneshot::Sender<BTreeMap<String, DeviceStats>>,
    },
    TrafficStats {
        force: bool,
        reply: oneshot::Sender<BTreeMap<String, TrafficStats>>,
    },
    Export {
        detailed: bool,
        reply: oneshot::Sender<Vec<DeviceExport>>,
    },
    GetOne(String, oneshot::Sender<Option<DeviceExport>>),
    ReloadCatalog(DeviceProfileMap, oneshot::Sender<usize>),
    Shutdown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MaintenanceReport {
    /// Hosts that had DNS or flow entries removed
    pub pruned_hosts: usize,
    /// Hosts dropped for inactivity
    pub reaped_hosts: usize,
    /// Stored matches deleted for inactivity
    pub forgotten_matches: u64,
}

/// Result of applying one listener event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Applied {
    /// Host state changed
    changed: bool,
    /// A host appeared or a field of the hashed export changed
    export_changed: bool,
}

/// Host population owned by the host thread. Nothing else touches a Host.
struct HostCache {
    hosts: HashMap<String, Host>,
    catalog: DeviceProfileMap,
    db: HostDb,
    config: CacheConfig,
    location_tx: mpsc::Sender<LocationRequest>,
}

impl HostCache {
    fn restore(&mut self) -> Result<usize> {
        let stored = self.db.get_all_hosts()?;
        let count = stored.len();
        for host in stored {
            let host = host.into_host();
            self.hosts.insert(host.mac_address().to_string(), host);
        }
        Ok(count)
    }

    /// Apply a listener observation
    fn apply(&mut self, event: HostEvent, now: DateTime<Utc>) -> Applied {
        let mac_address = event.mac_address().to_ascii_lowercase();

        if let HostEvent::SsdpLocation { location, description, .. } = event {
            let changed = match self.hosts.get_mut(&mac_address) {
                Some(host) => host.ssdp_location_set(&location, description, now),
                None => {
                    tracing::debug!("Dropping SSDP description for unknown host {}", mac_address);
                    false
                }
            };
            return Applied {
                changed,
                export_changed: changed,
            };
        }

        let created = !self.hosts.contains_key(&mac_address);
        let attributes = matches!(event, HostEvent::Dhcp(_) | HostEvent::Ssdp { .. });
        let host = self.hosts.entry(mac_address.clone()).or_insert_with(|| {
            tracing::info!("New host {}", mac_address);
            Host::new(mac_address.clone(), now)
        });

        let changed = match event {
            HostEvent::Dhcp(request) => host.dhcp_set(request, self.config.dhcp_expiration_secs, now),
            HostEvent::Ssdp { info, .. } => {
                match host.ssdp_info_set(info, self.config.ssdp_expiration_secs, now) {
                    SsdpUpdate::Unchanged => false,
                    SsdpUpdate::Changed { location } => {
                        if let Some(location) = location {
                            let request = LocationRequest {
                                mac_address: mac_address.clone(),
                                location,
                            };
                            if let Err(e) = self.location_tx.try_send(request) {
                                tracing::warn!("Dropping SSDP location fetch for {}: {}", mac_address, e);
                            }
                        }
                        true
                    }
                }
            }
            HostEvent::Dns { fqdn, ip, ttl_secs, .. } => {
                let ttl_secs = ttl_secs.max(self.config.dns_min_ttl_secs);
                host.dns_log_entry_set(&fqdn, ip, expires_in(now, ttl_secs), now)
            }
            HostEvent::Flow { src_port, dst_ip, dst_port, protocol, ttl_secs, .. } => {
                let ttl_secs = ttl_secs.unwrap_or(self.config.flow_expiration_secs);
                host.flow_entry_set(src_port, dst_ip, dst_port, protocol, expires_in(now, ttl_secs), now)
            }
            HostEvent::SsdpLocation { .. } => false,
        };

        Applied {
            changed,
            export_changed: created || (changed && attributes),
        }
    }

    /// Match every host against the catalog. Returns how many hosts got a new profile.
    fn match_all(&mut self, now: DateTime<Utc>) -> Result<usize> {
        let mut changed = 0;
        for host in self.hosts.values_mut() {
            let previous = host.uuid().map(str::to_string);
            let mac_address = host.mac_address().to_string();
            let mut trace = TracingTrace { mac_address: &mac_address };

            if !host.match_catalog(&self.catalog, now, &mut trace) || host.uuid() == previous.as_deref() {
                continue;
            }

            changed += 1;
            tracing::info!(
                "Host {} matched device profile {}",
                mac_address,
                host.uuid().unwrap_or_default()
            );
            if let Some(stored) = StoredHost::from_host(host) {
                self.db.upsert_host(&stored)?;
            }
        }
        Ok(changed)
    }

    fn maintenance(&mut self, force: bool, now: DateTime<Utc>) -> Result<MaintenanceReport> {
        let mut report = MaintenanceReport::default();

        for host in self.hosts.values_mut() {
            if host.prune(force, now) {
                report.pruned_hosts += 1;
            }
        }

        let inactive_after = Duration::seconds(self.config.host_inactive_after_secs as i64);
        let before = self.hosts.len();
        self.hosts.retain(|mac_address, host| {
            let active = host.last_seen() >= now - inactive_after;
            if !active {
                tracing::info!("Removing inactive host {}", mac_address);
            }
            active
        });
        report.reaped_hosts = before - self.hosts.len();

        for stored in self.hosts.values().filter_map(StoredHost::from_host) {
            self.db.upsert_host(&stored)?;
        }
        report.forgotten_matches = self.db.prune_inactive(self.config.host_inactive_after_secs, now)?;

        Ok(report)
    }

    fn report_window(&self) -> Duration {
        Duration::seconds(self.config.report_interval_secs as i64)
    }

    fn device_stats(&self, force: bool, detailed: bool, now: DateTime<Utc>) -> BTreeMap<String, DeviceStats> {
        let window = self.report_window();
        self.hosts
            .iter()
            .filter_map(|(mac, host)| {
                host.device_stats(window, force, detailed, now)
                    .map(|stats| (mac.clone(), stats))
            })
            .collect()
    }

    fn traffic_stats(&self, force: bool, now: DateTime<Utc>) -> BTreeMap<String, TrafficStats> {
        let window = self.report_window();
        self.hosts
            .iter()
            .filter_map(|(mac, host)| {
                host.traffic_stats(window, force, now)
                    .map(|stats| (mac.clone(), stats))
            })
            .collect()
    }

    fn export(&self, detailed: bool, now: DateTime<Utc>) -> Vec<DeviceExport> {
        let mut exports: Vec<DeviceExport> = self
            .hosts
            .values()
            .map(|host| host.export_device_info(detailed, now))
            .collect();
        exports.sort_by(|a, b| a.mac_address.cmp(&b.mac_address));
        exports
    }
}

/// Recompute the device hash and publish it if it moved
fn publish_hash(cache: &HostCache, hash_tx: &watch::Sender<String>) {
    match hash::compute_hash(&cache.export(false, Utc::now())) {
        Ok(new_hash) => {
            hash_tx.send_if_modified(|current| {
                if *current == new_hash {
                    return false;
                }
                *current = new_hash;
                true
            });
        }
        Err(e) => tracing::error!("Failed to hash devices: {}", e),
    }
}

/// Handle to interact with the host thread
#[derive(Clone)]
pub struct HostHandle {
    tx: mpsc::Sender<HostCommand>,
}

impl HostHandle {
    /// Spawn the host thread. Matches stored in `db` are restored first.
    pub fn spawn(
        db: HostDb,
        catalog: DeviceProfileMap,
        config: CacheConfig,
        hash_tx: watch::Sender<String>,
        location_tx: mpsc::Sender<LocationRequest>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<HostCommand>(256);

        let mut cache = HostCache {
            hosts: HashMap::new(),
            catalog,
            db,
            config,
            location_tx,
        };
        match cache.restore() {
            Ok(count) => tracing::info!("Restored {} matched hosts", count),
            Err(e) => tracing::error!("Failed to restore matched hosts: {}", e),
        }

        publish_hash(&cache, &hash_tx);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    HostCommand::Event(event, reply) => {
                        let applied = cache.apply(event, Utc::now());
                        if applied.export_changed {
                            publish_hash(&cache, &hash_tx);
                        }
                        let _ = reply.send(applied.changed);
                    }
                    HostCommand::MatchAll(reply) => {
                        let result = cache.match_all(Utc::now());
                        if matches!(&result, Ok(changed) if *changed > 0) {
                            publish_hash(&cache, &hash_tx);
                        }
                        let _ = reply.send(result);
                    }
                    HostCommand::Maintenance { force, reply } => {
                        let result = cache.maintenance(force, Utc::now());
                        publish_hash(&cache, &hash_tx);
                        let _ = reply.send(result);
                    }
                    HostCommand::DeviceStats { force, detailed, reply } => {
                        let _ = reply.send(cache.device_stats(force, detailed, Utc::now()));
                    }
                    HostCommand::TrafficStats { force, reply } => {
                        let _ = reply.send(cache.traffic_stats(force, Utc::now()));
                    }
                    HostCommand::Export { detailed, reply } => {
                        let _ = reply.send(cache.export(detailed, Utc::now()));
                    }
                    HostCommand::GetOne(mac_address, reply) => {
                        let export = cache
                            .hosts
                            .get(&mac_address)
                            .map(|host| host.export_device_info(true, Utc::now()));
                        let _ = reply.send(export);
                    }
                    HostCommand::ReloadCatalog(catalog, reply) => {
                        cache.catalog = catalog;
                        tracing::info!("Device profile catalog now holds {} profiles", cache.catalog.len());
                        let _ = reply.send(cache.catalog.len());
                    }
                    HostCommand::Shutdown => {
                        tracing::info!("Host thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    /// Apply a listener event. Returns true if the host changed.
    pub async fn event(&self, event: HostEvent) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HostCommand::Event(event, reply)).await?;
        Ok(rx.await?)
    }

    /// Match all hosts against the catalog. Returns how many got a new profile.
    pub async fn match_all(&self) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HostCommand::MatchAll(reply)).await?;
        rx.await?
    }

    /// Prune host caches, drop inactive hosts and stored matches
    pub async fn maintenance(&self, force: bool) -> Result<MaintenanceReport> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HostCommand::Maintenance { force, reply }).await?;
        rx.await?
    }

    pub async fn device_stats(&self, force: bool, detailed: bool) -> Result<BTreeMap<String, DeviceStats>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HostCommand::DeviceStats { force, detailed, reply }).await?;
        Ok(rx.await?)
    }

    pub async fn traffic_stats(&self, force: bool) -> Result<BTreeMap<String, TrafficStats>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HostCommand::TrafficStats { force, reply }).await?;
        Ok(rx.await?)
    }

    /// Export all hosts, sorted by MAC address
    pub async fn export(&self, detailed: bool) -> Result<Vec<DeviceExport>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HostCommand::Export { detailed, reply }).await?;
        Ok(rx.await?)
    }

    /// Detailed export of a single host
    pub async fn get_one(&self, mac_address: String) -> Result<Option<DeviceExport>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HostCommand::GetOne(mac_address, reply)).await?;
        Ok(rx.await?)
    }

    /// Swap in a freshly loaded catalog. Returns the number of profiles.
    pub async fn reload_catalog(&self, catalog: DeviceProfileMap) -> Result<usize> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(HostCommand::ReloadCatalog(catalog, reply)).await?;
        Ok(rx.await?)
    }

    /// Shutdown the host thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(HostCommand::Shutdown).await?;
        Ok(())
    }
}

/// Host manager event loop - bridges listener events to the host thread and
/// drives the periodic match and maintenance sweeps
pub async fn run(
    hosts: HostHandle,
    mut rx: mpsc::Receiver<HostEvent>,
    config: CacheConfig,
    cancel: CancellationToken,
) -> Result<()> {
    let mut match_interval = tokio::time::interval(
        std::time::Duration::from_secs(config.match_interval_secs)
    );
    let mut prune_interval = tokio::time::interval(
        std::time::Duration::from_secs(config.prune_interval_secs)
    );

    loop {
        tokio::select! {
            Some(event) = rx.recv() => {
                if let Err(e) = hosts.event(event).await {
                    tracing::error!("Failed to apply host event: {}", e);
                }
            }
            _ = match_interval.tick() => {
                match hosts.match_all().await {
                    Ok(0) => {}
                    Ok(changed) => tracing::info!("Matched {} hosts to device profiles", changed),
                    Err(e) => tracing::error!("Failed to match hosts: {}", e),
                }
            }
            _ = prune_interval.tick() => {
                match hosts.maintenance(false).await {
                    Ok(report) => tracing::debug!("Maintenance: {:?}", report),
                    Err(e) => tracing::error!("Failed to run maintenance: {}", e),
                }
            }
            _ = cancel.cancelled() => {
                tracing::info!("Host manager shutting down");
                break;
            }
        }
    }

    Ok(())
}
