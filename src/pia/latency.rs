//! Picking the region with the lowest connect latency

use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};

use super::{Client, ClientConfig, PiaError, Region, Result};

/// Measures how long it takes to reach a server
#[async_trait]
pub trait LatencyProbe {
    async fn probe(&self, ip: &str) -> Result<Duration>;
}

/// Times a bare TCP connect. No bytes are exchanged, so the result is
/// the connection establishment time only.
#[derive(Debug, Clone)]
pub struct TcpProbe {
    pub port: u16,
    pub timeout: Option<Duration>,
}

#[async_trait]
impl LatencyProbe for TcpProbe {
    async fn probe(&self, ip: &str) -> Result<Duration> {
        let start = Instant::now();
        let connect = TcpStream::connect((ip, self.port));
        let connected = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, connect)
                .await
                .map_err(|_| PiaError::ProbeTimeout {
                    ip: ip.to_string(),
                    timeout,
                })?,
            None => connect.await,
        };
        let elapsed = start.elapsed();
        drop(connected.map_err(|source| PiaError::Probe {
            ip: ip.to_string(),
            source,
        })?);
        Ok(elapsed)
    }
}

/// What to do when a region's representative server cannot be reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProbeFailurePolicy {
    /// Log the failure and leave the region out of the comparison
    #[default]
    Skip,
    /// Fail the whole selection with the probe error
    Abort,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Latency {
    pub time: Duration,
    pub server_ip: String,
    pub region_id: String,
    pub region_name: String,
}

#[derive(Debug, Clone)]
pub struct Selection {
    pub group: String,
    pub port_forward: bool,
    pub concurrency: usize,
    pub policy: ProbeFailurePolicy,
}

impl From<&ClientConfig> for Selection {
    fn from(config: &ClientConfig) -> Self {
        Self {
            group: config.representative_group.clone(),
            port_forward: config.port_forward,
            concurrency: config.probe_concurrency,
            policy: config.failure_policy,
        }
    }
}

/// Probes the first server of `selection.group` in every eligible region and
/// returns the fastest one. `None` means no region produced a sample.
///
/// Probes run concurrently but results are compared in directory order, so on a
/// tie the region listed first wins.
pub async fn select_region<P>(
    regions: &[Region],
    probe: &P,
    selection: &Selection,
) -> Result<Option<Latency>>
where
    P: LatencyProbe + ?Sized,
{
    let candidates = regions.iter().filter_map(|region| {
        if region.offline {
            debug!(region = %region.id, "Region is offline, skipping");
            return None;
        }
        if selection.port_forward && !region.port_forward {
            debug!(region = %region.id, "Region does not support port forwarding, skipping");
            return None;
        }
        match region.first_server(&selection.group) {
            Some(server) => Some((region, server)),
            None => {
                debug!(region = %region.id, group = %selection.group, "Region has no servers in group, skipping");
                None
            }
        }
    });

    let mut samples = futures::stream::iter(candidates)
        .map(|(region, server)| async move { (region, server, probe.probe(&server.ip).await) })
        .buffered(selection.concurrency.max(1));

    let mut best: Option<Latency> = None;
    while let Some((region, server, sample)) = samples.next().await {
        let time = match sample {
            Ok(time) => time,
            Err(err) if selection.policy == ProbeFailurePolicy::Abort => return Err(err),
            Err(err) => {
                warn!(region = %region.id, ip = %server.ip, %err, "Probe failed, skipping region");
                continue;
            }
        };
        debug!(region = %region.id, ip = %server.ip, ?time, "Probed region");

        if best.as_ref().map_or(true, |best| time < best.time) {
            best = Some(Latency {
                time,
                server_ip: server.ip.clone(),
                region_id: region.id.clone(),
                region_name: region.name.clone(),
            });
        }
    }

    Ok(best)
}

#[derive(Debug, Clone, PartialEq)]
pub struct SelectedRegion {
    pub region: Region,
    /// Set when the region was picked by the latency scan
    pub latency: Option<Latency>,
}

impl Client {
    pub fn tcp_probe(&self) -> TcpProbe {
        TcpProbe {
            port: self.config.probe_port,
            timeout: self.config.probe_timeout,
        }
    }

    /// Fetches the directory and returns the fastest region using TCP connect probes
    pub async fn best_region(&self) -> Result<Option<Latency>> {
        self.best_region_with(&self.tcp_probe()).await
    }

    #[instrument(skip_all)]
    pub async fn best_region_with<P>(&self, probe: &P) -> Result<Option<Latency>>
    where
        P: LatencyProbe + ?Sized,
    {
        let servers = self.servers().await?;
        let best = select_region(&servers.regions, probe, &Selection::from(self.config())).await?;
        match &best {
            Some(best) => info!(region = %best.region_name, time = ?best.time, "Selected fastest region"),
            None => warn!("No region answered the latency probe"),
        }
        Ok(best)
    }

    /// Returns the preferred region when one is configured, otherwise the fastest one.
    pub async fn resolve_region(&self) -> Result<Option<SelectedRegion>> {
        self.resolve_region_with(&self.tcp_probe()).await
    }

    #[instrument(skip_all)]
    pub async fn resolve_region_with<P>(&self, probe: &P) -> Result<Option<SelectedRegion>>
    where
        P: LatencyProbe + ?Sized,
    {
        let servers = self.servers().await?;

        if let Some(preferred) = self.config.preferred_region() {
            let region = servers
                .region(preferred)
                .cloned()
                .ok_or_else(|| PiaError::UnknownRegion(preferred.to_string()))?;
            info!(region = %region.id, "Using preferred region");
            return Ok(Some(SelectedRegion {
                region,
                latency: None,
            }));
        }

        let best = select_region(&servers.regions, probe, &Selection::from(self.config())).await?;
        Ok(best.and_then(|latency| {
            servers.region(&latency.region_id).cloned().map(|region| SelectedRegion {
                region,
                latency: Some(latency),
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, HashMap},
        sync::atomic::{AtomicUsize, Ordering},
    };

    use super::*;
    use crate::pia::Server;

    struct FakeProbe {
        latencies: HashMap<String, Duration>,
        calls: AtomicUsize,
    }

    impl FakeProbe {
        fn new(latencies: &[(&str, u64)]) -> Self {
            Self {
                latencies: latencies
                    .iter()
                    .map(|(ip, ms)| (ip.to_string(), Duration::from_millis(*ms)))
                    .collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl LatencyProbe for FakeProbe {
        async fn probe(&self, ip: &str) -> Result<Duration> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.latencies
                .get(ip)
                .copied()
                .ok_or_else(|| PiaError::Probe {
                    ip: ip.to_string(),
                    source: std::io::ErrorKind::ConnectionRefused.into(),
                })
        }
    }

    fn region(id: &str, meta: &[&str]) -> Region {
        let servers = meta
            .iter()
            .map(|ip| Server {
                ip: ip.to_string(),
                cn: format!("{id}-server"),
                van: false,
            })
            .collect();
        Region {
            id: id.to_string(),
            name: id.to_string(),
            country: "US".to_string(),
            auto_region: true,
            dns: String::new(),
            port_forward: false,
            geo: false,
            offline: false,
            servers: BTreeMap::from([("meta".to_string(), servers)]),
        }
    }

    fn selection(policy: ProbeFailurePolicy) -> Selection {
        Selection {
            group: "meta".to_string(),
            port_forward: false,
            concurrency: 4,
            policy,
        }
    }

    #[tokio::test]
    async fn picks_lowest_latency() {
        let regions = vec![
            region("us-west", &["10.0.0.2"]),
            region("us-east", &["10.0.0.1"]),
            region("eu-north", &["10.0.0.3"]),
        ];
        let probe = FakeProbe::new(&[("10.0.0.1", 10), ("10.0.0.2", 50), ("10.0.0.3", 30)]);

        let best = select_region(&regions, &probe, &selection(ProbeFailurePolicy::Skip))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(best.region_name, "us-east");
        assert_eq!(best.server_ip, "10.0.0.1");
        assert_eq!(best.time, Duration::from_millis(10));
    }

    #[tokio::test]
    async fn probes_only_first_meta_server() {
        let regions = vec![region("us-east", &["10.0.0.1", "10.0.0.9"])];
        let probe = FakeProbe::new(&[("10.0.0.1", 10)]);

        let best = select_region(&regions, &probe, &selection(ProbeFailurePolicy::Abort))
            .await
            .unwrap();

        assert_eq!(best.unwrap().server_ip, "10.0.0.1");
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skips_regions_without_representative_servers() {
        let mut no_group = region("no-group", &[]);
        no_group.servers.clear();
        let regions = vec![region("empty", &[]), no_group, region("us-east", &["10.0.0.1"])];
        let probe = FakeProbe::new(&[("10.0.0.1", 25)]);

        let best = select_region(&regions, &probe, &selection(ProbeFailurePolicy::Abort))
            .await
            .unwrap();

        assert_eq!(best.unwrap().region_name, "us-east");
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_candidates_yields_none() {
        let probe = FakeProbe::new(&[]);
        let best = select_region(&[region("empty", &[])], &probe, &selection(ProbeFailurePolicy::Skip))
            .await
            .unwrap();
        assert_eq!(best, None);
    }

    #[tokio::test]
    async fn zero_latency_sample_is_still_selected() {
        let regions = vec![region("local", &["127.0.0.1"])];
        let probe = FakeProbe::new(&[("127.0.0.1", 0)]);
        let best = select_region(&regions, &probe, &selection(ProbeFailurePolicy::Skip))
            .await
            .unwrap();
        assert_eq!(best.unwrap().time, Duration::ZERO);
    }

    #[tokio::test]
    async fn ties_go_to_first_listed_region() {
        let regions = vec![region("first", &["10.0.0.1"]), region("second", &["10.0.0.2"])];
        let probe = FakeProbe::new(&[("10.0.0.1", 20), ("10.0.0.2", 20)]);
        let best = select_region(&regions, &probe, &selection(ProbeFailurePolicy::Skip))
            .await
            .unwrap();
        assert_eq!(best.unwrap().region_name, "first");
    }

    #[tokio::test]
    async fn unreachable_region_is_skipped_by_default() {
        let regions = vec![region("down", &["10.0.0.66"]), region("up", &["10.0.0.1"])];
        let probe = FakeProbe::new(&[("10.0.0.1", 40)]);
        let best = select_region(&regions, &probe, &selection(ProbeFailurePolicy::Skip))
            .await
            .unwrap();
        assert_eq!(best.unwrap().region_name, "up");
    }

    #[tokio::test]
    async fn unreachable_region_aborts_when_requested() {
        let regions = vec![region("down", &["10.0.0.66"]), region("up", &["10.0.0.1"])];
        let probe = FakeProbe::new(&[("10.0.0.1", 40)]);
        let err = select_region(&regions, &probe, &selection(ProbeFailurePolicy::Abort))
            .await
            .unwrap_err();
        assert!(matches!(err, PiaError::Probe { ref ip, .. } if ip == "10.0.0.66"));
    }

    #[tokio::test]
    async fn filters_offline_and_non_port_forwarding_regions() {
        let mut offline = region("offline", &["10.0.0.1"]);
        offline.offline = true;
        let mut pf = region("pf", &["10.0.0.3"]);
        pf.port_forward = true;
        let regions = vec![offline, region("no-pf", &["10.0.0.2"]), pf];
        let probe = FakeProbe::new(&[("10.0.0.1", 1), ("10.0.0.2", 2), ("10.0.0.3", 3)]);

        let mut only_pf = selection(ProbeFailurePolicy::Abort);
        only_pf.port_forward = true;
        let best = select_region(&regions, &probe, &only_pf).await.unwrap();
        assert_eq!(best.unwrap().region_name, "pf");

        let best = select_region(&regions, &probe, &selection(ProbeFailurePolicy::Abort))
            .await
            .unwrap();
        assert_eq!(best.unwrap().region_name, "no-pf");
    }

    #[tokio::test]
    async fn tcp_probe_times_local_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe {
            port,
            timeout: Some(Duration::from_secs(5)),
        };

        let time = probe.probe("127.0.0.1").await.unwrap();
        assert!(time < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn tcp_probe_reports_refused_connection() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = TcpProbe {
            port,
            timeout: Some(Duration::from_secs(5)),
        };
        let err = probe.probe("127.0.0.1").await.unwrap_err();
        assert!(matches!(err, PiaError::Probe { .. }));
    }
}
