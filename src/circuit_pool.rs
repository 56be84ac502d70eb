//! Circuit building and pooling
//!
//! Builds circuits along routes from the path selector, keeps the exit
//! circuits around for reuse and attaches streams to them. The
//! maintenance pass keeps `min_idle_circuits` established exit circuits
//! ready so that a connect rarely waits for a build.
//!
//! - A failed build is never retried in place; the next attempt draws a fresh route
//! - The hop that failed has its ranking punished
//! - Internal circuits (directory and hidden-service) are counted but never
//!   handed out for exit streams

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use tokio::sync::watch;

use crate::config::TorConfig;
use crate::connection_pool::{ConnectionPool, ConnectionPoolStats};
use crate::directory::router::Router;
use crate::directory::Directory;
use crate::error::{Result, TorError};
use crate::network::NetAddress;
use crate::path_selection::{PathSelector, TcpStreamProperties};
use crate::protocol::circuit::{Circuit, DESTROY_REASON_PROTOCOL};
use crate::protocol::stream::TorStream;

/// Port idle exit circuits are built for
pub const PREDICTED_PORT: u16 = 443;

/// Failed stream attempts after which a circuit is no longer handed out
pub const MAX_CIRCUIT_FAILURES: u32 = 3;

/// Counts over every circuit the pool knows about
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CircuitsStatus {
    pub total: usize,
    /// Building or established
    pub alive: usize,
    pub established: usize,
    pub closed: usize,
}

/// Statistics about circuit pool usage
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CircuitPoolStats {
    pub circuits_built: u64,
    pub build_failures: u64,
    /// Streams attached to an existing circuit
    pub pool_hits: u64,
    /// Streams that needed a new circuit
    pub pool_misses: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPurpose {
    Exit,
    Internal,
}

struct PooledCircuit {
    circuit: Arc<Circuit>,
    purpose: CircuitPurpose,
}

pub struct CircuitPool {
    config: Arc<TorConfig>,
    directory: Arc<Directory>,
    connections: ConnectionPool,
    selector: PathSelector,
    circuits: Mutex<Vec<PooledCircuit>>,
    stats: Mutex<CircuitPoolStats>,
    /// Established exit circuits without streams
    idle: watch::Sender<usize>,
}

impl CircuitPool {
    pub fn new(config: Arc<TorConfig>, directory: Arc<Directory>, connections: ConnectionPool) -> Self {
        Self {
            selector: PathSelector::new(config.clone()),
            config,
            directory,
            connections,
            circuits: Mutex::new(Vec::new()),
            stats: Mutex::new(CircuitPoolStats::default()),
            idle: watch::channel(0).0,
        }
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    fn record(&self, update: impl FnOnce(&mut CircuitPoolStats)) {
        if let Ok(mut stats) = self.stats.lock() {
            update(&mut stats);
        }
    }

    fn snapshot(&self, purpose: Option<CircuitPurpose>) -> Vec<Arc<Circuit>> {
        self.circuits
            .lock()
            .map(|circuits| {
                circuits
                    .iter()
                    .filter(|c| purpose.map_or(true, |p| c.purpose == p))
                    .map(|c| c.circuit.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Build a circuit for `properties` and keep track of it
    pub async fn build_circuit(
        &self,
        properties: &TcpStreamProperties,
        purpose: CircuitPurpose,
    ) -> Result<Arc<Circuit>> {
        let route = self.selector.select_route(&self.directory.index(), properties)?;
        let built = tokio::time::timeout(self.config.circuit_build_timeout, self.build_route(&route))
            .await
            .map_err(|_| {
                TorError::Timeout(format!("building a {}-hop circuit", route.len()))
            })
            .and_then(|r| r);

        let circuit = match built {
            Ok(circuit) => circuit,
            Err(e) => {
                self.record(|s| s.build_failures += 1);
                log::debug!("circuit build failed: {}", e);
                return Err(e);
            }
        };
        self.record(|s| s.circuits_built += 1);
        if let Ok(mut circuits) = self.circuits.lock() {
            circuits.push(PooledCircuit {
                circuit: circuit.clone(),
                purpose,
            });
        }
        self.publish_idle();
        log::info!(
            "circuit {:#010x} established: {}",
            circuit.id(),
            route.iter().map(|r| r.nickname.as_str()).collect::<Vec<_>>().join(" -> ")
        );
        Ok(circuit)
    }

    async fn build_route(&self, route: &[Arc<Router>]) -> Result<Arc<Circuit>> {
        let first = route
            .first()
            .ok_or_else(|| TorError::NoRelaysAvailable("empty route".into()))?;
        let created = tokio::time::timeout(self.config.circuit_connect_timeout, async {
            let channel = self.connections.get_channel(first).await?;
            Circuit::create(channel, first).await
        })
        .await
        .map_err(|_| TorError::Timeout(format!("creating circuit at {}", first.nickname)))
        .and_then(|r| r);
        let circuit = match created {
            Ok(circuit) => circuit,
            Err(e) => {
                self.directory.punish(&first.fingerprint);
                return Err(e);
            }
        };

        for router in &route[1..] {
            if let Err(e) = circuit.extend(router).await {
                log::debug!("extending circuit {:#010x} to {}: {}", circuit.id(), router.nickname, e);
                self.directory.punish(&router.fingerprint);
                circuit.destroy(DESTROY_REASON_PROTOCOL);
                return Err(e);
            }
        }
        circuit.mark_established();
        Ok(circuit)
    }

    /// Established exit circuits that can take a stream to `properties`
    ///
    /// Least loaded first.
    fn usable_circuits(&self, properties: &TcpStreamProperties) -> Vec<Arc<Circuit>> {
        let mut usable: Vec<Arc<Circuit>> = self
            .snapshot(Some(CircuitPurpose::Exit))
            .into_iter()
            .filter(|c| c.is_established() && !c.is_closed())
            .filter(|c| c.failures() < MAX_CIRCUIT_FAILURES)
            .filter(|c| c.stream_count() < self.config.max_streams_per_circuit)
            .filter(|c| c.exit_router().map_or(false, |exit| properties.exit_accepts(&exit)))
            .collect();
        usable.sort_by_key(|c| (c.stream_count(), c.failures()));
        usable
    }

    /// An established exit circuit, pooled when there is one
    pub async fn exit_circuit(&self) -> Result<Arc<Circuit>> {
        let properties = TcpStreamProperties::for_port(PREDICTED_PORT, &self.config);
        if let Some(circuit) = self.usable_circuits(&properties).into_iter().next() {
            self.record(|s| s.pool_hits += 1);
            return Ok(circuit);
        }
        self.record(|s| s.pool_misses += 1);
        self.build_circuit(&properties, CircuitPurpose::Exit).await
    }

    /// Open a stream to `target` through an exit circuit
    ///
    /// Each attempt uses pooled circuits when there are any and builds one
    /// otherwise. Gives up after `connect_max_retries` attempts.
    pub async fn open_stream(&self, target: &NetAddress) -> Result<TorStream> {
        let properties = TcpStreamProperties::for_target(target, &self.config);
        let fanout = if self.config.aggressive_stream_building {
            self.config.aggressive_stream_fanout.max(1)
        } else {
            1
        };

        let mut attempts = 0;
        let mut last_error: Option<TorError> = None;
        while attempts < self.config.connect_max_retries {
            attempts += 1;
            let mut candidates = self.usable_circuits(&properties);
            candidates.truncate(fanout);
            if candidates.is_empty() {
                self.record(|s| s.pool_misses += 1);
                match self.build_circuit(&properties, CircuitPurpose::Exit).await {
                    Ok(circuit) => candidates.push(circuit),
                    Err(e) => {
                        last_error = Some(e);
                        continue;
                    }
                }
            } else {
                self.record(|s| s.pool_hits += 1);
            }

            match self.begin_on_any(candidates, target).await {
                Ok(stream) => {
                    self.publish_idle();
                    return Ok(stream);
                }
                Err(e) => {
                    log::debug!("attempt {} to reach {}: {}", attempts, target, e);
                    last_error = Some(e);
                }
            }
        }
        Err(TorError::ConnectFailed {
            attempts,
            last_error: last_error.map_or_else(|| "no attempt made".to_string(), |e| e.to_string()),
        })
    }

    /// BEGIN on every candidate at once; the first CONNECTED wins
    ///
    /// Dropping the opens still pending sends END for their streams.
    async fn begin_on_any(&self, candidates: Vec<Arc<Circuit>>, target: &NetAddress) -> Result<TorStream> {
        let connect_timeout = self.config.stream_connect_timeout;
        let send_timeout = self.config.stream_send_timeout;
        let mut pending: FuturesUnordered<_> = candidates
            .into_iter()
            .map(|circuit| async move {
                let result = TorStream::open(circuit.clone(), target, connect_timeout, send_timeout).await;
                (circuit, result)
            })
            .collect();

        let mut last_error = None;
        while let Some((circuit, result)) = pending.next().await {
            match result {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    self.stream_failed(&circuit, &e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| TorError::Internal("no candidate circuits".into())))
    }

    /// Record a failed stream; circuits that keep failing are dropped
    pub(crate) fn stream_failed(&self, circuit: &Circuit, error: &TorError) {
        let failures = circuit.record_failure();
        match error {
            TorError::StreamRefused { .. } if failures < MAX_CIRCUIT_FAILURES => {}
            _ => {
                log::debug!("dropping circuit {:#010x} after: {}", circuit.id(), error);
                circuit.close();
            }
        }
    }

    /// One maintenance pass
    ///
    /// Forgets closed circuits, expires idle relay links and tops the idle
    /// exit circuits up to `min_idle_circuits`.
    pub async fn maintain(&self) {
        if let Ok(mut circuits) = self.circuits.lock() {
            circuits.retain(|c| !c.circuit.is_closed());
        }
        self.connections
            .expire_idle_connections(self.config.max_idle_connection_age);

        if !self.directory.is_directory_ready() {
            self.publish_idle();
            return;
        }
        let missing = self.config.min_idle_circuits.saturating_sub(self.idle_count());
        if missing > 0 {
            log::debug!("building {} idle circuits", missing);
            let properties = TcpStreamProperties::for_port(PREDICTED_PORT, &self.config);
            let builds = (0..missing).map(|_| self.build_circuit(&properties, CircuitPurpose::Exit));
            let results = futures::future::join_all(builds).await;
            let failed = results.iter().filter(|r| r.is_err()).count();
            if failed > 0 {
                log::warn!("{} of {} idle circuit builds failed", failed, missing);
            }
        }
        self.publish_idle();
    }

    /// Established exit circuits carrying no stream
    pub fn idle_count(&self) -> usize {
        self.snapshot(Some(CircuitPurpose::Exit))
            .iter()
            .filter(|c| c.is_idle())
            .count()
    }

    fn publish_idle(&self) {
        let idle = self.idle_count();
        self.idle.send_if_modified(|current| {
            let changed = *current != idle;
            *current = idle;
            changed
        });
    }

    /// Wait until at least `count` idle exit circuits exist
    pub async fn wait_for_idle(&self, count: usize, timeout: Duration) -> Result<()> {
        let mut idle = self.idle.subscribe();
        tokio::time::timeout(timeout, idle.wait_for(|n| *n >= count))
            .await
            .map_err(|_| TorError::ResourceExhausted(format!("fewer than {} idle circuits", count)))?
            .map_err(|_| TorError::Internal("circuit pool dropped".into()))?;
        Ok(())
    }

    pub fn status(&self) -> CircuitsStatus {
        let circuits = self.snapshot(None);
        let closed = circuits.iter().filter(|c| c.is_closed()).count();
        CircuitsStatus {
            total: circuits.len(),
            alive: circuits.len() - closed,
            established: circuits
                .iter()
                .filter(|c| c.is_established() && !c.is_closed())
                .count(),
            closed,
        }
    }

    pub fn get_stats(&self) -> CircuitPoolStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn connection_stats(&self) -> ConnectionPoolStats {
        self.connections.get_stats()
    }

    /// Close every circuit and relay link
    pub fn clear(&self) {
        let drained: Vec<PooledCircuit> = match self.circuits.lock() {
            Ok(mut circuits) => circuits.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for pooled in &drained {
            pooled.circuit.close();
        }
        self.connections.clear();
        self.publish_idle();
        log::info!("closed {} circuits", drained.len());
    }
}
