//! Directory subsystem
//!
//! [`Directory`] keeps an immutable [`DirectoryIndex`] of the routers that
//! are both listed in the current consensus and backed by a matching
//! server descriptor. A refresh cycle walks through authority
//! certificates, the consensus and missing descriptors, then swaps a new
//! index in and writes everything to the string store.

pub mod authority;
pub mod consensus;
pub mod descriptor;
pub mod document;
pub mod exit_policy;
pub mod fetcher;
pub mod fingerprint;
pub mod http;
pub mod router;

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::SystemTime;

use base64::Engine;
use rand::Rng;
use tokio::sync::{watch, Mutex as AsyncMutex};

use self::authority::{AuthorityKeyCertificates, DIRECTORY_AUTHORITIES};
use self::consensus::DirectoryConsensus;
use self::fetcher::{descriptor_paths, DirectoryFetcher, ALL_DESCRIPTORS_PATH, AUTHORITY_KEYS_PATH, CONSENSUS_PATH};
use self::fingerprint::Fingerprint;
use self::router::{unix_seconds, Router, RouterFlags, UNKNOWN_COUNTRY};
use crate::config::TorConfig;
use crate::error::{Result, TorError};
use crate::network::NetLayer;
use crate::storage::{StringStorage, AUTHORITY_CERTS_KEY, CONSENSUS_KEY, ROUTER_DESCRIPTORS_KEY};

/// Non-authority caches needed before authorities are spared
pub const MIN_NUM_OF_CACHE_DIRS: usize = 5;

/// HSDirs responsible for one descriptor id
pub const HS_DIRS_PER_DESCRIPTOR: usize = 3;

/// Certificates are refetched when one expires within this many seconds
const CERTIFICATE_MIN_REMAINING: u64 = 24 * 3600;

/// Maps an address to a two-letter country code
pub type CountryLookup = Arc<dyn Fn(IpAddr) -> Option<String> + Send + Sync>;

/// What a running refresh is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStage {
    Idle,
    Certificates,
    Consensus,
    Descriptors,
}

/// Snapshot of the usable routers
#[derive(Default)]
pub struct DirectoryIndex {
    consensus: Option<Arc<DirectoryConsensus>>,
    routers: HashMap<Fingerprint, Arc<Router>>,
    by_class_c: HashMap<String, Vec<Fingerprint>>,
    by_country: HashMap<String, Vec<Fingerprint>>,
    /// Sorted by fingerprint
    hs_dirs: Vec<Arc<Router>>,
}

impl DirectoryIndex {
    /// Merge `descriptors` with `consensus`
    ///
    /// A router is kept when one of the descriptors has not expired and is
    /// either the one the consensus lists or, while that one is missing,
    /// the newest earlier descriptor of the same router. Routers already
    /// in `previous` with the same descriptor keep their ranking.
    pub fn build(
        consensus: Arc<DirectoryConsensus>,
        descriptors: &HashMap<[u8; 20], Router>,
        previous: &DirectoryIndex,
        lookup: Option<&CountryLookup>,
        now: u64,
    ) -> Self {
        let mut newest: HashMap<Fingerprint, &Router> = HashMap::new();
        for descriptor in descriptors.values().filter(|d| d.valid_until > now) {
            let slot = newest.entry(descriptor.fingerprint).or_insert(descriptor);
            if descriptor.published > slot.published {
                *slot = descriptor;
            }
        }

        let mut routers = HashMap::with_capacity(consensus.routers.len());
        for status in consensus.routers.values() {
            let descriptor = match descriptors.get(&status.descriptor_digest) {
                Some(d) if d.fingerprint == status.fingerprint && d.valid_until > now => d,
                Some(_) => continue,
                None => match newest.get(&status.fingerprint) {
                    Some(d) => *d,
                    None => continue,
                },
            };
            let base = previous
                .routers
                .get(&status.fingerprint)
                .filter(|r| r.descriptor_digest == descriptor.descriptor_digest)
                .map(|r| r.as_ref())
                .unwrap_or(descriptor);
            let mut router = base.with_status(status);
            if let Some(lookup) = lookup {
                let country = (lookup.as_ref())(router.address).unwrap_or_else(|| UNKNOWN_COUNTRY.to_string());
                router = router.with_country(&country);
            }
            routers.insert(status.fingerprint, Arc::new(router));
        }
        Self::from_routers(Some(consensus), routers)
    }

    pub fn from_routers(
        consensus: Option<Arc<DirectoryConsensus>>,
        routers: HashMap<Fingerprint, Arc<Router>>,
    ) -> Self {
        let mut by_class_c: HashMap<String, Vec<Fingerprint>> = HashMap::new();
        let mut by_country: HashMap<String, Vec<Fingerprint>> = HashMap::new();
        for router in routers.values() {
            by_class_c
                .entry(router.class_c_network())
                .or_default()
                .push(router.fingerprint);
            if router.country_code != UNKNOWN_COUNTRY {
                by_country
                    .entry(router.country_code.clone())
                    .or_default()
                    .push(router.fingerprint);
            }
        }
        let mut hs_dirs: Vec<Arc<Router>> = routers
            .values()
            .filter(|r| r.flags.hs_dir && r.dir_port != 0)
            .cloned()
            .collect();
        hs_dirs.sort_by_key(|r| r.fingerprint);

        Self {
            consensus,
            routers,
            by_class_c,
            by_country,
            hs_dirs,
        }
    }

    pub fn consensus(&self) -> Option<&Arc<DirectoryConsensus>> {
        self.consensus.as_ref()
    }

    /// Number of valid routers
    pub fn len(&self) -> usize {
        self.routers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routers.is_empty()
    }

    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&Arc<Router>> {
        self.routers.get(fingerprint)
    }

    pub fn routers(&self) -> impl Iterator<Item = &Arc<Router>> {
        self.routers.values()
    }

    /// Routers the consensus marks Running, with or without descriptor
    pub fn running_count(&self) -> usize {
        self.consensus.as_ref().map_or(0, |c| c.running_count())
    }

    pub fn valid_routers_by_flags(&self, required: &RouterFlags) -> Vec<Arc<Router>> {
        self.routers
            .values()
            .filter(|r| r.flags.contains(required))
            .cloned()
            .collect()
    }

    pub fn valid_router_by_address(&self, address: SocketAddr) -> Option<Arc<Router>> {
        self.routers
            .values()
            .find(|r| r.or_address() == address || r.dir_address() == Some(address))
            .cloned()
    }

    /// Declared family members, plus routers declaring `router` as family
    pub fn family_of(&self, router: &Router) -> HashSet<Fingerprint> {
        let mut family: HashSet<Fingerprint> = router.family.clone();
        family.extend(
            self.routers
                .values()
                .filter(|other| other.family.contains(&router.fingerprint))
                .map(|other| other.fingerprint),
        );
        family.remove(&router.fingerprint);
        family
    }

    /// Add `router` and everything that must not share a route with it
    ///
    /// Family is always added; /24 and country neighbours only when asked.
    pub fn exclude_related_nodes(
        &self,
        router: &Router,
        unique_class_c: bool,
        unique_country: bool,
        excluded: &mut HashSet<Fingerprint>,
    ) {
        excluded.insert(router.fingerprint);
        excluded.extend(self.family_of(router));
        if unique_class_c {
            if let Some(neighbours) = self.by_class_c.get(&router.class_c_network()) {
                excluded.extend(neighbours.iter().copied());
            }
        }
        if unique_country && router.country_code != UNKNOWN_COUNTRY {
            if let Some(neighbours) = self.by_country.get(&router.country_code) {
                excluded.extend(neighbours.iter().copied());
            }
        }
    }

    /// The HSDirs storing `descriptor_id`
    ///
    /// The first HSDir whose fingerprint is not below the id, and the
    /// ones after it, wrapping around the ring.
    pub fn responsible_hs_dirs(&self, descriptor_id: &[u8; 20]) -> Vec<Arc<Router>> {
        let len = self.hs_dirs.len();
        if len == 0 {
            return Vec::new();
        }
        let start = self
            .hs_dirs
            .iter()
            .position(|r| r.fingerprint.as_bytes() >= descriptor_id)
            .unwrap_or(0);
        (0..HS_DIRS_PER_DESCRIPTOR.min(len))
            .map(|i| self.hs_dirs[(start + i) % len].clone())
            .collect()
    }

    /// Directory servers to download from
    ///
    /// Non-authority caches when there are enough of them, caches plus
    /// authorities when those together are enough, otherwise the
    /// built-in authority list.
    pub fn directory_candidates(&self) -> Vec<SocketAddr> {
        let mut caches = Vec::new();
        let mut authorities = Vec::new();
        for router in self.routers.values().filter(|r| r.is_running()) {
            match router.dir_address() {
                Some(addr) if router.flags.authority => authorities.push(addr),
                Some(addr) if router.is_dir_server() => caches.push(addr),
                _ => {}
            }
        }
        if caches.len() >= MIN_NUM_OF_CACHE_DIRS {
            return caches;
        }
        if caches.len() + authorities.len() >= MIN_NUM_OF_CACHE_DIRS {
            caches.extend(authorities);
            return caches;
        }
        fallback_authorities()
    }
}

/// Drop descriptors the consensus no longer needs
///
/// A router's older descriptor stays until the listed one is known, as
/// long as it has not expired.
fn prune_descriptors(known: &mut HashMap<[u8; 20], Router>, consensus: &DirectoryConsensus, now: u64) {
    let replaced: HashSet<Fingerprint> = consensus
        .routers
        .values()
        .filter(|s| known.contains_key(&s.descriptor_digest))
        .map(|s| s.fingerprint)
        .collect();
    known.retain(|digest, router| match consensus.routers.get(&router.fingerprint) {
        Some(status) if status.descriptor_digest == *digest => true,
        Some(_) => !replaced.contains(&router.fingerprint) && router.valid_until > now,
        None => false,
    });
}

fn fallback_authorities() -> Vec<SocketAddr> {
    DIRECTORY_AUTHORITIES.iter().map(|a| a.dir_address()).collect()
}

/// Valid routers needed before the directory counts as ready
///
/// The directory is ready once it has strictly more than this.
pub fn readiness_floor(config: &TorConfig, running: usize) -> usize {
    let by_percentage = (config.min_descriptors_percentage * running as f64).round() as usize;
    by_percentage
        .max(config.min_descriptors)
        .max(config.route_min_length)
}

pub struct Directory {
    config: Arc<TorConfig>,
    storage: Arc<dyn StringStorage>,
    fetcher: DirectoryFetcher,
    country_lookup: Option<CountryLookup>,
    index: RwLock<Arc<DirectoryIndex>>,
    /// Parsed descriptors by digest
    descriptors: Mutex<HashMap<[u8; 20], Router>>,
    certificates: Mutex<AuthorityKeyCertificates>,
    refresh_lock: AsyncMutex<()>,
    cold_start: AtomicBool,
    ready: watch::Sender<bool>,
    stage: watch::Sender<RefreshStage>,
}

impl Directory {
    pub fn new(
        config: Arc<TorConfig>,
        storage: Arc<dyn StringStorage>,
        layer: Arc<dyn NetLayer>,
    ) -> Self {
        Self {
            fetcher: DirectoryFetcher::new(layer, &config),
            config,
            storage,
            country_lookup: None,
            index: RwLock::new(Arc::new(DirectoryIndex::default())),
            descriptors: Mutex::new(HashMap::new()),
            certificates: Mutex::new(AuthorityKeyCertificates::default()),
            refresh_lock: AsyncMutex::new(()),
            cold_start: AtomicBool::new(true),
            ready: watch::channel(false).0,
            stage: watch::channel(RefreshStage::Idle).0,
        }
    }

    pub fn with_country_lookup(mut self, lookup: CountryLookup) -> Self {
        self.country_lookup = Some(lookup);
        self
    }

    /// Current snapshot; never partially updated
    pub fn index(&self) -> Arc<DirectoryIndex> {
        self.index
            .read()
            .map(|index| index.clone())
            .unwrap_or_default()
    }

    pub fn is_directory_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn subscribe_ready(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    pub fn subscribe_stage(&self) -> watch::Receiver<RefreshStage> {
        self.stage.subscribe()
    }

    pub async fn wait_until_ready(&self) {
        let mut ready = self.ready.subscribe();
        let _ = ready.wait_for(|r| *r).await;
    }

    /// Lower the ranking of a router that failed us
    pub fn punish(&self, fingerprint: &Fingerprint) {
        if let Some(router) = self.index().get(fingerprint) {
            router.punish_ranking();
        }
    }

    /// Run one refresh cycle
    ///
    /// Returns `AlreadyInProgress` without touching the network while
    /// another refresh runs.
    pub async fn refresh(&self) -> Result<()> {
        let _guard = self
            .refresh_lock
            .try_lock()
            .map_err(|_| TorError::AlreadyInProgress("directory refresh".into()))?;
        let now = unix_seconds(SystemTime::now());
        let cold = self.cold_start.swap(false, Ordering::SeqCst);
        if cold {
            self.load_cached_descriptors().await;
        }

        if self.config.verify_consensus_signatures {
            self.stage.send_replace(RefreshStage::Certificates);
            self.refresh_certificates(cold, now).await;
        }
        self.stage.send_replace(RefreshStage::Consensus);
        let result = self.refresh_documents(cold, now).await;
        self.stage.send_replace(RefreshStage::Idle);
        result
    }

    async fn refresh_documents(&self, cold: bool, now: u64) -> Result<()> {
        let (consensus, consensus_changed) = self.refresh_consensus(cold, now).await?;
        self.stage.send_replace(RefreshStage::Descriptors);
        let added = self.refresh_descriptors(&consensus, now).await;

        let was_ready = self.is_directory_ready();
        let index = self.install_index(consensus, now);
        let ready = self.is_directory_ready();
        log::info!(
            "directory: {} valid routers ({} running in consensus, {} new descriptors), ready: {}",
            index.len(),
            index.running_count(),
            added,
            ready
        );
        if was_ready && !ready {
            log::warn!("directory fell below the readiness floor; keeping the cached copy");
        } else if consensus_changed || added > 0 {
            self.persist(&index, consensus_changed).await;
        }
        Ok(())
    }

    async fn refresh_certificates(&self, cold: bool, now: u64) {
        if cold {
            match self.storage.get(AUTHORITY_CERTS_KEY).await {
                Ok(Some(text)) => {
                    let certs = AuthorityKeyCertificates::parse(&text);
                    log::debug!("loaded {} cached authority certificates", certs.len());
                    self.set_certificates(certs);
                }
                Ok(None) => {}
                Err(e) => log::warn!("reading cached authority certificates: {}", e),
            }
        }
        let current_valid = self
            .certificates
            .lock()
            .map(|c| c.is_valid(now, now + CERTIFICATE_MIN_REMAINING))
            .unwrap_or(false);
        if current_valid {
            return;
        }

        let fetched = self
            .fetch_from(fallback_authorities(), AUTHORITY_KEYS_PATH, |text| {
                let certs = AuthorityKeyCertificates::parse(&text);
                if certs.is_empty() {
                    Err(TorError::Directory("no usable authority certificates".into()))
                } else {
                    Ok((certs, text))
                }
            })
            .await;
        match fetched {
            Ok((certs, text)) => {
                log::info!("fetched {} authority key certificates", certs.len());
                self.set_certificates(certs);
                if let Err(e) = self.storage.put(AUTHORITY_CERTS_KEY, &text).await {
                    log::warn!("caching authority certificates: {}", e);
                }
            }
            Err(e) => log::warn!("authority certificates unavailable: {}", e),
        }
    }

    fn set_certificates(&self, certs: AuthorityKeyCertificates) {
        if let Ok(mut slot) = self.certificates.lock() {
            *slot = certs;
        }
    }

    /// The consensus to use, and whether it differs from the current one
    async fn refresh_consensus(&self, cold: bool, now: u64) -> Result<(Arc<DirectoryConsensus>, bool)> {
        let current = self.index().consensus().cloned();
        if let Some(consensus) = &current {
            if !consensus.needs_to_be_refreshed(now) {
                return Ok((consensus.clone(), false));
            }
        }
        let mut fallback = current.filter(|c| c.is_valid_at(now)).map(|c| (c, false));

        if cold {
            if let Some(cached) = self.load_cached_consensus(now).await {
                if !cached.needs_to_be_refreshed(now) {
                    log::info!("using cached consensus ({} routers)", cached.routers.len());
                    return Ok((cached, true));
                }
                fallback = Some((cached, true));
            }
        }

        let candidates = self.index().directory_candidates();
        match self
            .fetch_from(candidates, CONSENSUS_PATH, |text| self.accept_consensus(&text, now))
            .await
        {
            Ok(consensus) => {
                log::info!("fetched consensus with {} routers", consensus.routers.len());
                Ok((Arc::new(consensus), true))
            }
            Err(e) => match fallback {
                Some(kept) => {
                    log::warn!("consensus download failed ({}); keeping the previous one", e);
                    Ok(kept)
                }
                None => Err(e),
            },
        }
    }

    fn accept_consensus(&self, text: &str, now: u64) -> Result<DirectoryConsensus> {
        let consensus = DirectoryConsensus::parse(text)?;
        if !consensus.is_valid_at(now) {
            return Err(TorError::ConsensusStale);
        }
        if self.config.verify_consensus_signatures {
            let certs = self
                .certificates
                .lock()
                .map_err(|_| TorError::Internal("certificate store poisoned".into()))?;
            consensus.verify_signatures(&certs, now)?;
        }
        Ok(consensus)
    }

    async fn load_cached_consensus(&self, now: u64) -> Option<Arc<DirectoryConsensus>> {
        let text = match self.storage.get(CONSENSUS_KEY).await {
            Ok(text) => text?,
            Err(e) => {
                log::warn!("reading cached consensus: {}", e);
                return None;
            }
        };
        match self.accept_consensus(&text, now) {
            Ok(consensus) => Some(Arc::new(consensus)),
            Err(e) => {
                log::debug!("cached consensus rejected: {}", e);
                None
            }
        }
    }

    /// Download descriptors the consensus lists but we lack
    ///
    /// Returns how many were added.
    async fn refresh_descriptors(&self, consensus: &DirectoryConsensus, now: u64) -> usize {
        let listed: HashSet<[u8; 20]> = consensus
            .routers
            .values()
            .map(|s| s.descriptor_digest)
            .collect();
        let missing: Vec<[u8; 20]> = match self.descriptors.lock() {
            Ok(mut known) => {
                prune_descriptors(&mut known, consensus, now);
                listed
                    .iter()
                    .filter(|d| !known.contains_key(*d))
                    .copied()
                    .collect()
            }
            Err(_) => return 0,
        };
        if missing.is_empty() {
            return 0;
        }

        let paths = if missing.len() * 2 > listed.len() {
            vec![ALL_DESCRIPTORS_PATH.to_string()]
        } else {
            descriptor_paths(&missing)
        };
        log::debug!(
            "fetching {} missing descriptors in {} request(s)",
            missing.len(),
            paths.len()
        );

        let candidates = self.index().directory_candidates();
        let mut added = 0;
        for path in paths {
            let text = match self.fetch_from(candidates.clone(), &path, Ok).await {
                Ok(text) => text,
                Err(e) => {
                    log::warn!("descriptor download failed: {}", e);
                    continue;
                }
            };
            let routers =
                descriptor::parse_descriptors(&text, self.config.descriptor_parse_workers).await;
            if let Ok(mut known) = self.descriptors.lock() {
                for router in routers {
                    if listed.contains(&router.descriptor_digest)
                        && known.insert(router.descriptor_digest, router).is_none()
                    {
                        added += 1;
                    }
                }
                prune_descriptors(&mut known, consensus, now);
            }
        }
        added
    }

    /// Try random servers from `candidates`, dropping each one that fails
    async fn fetch_from<T, F>(&self, mut candidates: Vec<SocketAddr>, path: &str, mut accept: F) -> Result<T>
    where
        F: FnMut(String) -> Result<T> + Send,
    {
        let mut last_error = None;
        for _ in 0..self.config.directory_fetch_attempts {
            if candidates.is_empty() {
                break;
            }
            let pick = rand::thread_rng().gen_range(0..candidates.len());
            let server = candidates.swap_remove(pick);
            match self.fetcher.fetch_text(server, path).await.and_then(&mut accept) {
                Ok(value) => return Ok(value),
                Err(e) => {
                    log::debug!("{} from {} failed: {}", path, server, e);
                    last_error = Some(e);
                }
            }
        }
        log::warn!("directory servers exhausted for {}", path);
        Err(last_error.unwrap_or_else(|| TorError::Directory(format!("no directory server for {}", path))))
    }

    fn install_index(&self, consensus: Arc<DirectoryConsensus>, now: u64) -> Arc<DirectoryIndex> {
        let previous = self.index();
        let index = match self.descriptors.lock() {
            Ok(known) => DirectoryIndex::build(
                consensus,
                &known,
                &previous,
                self.country_lookup.as_ref(),
                now,
            ),
            Err(_) => return previous,
        };
        let index = Arc::new(index);
        if let Ok(mut slot) = self.index.write() {
            *slot = index.clone();
        }

        let ready = index.len() > readiness_floor(&self.config, index.running_count());
        self.ready.send_if_modified(|current| {
            let changed = *current != ready;
            *current = ready;
            changed
        });
        index
    }

    async fn load_cached_descriptors(&self) {
        let text = match self.storage.get(ROUTER_DESCRIPTORS_KEY).await {
            Ok(Some(text)) => text,
            Ok(None) => return,
            Err(e) => {
                log::warn!("reading cached descriptors: {}", e);
                return;
            }
        };
        let routers = base64::engine::general_purpose::STANDARD
            .decode(text.trim())
            .map_err(|e| TorError::Storage(format!("router cache is not base64: {}", e)))
            .and_then(|dump| router::load_all(&dump));
        match routers {
            Ok(routers) => {
                log::debug!("loaded {} cached router descriptors", routers.len());
                if let Ok(mut known) = self.descriptors.lock() {
                    for router in routers {
                        known.insert(router.descriptor_digest, router);
                    }
                }
            }
            Err(e) => log::warn!("discarding router cache: {}", e),
        }
    }

    async fn persist(&self, index: &DirectoryIndex, consensus_changed: bool) {
        if consensus_changed {
            if let Some(consensus) = index.consensus() {
                if let Err(e) = self.storage.put(CONSENSUS_KEY, &consensus.text).await {
                    log::warn!("caching consensus: {}", e);
                }
            }
        }
        let dump = match router::save_all(index.routers().map(|r| r.as_ref())) {
            Ok(dump) => base64::engine::general_purpose::STANDARD.encode(dump),
            Err(e) => {
                log::warn!("encoding router cache: {}", e);
                return;
            }
        };
        if let Err(e) = self.storage.put(ROUTER_DESCRIPTORS_KEY, &dump).await {
            log::warn!("caching router descriptors: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::exit_policy::ExitPolicy;
    use crate::network::mock::MockLayer;
    use crate::storage::MemoryStringStorage;
    use crate::testing::documents::{self, ConsensusEntry};
    use crate::testing::{LoopbackNetwork, RelaySpec};
    use std::time::Duration;

    fn router(n: u8, address: &str) -> Router {
        let mut router = Router::new(
            &format!("r{}", n),
            address.parse().unwrap(),
            9001,
            Fingerprint::new([n; 20]),
        );
        router.flags = RouterFlags::from_string("Fast Running Stable Valid");
        router.exit_policy = ExitPolicy::accept_all();
        router
    }

    fn index_of(routers: Vec<Router>) -> DirectoryIndex {
        DirectoryIndex::from_routers(
            None,
            routers
                .into_iter()
                .map(|r| (r.fingerprint, Arc::new(r)))
                .collect(),
        )
    }

    #[test]
    fn test_readiness_floor() {
        let mut config = TorConfig::default();
        config.min_descriptors = 10;
        config.min_descriptors_percentage = 0.1;
        config.route_min_length = 3;
        assert_eq!(readiness_floor(&config, 50), 10);
        assert_eq!(readiness_floor(&config, 5000), 500);
        config.min_descriptors = 0;
        assert_eq!(readiness_floor(&config, 10), 3);
        assert_eq!(readiness_floor(&config, 44), 4);
    }

    #[test]
    fn test_hs_dir_ring_wraps() {
        let routers = [0x10u8, 0x40, 0x80, 0xc0]
            .iter()
            .map(|&n| {
                let mut r = router(n, &format!("10.{}.0.1", n));
                r.flags.hs_dir = true;
                r.dir_port = 9030;
                r
            })
            .chain(std::iter::once({
                // HSDir without a dir port is not part of the ring
                let mut r = router(0x50, "10.80.0.1");
                r.flags.hs_dir = true;
                r
            }))
            .collect();
        let index = index_of(routers);

        let fps = |id: [u8; 20]| -> Vec<u8> {
            index
                .responsible_hs_dirs(&id)
                .iter()
                .map(|r| r.fingerprint.as_bytes()[0])
                .collect()
        };
        assert_eq!(fps([0x40; 20]), vec![0x40, 0x80, 0xc0]);
        assert_eq!(fps([0x41; 20]), vec![0x80, 0xc0, 0x10]);
        assert_eq!(fps([0xf0; 20]), vec![0x10, 0x40, 0x80]);
        assert!(index_of(Vec::new()).responsible_hs_dirs(&[0; 20]).is_empty());
    }

    #[test]
    fn test_exclude_related_nodes() {
        let mut a = router(1, "10.0.0.1");
        a.country_code = "DE".into();
        let mut same_net = router(2, "10.0.0.2");
        same_net.country_code = "FR".into();
        let mut same_country = router(3, "10.9.0.1");
        same_country.country_code = "DE".into();
        let mut declares_a = router(4, "10.8.0.1");
        declares_a.family.insert(a.fingerprint);
        let unrelated = router(5, "10.7.0.1");
        let index = index_of(vec![a.clone(), same_net, same_country, declares_a, unrelated]);

        let mut excluded = HashSet::new();
        index.exclude_related_nodes(&a, false, false, &mut excluded);
        assert_eq!(
            excluded,
            [1u8, 4].iter().map(|&n| Fingerprint::new([n; 20])).collect()
        );

        let mut excluded = HashSet::new();
        index.exclude_related_nodes(&a, true, true, &mut excluded);
        assert_eq!(excluded.len(), 4);
        assert!(!excluded.contains(&Fingerprint::new([5; 20])));
    }

    #[test]
    fn test_directory_candidates() {
        let authority = |n: u8| {
            let mut r = router(n, &format!("10.{}.0.1", n));
            r.flags.authority = true;
            r.dir_port = 80;
            r
        };
        let cache = |n: u8| {
            let mut r = router(n, &format!("10.{}.0.1", n));
            r.flags.v2_dir = true;
            r.dir_port = 9030;
            r
        };

        let few = index_of(vec![cache(1), authority(2)]);
        assert_eq!(few.directory_candidates(), fallback_authorities());

        let mixed = index_of(vec![cache(1), cache(2), cache(3), authority(4), authority(5)]);
        assert_eq!(mixed.directory_candidates().len(), 5);

        let plenty = index_of((1..=6).map(cache).chain(std::iter::once(authority(9))).collect());
        let candidates = plenty.directory_candidates();
        assert_eq!(candidates.len(), 6);
        assert!(!candidates.contains(&"10.9.0.1:80".parse().unwrap()));
    }

    #[test]
    fn test_router_by_address_and_flags() {
        let mut exit = router(7, "10.0.7.1");
        exit.flags.exit = true;
        let index = index_of(vec![exit, router(8, "10.0.8.1")]);
        let found = index.valid_router_by_address("10.0.7.1:9001".parse().unwrap()).unwrap();
        assert_eq!(found.nickname, "r7");
        assert!(index.valid_router_by_address("10.0.7.1:1".parse().unwrap()).is_none());

        let exits = index.valid_routers_by_flags(&RouterFlags::from_string("Exit Running"));
        assert_eq!(exits.len(), 1);
        assert_eq!(index.valid_routers_by_flags(&RouterFlags::default()).len(), 2);
    }

    #[tokio::test]
    async fn test_exhausted_refresh_keeps_nothing_and_reports() {
        let mut config = TorConfig::default();
        config.verify_consensus_signatures = false;
        config.directory_fetch_attempts = 3;
        let mock = Arc::new(MockLayer::new());
        let directory = Directory::new(
            Arc::new(config),
            Arc::new(MemoryStringStorage::new()),
            mock.clone(),
        );
        assert!(directory.refresh().await.is_err());
        assert_eq!(mock.connection_count(), 3);
        assert!(directory.index().consensus().is_none());
        assert!(!directory.is_directory_ready());
    }

    #[test]
    fn test_superseded_descriptor_serves_until_replaced() {
        const OLD: [u8; 20] = [0xaa; 20];
        const NEW: [u8; 20] = [0xbb; 20];
        let now = unix_seconds(SystemTime::now());
        let spec = RelaySpec::new("r1", "10.0.0.1".parse().unwrap());
        let fingerprint = Fingerprint::new([1; 20]);
        let listing = |digest: [u8; 20]| {
            let entry = ConsensusEntry {
                spec: &spec,
                fingerprint,
                descriptor_digest: digest,
                published: now - 60,
            };
            Arc::new(DirectoryConsensus::parse(&documents::consensus(&[entry], now - 600)).unwrap())
        };
        let mut old = router(1, "10.0.0.1");
        old.descriptor_digest = OLD;
        old.published = now - 3600;
        old.valid_until = now + 3600;

        // The consensus moved on but the new descriptor is not here yet
        let consensus = listing(NEW);
        let mut known = HashMap::from([(old.descriptor_digest, old.clone())]);
        prune_descriptors(&mut known, &consensus, now);
        assert!(known.contains_key(&OLD));
        let index = DirectoryIndex::build(consensus.clone(), &known, &DirectoryIndex::default(), None, now);
        assert_eq!(index.get(&fingerprint).unwrap().descriptor_digest, OLD);

        let mut new = old.clone();
        new.descriptor_digest = NEW;
        new.published = now - 60;
        known.insert(new.descriptor_digest, new);
        prune_descriptors(&mut known, &consensus, now);
        assert_eq!(known.len(), 1);
        assert!(known.contains_key(&NEW));
        let index = DirectoryIndex::build(consensus.clone(), &known, &index, None, now);
        assert_eq!(index.get(&fingerprint).unwrap().descriptor_digest, NEW);

        // An expired stand-in is not kept
        old.valid_until = now - 1;
        let mut known = HashMap::from([(old.descriptor_digest, old)]);
        prune_descriptors(&mut known, &consensus, now);
        assert!(known.is_empty());
        let index = DirectoryIndex::build(consensus, &known, &DirectoryIndex::default(), None, now);
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn test_ready_only_above_min_descriptors() {
        let network = LoopbackNetwork::new();
        network.add_standard_relays(5, 5).unwrap();
        network.serve_authorities();
        // Stale consensus so every refresh downloads it again
        network.set_consensus_age(Duration::from_secs(3700));

        let mut config = TorConfig::default();
        config.verify_consensus_signatures = false;
        config.min_descriptors = 10;
        config.min_descriptors_percentage = 0.0;
        let directory = Directory::new(
            Arc::new(config),
            Arc::new(MemoryStringStorage::new()),
            network.layer(),
        );
        directory.refresh().await.unwrap();
        assert_eq!(directory.index().len(), 10);
        assert!(!directory.is_directory_ready());

        network
            .add_relay(RelaySpec::new("late", "10.3.0.1".parse().unwrap()))
            .unwrap();
        directory.refresh().await.unwrap();
        assert_eq!(directory.index().len(), 11);
        assert!(directory.is_directory_ready());
        assert_eq!(network.consensus_requests(), 2);
    }
}
