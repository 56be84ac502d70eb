//! Route selection
//!
//! Hops are drawn by weighted random choice over the valid routers, with
//! each router weighted by its refined ranking index. Every chosen hop
//! excludes its family and, when the uniqueness toggles are on, its /24
//! and country neighbours from the rest of the route.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use rand::Rng;

use crate::config::{TorConfig, MAX_ROUTE_LENGTH};
use crate::directory::fingerprint::Fingerprint;
use crate::directory::router::Router;
use crate::directory::DirectoryIndex;
use crate::error::{Result, TorError};
use crate::network::NetAddress;

/// What a route has to satisfy
#[derive(Debug, Clone)]
pub struct TcpStreamProperties {
    /// Destination address the exit must accept; `None` for hostnames
    pub exit_address: Option<IpAddr>,
    /// Destination port the exit must accept
    pub exit_port: Option<u16>,
    /// Whether the last hop must be an exit accepting the destination
    pub exit_policy_required: bool,
    pub min_route_length: usize,
    pub max_route_length: usize,
    pub fast_route: bool,
    pub stable_route: bool,
    /// Caller-chosen routers by hop position
    pub route_fingerprints: Vec<Option<Fingerprint>>,
    /// Routers that may not appear anywhere in the route
    pub excluded: HashSet<Fingerprint>,
}

impl TcpStreamProperties {
    /// Route ending at an exit that accepts `target`
    pub fn for_target(target: &NetAddress, config: &TorConfig) -> Self {
        Self {
            exit_address: target.ip(),
            ..Self::for_port(target.port(), config)
        }
    }

    /// Route ending at an exit that accepts `port` on any address
    pub fn for_port(port: u16, config: &TorConfig) -> Self {
        Self {
            exit_port: Some(port),
            exit_policy_required: true,
            ..Self::internal(config)
        }
    }

    /// Route that never leaves the Tor network (directory and
    /// hidden-service circuits)
    pub fn internal(config: &TorConfig) -> Self {
        Self {
            exit_address: None,
            exit_port: None,
            exit_policy_required: false,
            min_route_length: config.route_min_length,
            max_route_length: config.route_max_length,
            fast_route: true,
            stable_route: false,
            route_fingerprints: Vec::new(),
            excluded: HashSet::new(),
        }
    }

    pub fn with_route_length(mut self, min: usize, max: usize) -> Self {
        self.min_route_length = min;
        self.max_route_length = max;
        self
    }

    /// Put `fingerprint` at hop `position`
    pub fn pin(mut self, position: usize, fingerprint: Fingerprint) -> Self {
        if self.route_fingerprints.len() <= position {
            self.route_fingerprints.resize(position + 1, None);
        }
        self.route_fingerprints[position] = Some(fingerprint);
        self
    }

    pub fn exclude(mut self, fingerprint: Fingerprint) -> Self {
        self.excluded.insert(fingerprint);
        self
    }

    pub fn stable(mut self, stable: bool) -> Self {
        self.stable_route = stable;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_route_length == 0 || self.min_route_length > self.max_route_length {
            return Err(TorError::InvalidConfig(format!(
                "route length {}..={} is empty",
                self.min_route_length, self.max_route_length
            )));
        }
        if self.max_route_length > MAX_ROUTE_LENGTH {
            return Err(TorError::InvalidConfig(format!(
                "routes are limited to {} hops",
                MAX_ROUTE_LENGTH
            )));
        }
        if self.route_fingerprints.len() > self.max_route_length {
            return Err(TorError::InvalidConfig(format!(
                "hop {} pinned on a route of at most {} hops",
                self.route_fingerprints.len() - 1,
                self.max_route_length
            )));
        }
        if self.exit_policy_required && self.exit_port.is_none() {
            return Err(TorError::InvalidConfig("exit route without a target port".into()));
        }
        Ok(())
    }

    /// Whether `router` may carry the stream out of the network
    pub fn exit_accepts(&self, router: &Router) -> bool {
        match self.exit_port {
            Some(port) => router.is_exit() && router.exit_policy_accepts(self.exit_address, port),
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HopRole {
    Entry,
    Middle,
    Exit,
}

/// Weighted choice over `candidates`
///
/// `draw` is a number in [0, 1). The candidate whose weight takes the
/// scaled draw to zero or below is chosen.
pub fn choose_weighted(candidates: &[Arc<Router>], influence: f32, draw: f64) -> Option<Arc<Router>> {
    let weights: Vec<f64> = candidates
        .iter()
        .map(|r| f64::from(r.refined_ranking_index(influence)).max(0.0))
        .collect();
    let total: f64 = weights.iter().sum();
    if candidates.is_empty() || total <= 0.0 {
        return None;
    }
    let mut remaining = draw * total;
    for (router, weight) in candidates.iter().zip(&weights) {
        remaining -= weight;
        if remaining <= 0.0 {
            return Some(router.clone());
        }
    }
    // Float rounding can leave a sliver above zero after the last weight
    candidates.last().cloned()
}

pub struct PathSelector {
    config: Arc<TorConfig>,
}

impl PathSelector {
    pub fn new(config: Arc<TorConfig>) -> Self {
        Self { config }
    }

    /// Pick a route for `properties` from the routers in `index`
    pub fn select_route(&self, index: &DirectoryIndex, properties: &TcpStreamProperties) -> Result<Vec<Arc<Router>>> {
        properties.validate()?;
        let length = if properties.min_route_length == properties.max_route_length {
            properties.min_route_length
        } else {
            rand::thread_rng().gen_range(properties.min_route_length..=properties.max_route_length)
        }
        .max(properties.route_fingerprints.len());

        let mut excluded = properties.excluded.clone();
        excluded.extend(self.config.excluded_fingerprints()?);
        let mut route: Vec<Option<Arc<Router>>> = vec![None; length];

        for (position, pinned) in properties.route_fingerprints.iter().enumerate() {
            let Some(fingerprint) = pinned else { continue };
            let router = index
                .get(fingerprint)
                .cloned()
                .ok_or_else(|| TorError::NoRelaysAvailable(format!("pinned router {} is not valid", fingerprint)))?;
            if route.iter().flatten().any(|r| r.fingerprint == *fingerprint) {
                return Err(TorError::InvalidConfig(format!("{} pinned twice", fingerprint)));
            }
            self.exclude_related(index, &router, &mut excluded);
            route[position] = Some(router);
        }

        // Exit first, then entry, then the middle
        let mut order: Vec<usize> = Vec::with_capacity(length);
        order.push(length - 1);
        if length > 1 {
            order.push(0);
        }
        order.extend(1..length.saturating_sub(1));

        for position in order {
            if route[position].is_some() {
                continue;
            }
            let role = if position == length - 1 && properties.exit_policy_required {
                HopRole::Exit
            } else if position == 0 && self.config.use_entry_guards {
                HopRole::Entry
            } else {
                HopRole::Middle
            };
            let router = self.select_hop(index, properties, role, &excluded).ok_or_else(|| {
                TorError::NoRelaysAvailable(format!("no eligible {:?} router for hop {}", role, position))
            })?;
            self.exclude_related(index, &router, &mut excluded);
            route[position] = Some(router);
        }

        let route: Vec<Arc<Router>> = route.into_iter().flatten().collect();
        log::debug!(
            "selected route {}",
            route.iter().map(|r| r.nickname.as_str()).collect::<Vec<_>>().join(" -> ")
        );
        Ok(route)
    }

    fn exclude_related(&self, index: &DirectoryIndex, router: &Router, excluded: &mut HashSet<Fingerprint>) {
        index.exclude_related_nodes(
            router,
            self.config.route_unique_class_c,
            self.config.route_unique_country,
            excluded,
        );
    }

    fn select_hop(
        &self,
        index: &DirectoryIndex,
        properties: &TcpStreamProperties,
        role: HopRole,
        excluded: &HashSet<Fingerprint>,
    ) -> Option<Arc<Router>> {
        let candidates: Vec<Arc<Router>> = index
            .routers()
            .filter(|r| self.is_eligible(r, excluded))
            .filter(|r| !properties.fast_route || r.flags.fast)
            .filter(|r| !properties.stable_route || r.flags.stable)
            .filter(|r| match role {
                HopRole::Entry => r.flags.guard,
                HopRole::Exit => properties.exit_accepts(r),
                HopRole::Middle => true,
            })
            .cloned()
            .collect();
        self.select_random_node(&candidates)
    }

    /// Whether `router` can be drawn at all
    fn is_eligible(&self, router: &Router, excluded: &HashSet<Fingerprint>) -> bool {
        router.is_running()
            && router.flags.valid
            && router.ntor_onion_key.is_some()
            && !excluded.contains(&router.fingerprint)
            && self.config.is_country_allowed(&router.country_code)
    }

    /// Weighted random pick; `None` for an empty or weightless set
    pub fn select_random_node(&self, candidates: &[Arc<Router>]) -> Option<Arc<Router>> {
        let draw: f64 = rand::thread_rng().gen();
        choose_weighted(candidates, self.config.ranking_influence_index, draw)
    }
}
