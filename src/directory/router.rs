//! Router model
//!
//! A [`Router`] is built from a parsed server descriptor and then merged
//! with the flags the consensus assigns it. It never changes afterwards,
//! except for its ranking index, which [`Router::punish_ranking`] lowers
//! each time the router misbehaves.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::consensus::RouterStatusDescription;
use super::exit_policy::ExitPolicy;
use super::fingerprint::Fingerprint;
use crate::error::{Result, TorError};

/// Bandwidth (bytes/s) at which a router reaches half of the maximum ranking
pub const HIGH_BANDWIDTH: u32 = 2 * 1024 * 1024;

/// Factor applied to the ranking index on each punishment
pub const PUNISHMENT_FACTOR: f32 = 0.75;

/// How long a descriptor stays usable after publication
pub const DESCRIPTOR_LIFETIME: Duration = Duration::from_secs(48 * 3600);

/// Unknown country code
pub const UNKNOWN_COUNTRY: &str = "??";

/// Router flags from consensus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RouterFlags {
    pub authority: bool,
    pub bad_exit: bool,
    pub exit: bool,
    pub fast: bool,
    pub guard: bool,
    pub hs_dir: bool,
    pub named: bool,
    pub running: bool,
    pub stable: bool,
    pub v2_dir: bool,
    pub valid: bool,
}

impl RouterFlags {
    /// Parse the flag list of an `s` line
    pub fn from_string(flags: &str) -> Self {
        let mut router_flags = RouterFlags::default();

        for flag in flags.split_whitespace() {
            match flag {
                "Authority" => router_flags.authority = true,
                "BadExit" => router_flags.bad_exit = true,
                "Exit" => router_flags.exit = true,
                "Fast" => router_flags.fast = true,
                "Guard" => router_flags.guard = true,
                "HSDir" => router_flags.hs_dir = true,
                "Named" => router_flags.named = true,
                "Running" => router_flags.running = true,
                "Stable" => router_flags.stable = true,
                "V2Dir" => router_flags.v2_dir = true,
                "Valid" => router_flags.valid = true,
                _ => {} // Ignore unknown flags
            }
        }

        router_flags
    }

    /// Whether every flag set in `required` is also set here
    pub fn contains(&self, required: &RouterFlags) -> bool {
        let mine = self.to_bits();
        let theirs = required.to_bits();
        mine & theirs == theirs
    }

    pub fn to_bits(&self) -> u16 {
        [
            self.authority,
            self.bad_exit,
            self.exit,
            self.fast,
            self.guard,
            self.hs_dir,
            self.named,
            self.running,
            self.stable,
            self.v2_dir,
            self.valid,
        ]
        .iter()
        .enumerate()
        .fold(0u16, |acc, (i, set)| if *set { acc | (1 << i) } else { acc })
    }

    pub fn from_bits(bits: u16) -> Self {
        let bit = |i: u16| bits & (1 << i) != 0;
        Self {
            authority: bit(0),
            bad_exit: bit(1),
            exit: bit(2),
            fast: bit(3),
            guard: bit(4),
            hs_dir: bit(5),
            named: bit(6),
            running: bit(7),
            stable: bit(8),
            v2_dir: bit(9),
            valid: bit(10),
        }
    }
}

/// A relay as known from its descriptor and the consensus
#[derive(Debug)]
pub struct Router {
    pub nickname: String,
    pub address: IpAddr,
    pub or_port: u16,
    pub socks_port: u16,
    pub dir_port: u16,
    pub fingerprint: Fingerprint,

    pub bandwidth_avg: u32,
    pub bandwidth_burst: u32,
    pub bandwidth_observed: u32,

    pub platform: String,
    /// Unix seconds
    pub published: u64,
    /// Unix seconds
    pub valid_until: u64,
    pub uptime: u64,

    /// DER-encoded RSA keys
    pub onion_key: Vec<u8>,
    pub signing_key: Vec<u8>,
    /// Curve25519 key for the ntor handshake
    pub ntor_onion_key: Option<[u8; 32]>,

    pub contact: String,
    pub family: HashSet<Fingerprint>,
    pub exit_policy: ExitPolicy,
    pub country_code: String,
    pub flags: RouterFlags,
    /// Authority v3 identity, set for directory authorities only
    pub v3_ident: Option<Fingerprint>,
    /// SHA-1 of the signed descriptor text
    pub descriptor_digest: [u8; 20],

    /// f32 bits
    ranking_index: AtomicU32,
}

impl Clone for Router {
    fn clone(&self) -> Self {
        Self {
            nickname: self.nickname.clone(),
            address: self.address,
            or_port: self.or_port,
            socks_port: self.socks_port,
            dir_port: self.dir_port,
            fingerprint: self.fingerprint,
            bandwidth_avg: self.bandwidth_avg,
            bandwidth_burst: self.bandwidth_burst,
            bandwidth_observed: self.bandwidth_observed,
            platform: self.platform.clone(),
            published: self.published,
            valid_until: self.valid_until,
            uptime: self.uptime,
            onion_key: self.onion_key.clone(),
            signing_key: self.signing_key.clone(),
            ntor_onion_key: self.ntor_onion_key,
            contact: self.contact.clone(),
            family: self.family.clone(),
            exit_policy: self.exit_policy.clone(),
            country_code: self.country_code.clone(),
            flags: self.flags,
            v3_ident: self.v3_ident,
            descriptor_digest: self.descriptor_digest,
            ranking_index: AtomicU32::new(self.ranking_index.load(Ordering::Relaxed)),
        }
    }
}

impl Router {
    /// Minimal router; descriptor parsing fills in the rest
    pub fn new(nickname: &str, address: IpAddr, or_port: u16, fingerprint: Fingerprint) -> Self {
        Self {
            nickname: nickname.to_string(),
            address,
            or_port,
            socks_port: 0,
            dir_port: 0,
            fingerprint,
            bandwidth_avg: 0,
            bandwidth_burst: 0,
            bandwidth_observed: 0,
            platform: String::new(),
            published: 0,
            valid_until: 0,
            uptime: 0,
            onion_key: Vec::new(),
            signing_key: Vec::new(),
            ntor_onion_key: None,
            contact: String::new(),
            family: HashSet::new(),
            exit_policy: ExitPolicy::reject_all(),
            country_code: UNKNOWN_COUNTRY.to_string(),
            flags: RouterFlags::default(),
            v3_ident: None,
            descriptor_digest: [0u8; 20],
            ranking_index: AtomicU32::new(initial_ranking(0).to_bits()),
        }
    }

    /// Recompute the ranking index from the bandwidth fields
    pub fn reset_ranking(&self) {
        let bw = self.bandwidth_avg.min(self.bandwidth_observed.max(1));
        self.ranking_index
            .store(initial_ranking(bw).to_bits(), Ordering::Relaxed);
    }

    /// Copy of this router carrying the consensus' view of it
    ///
    /// The ranking index carries over, punishments included.
    pub fn with_status(&self, status: &RouterStatusDescription) -> Router {
        let mut updated = self.clone();
        updated.flags = status.flags;
        if status.dir_port != 0 {
            updated.dir_port = status.dir_port;
        }
        updated
    }

    pub fn with_country(mut self, country_code: &str) -> Router {
        self.country_code = country_code.to_ascii_uppercase();
        self
    }

    pub fn or_address(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.or_port)
    }

    pub fn dir_address(&self) -> Option<SocketAddr> {
        (self.dir_port != 0).then(|| SocketAddr::new(self.address, self.dir_port))
    }

    /// Not expired at `now`
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        unix_seconds(now) < self.valid_until
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(SystemTime::now())
    }

    pub fn is_exit(&self) -> bool {
        self.flags.exit && !self.flags.bad_exit
    }

    pub fn is_running(&self) -> bool {
        self.flags.running
    }

    pub fn is_dir_server(&self) -> bool {
        self.dir_port != 0 && (self.flags.authority || self.flags.v2_dir)
    }

    pub fn exit_policy_accepts(&self, address: Option<IpAddr>, port: u16) -> bool {
        self.exit_policy.accepts(address, port)
    }

    pub fn ranking_index(&self) -> f32 {
        f32::from_bits(self.ranking_index.load(Ordering::Relaxed))
    }

    /// `p * rank + (1 - p)`: how much bandwidth matters, from not at all (0) to fully (1)
    pub fn refined_ranking_index(&self, p: f32) -> f32 {
        p * self.ranking_index() + (1.0 - p)
    }

    /// Lower the ranking index; it never recovers
    pub fn punish_ranking(&self) {
        let _ = self
            .ranking_index
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |bits| {
                Some((f32::from_bits(bits) * PUNISHMENT_FACTOR).to_bits())
            });
        log::debug!(
            "Punished router {} ({}), ranking now {:.4}",
            self.nickname,
            self.fingerprint,
            self.ranking_index()
        );
    }

    /// /24 (IPv4) or /48 (IPv6) network key used for neighbour grouping
    pub fn class_c_network(&self) -> String {
        match self.address {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                format!("{}.{}.{}", o[0], o[1], o[2])
            }
            IpAddr::V6(v6) => {
                let s = v6.segments();
                format!("{:x}:{:x}:{:x}", s[0], s[1], s[2])
            }
        }
    }
}

fn initial_ranking(bandwidth: u32) -> f32 {
    // Strictly positive so that a zero-bandwidth router can still be drawn
    let bw = bandwidth.max(1) as f32;
    bw / (bw + HIGH_BANDWIDTH as f32)
}

pub(crate) fn unix_seconds(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

// ===== Binary cache format =====
//
// u32 count, then per router (all integers big-endian):
// str nickname, str address, u16 or_port, u16 socks_port, u16 dir_port,
// [20] fingerprint, u32 bw_avg, u32 bw_burst, u32 bw_observed, str platform,
// u64 published, u64 valid_until, u64 uptime, bytes onion_key,
// bytes signing_key, u8 has_ntor [+ 32], str contact,
// u16 family_count + [20]*, u16 rule_count + str*, str country,
// u16 flags, u8 has_v3 [+ 20], [20] descriptor_digest, u32 ranking bits
// where str/bytes = u16 length + data.

struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    fn u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }
    fn raw(&mut self, v: &[u8]) {
        self.buf.extend_from_slice(v);
    }
    fn bytes(&mut self, v: &[u8]) -> Result<()> {
        let len = u16::try_from(v.len())
            .map_err(|_| TorError::Storage("field too long for router cache".into()))?;
        self.u16(len);
        self.raw(v);
        Ok(())
    }
    fn str(&mut self, v: &str) -> Result<()> {
        self.bytes(v.as_bytes())
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(TorError::Storage("truncated router cache".into()));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }
    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }
    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }
    fn u64(&mut self) -> Result<u64> {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(self.take(8)?);
        Ok(u64::from_be_bytes(arr))
    }
    fn array20(&mut self) -> Result<[u8; 20]> {
        let mut arr = [0u8; 20];
        arr.copy_from_slice(self.take(20)?);
        Ok(arr)
    }
    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }
    fn str(&mut self) -> Result<String> {
        String::from_utf8(self.bytes()?)
            .map_err(|_| TorError::Storage("invalid UTF-8 in router cache".into()))
    }
}

impl Router {
    fn save(&self, w: &mut Writer) -> Result<()> {
        w.str(&self.nickname)?;
        w.str(&self.address.to_string())?;
        w.u16(self.or_port);
        w.u16(self.socks_port);
        w.u16(self.dir_port);
        w.raw(self.fingerprint.as_bytes());
        w.u32(self.bandwidth_avg);
        w.u32(self.bandwidth_burst);
        w.u32(self.bandwidth_observed);
        w.str(&self.platform)?;
        w.u64(self.published);
        w.u64(self.valid_until);
        w.u64(self.uptime);
        w.bytes(&self.onion_key)?;
        w.bytes(&self.signing_key)?;
        match &self.ntor_onion_key {
            Some(key) => {
                w.u8(1);
                w.raw(key);
            }
            None => w.u8(0),
        }
        w.str(&self.contact)?;
        let mut family: Vec<_> = self.family.iter().collect();
        family.sort();
        w.u16(family.len() as u16);
        for fp in family {
            w.raw(fp.as_bytes());
        }
        w.u16(self.exit_policy.rules().len() as u16);
        for rule in self.exit_policy.rules() {
            w.str(&rule.to_string())?;
        }
        w.str(&self.country_code)?;
        w.u16(self.flags.to_bits());
        match &self.v3_ident {
            Some(id) => {
                w.u8(1);
                w.raw(id.as_bytes());
            }
            None => w.u8(0),
        }
        w.raw(&self.descriptor_digest);
        w.u32(self.ranking_index.load(Ordering::Relaxed));
        Ok(())
    }

    fn load(r: &mut Reader<'_>) -> Result<Router> {
        let nickname = r.str()?;
        let address: IpAddr = r
            .str()?
            .parse()
            .map_err(|_| TorError::Storage("invalid address in router cache".into()))?;
        let or_port = r.u16()?;
        let socks_port = r.u16()?;
        let dir_port = r.u16()?;
        let fingerprint = Fingerprint::new(r.array20()?);

        let mut router = Router::new(&nickname, address, or_port, fingerprint);
        router.socks_port = socks_port;
        router.dir_port = dir_port;
        router.bandwidth_avg = r.u32()?;
        router.bandwidth_burst = r.u32()?;
        router.bandwidth_observed = r.u32()?;
        router.platform = r.str()?;
        router.published = r.u64()?;
        router.valid_until = r.u64()?;
        router.uptime = r.u64()?;
        router.onion_key = r.bytes()?;
        router.signing_key = r.bytes()?;
        if r.u8()? == 1 {
            let mut key = [0u8; 32];
            key.copy_from_slice(r.take(32)?);
            router.ntor_onion_key = Some(key);
        }
        router.contact = r.str()?;
        let family_count = r.u16()?;
        for _ in 0..family_count {
            router.family.insert(Fingerprint::new(r.array20()?));
        }
        let rule_count = r.u16()?;
        let mut policy = ExitPolicy::reject_all();
        for _ in 0..rule_count {
            policy.push(r.str()?.parse()?);
        }
        router.exit_policy = policy;
        router.country_code = r.str()?;
        router.flags = RouterFlags::from_bits(r.u16()?);
        if r.u8()? == 1 {
            router.v3_ident = Some(Fingerprint::new(r.array20()?));
        }
        router.descriptor_digest = r.array20()?;
        router.ranking_index = AtomicU32::new(r.u32()?);
        Ok(router)
    }
}

/// Serialize routers into the cache dump
pub fn save_all<'a>(routers: impl IntoIterator<Item = &'a Router>) -> Result<Vec<u8>> {
    let routers: Vec<&Router> = routers.into_iter().collect();
    let mut w = Writer {
        buf: Vec::with_capacity(routers.len() * 512),
    };
    w.u32(routers.len() as u32);
    for router in routers {
        router.save(&mut w)?;
    }
    Ok(w.buf)
}

/// Deserialize a cache dump written by [`save_all`]
pub fn load_all(data: &[u8]) -> Result<Vec<Router>> {
    let mut r = Reader { data, pos: 0 };
    let count = r.u32()? as usize;
    let mut routers = Vec::with_capacity(count.min(16 * 1024));
    for _ in 0..count {
        routers.push(Router::load(&mut r)?);
    }
    if r.pos != data.len() {
        return Err(TorError::Storage(format!(
            "{} trailing bytes in router cache",
            data.len() - r.pos
        )));
    }
    Ok(routers)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(n: u8) -> Router {
        let mut r = Router::new(
            &format!("relay{}", n),
            format!("10.0.{}.1", n).parse().unwrap(),
            9001,
            Fingerprint::new([n; 20]),
        );
        r.bandwidth_avg = 1_000_000;
        r.bandwidth_observed = 800_000;
        r.ntor_onion_key = Some([n; 32]);
        r.family.insert(Fingerprint::new([n.wrapping_add(1); 20]));
        r.exit_policy = ExitPolicy::new(vec![
            "reject *:25".parse().unwrap(),
            "accept *:*".parse().unwrap(),
        ]);
        r.flags = RouterFlags::from_string("Fast Guard Running Stable Valid");
        r.country_code = "DE".into();
        r.valid_until = 4_000_000_000;
        r.reset_ranking();
        r
    }

    #[test]
    fn test_flags_parse_and_bits() {
        let flags = RouterFlags::from_string("Exit Fast HSDir Running Unknown V2Dir Valid");
        assert!(flags.exit && flags.fast && flags.hs_dir && flags.v2_dir);
        assert!(!flags.guard);
        assert_eq!(RouterFlags::from_bits(flags.to_bits()), flags);

        let required = RouterFlags {
            fast: true,
            running: true,
            ..Default::default()
        };
        assert!(flags.contains(&required));
        assert!(!RouterFlags::default().contains(&required));
    }

    #[test]
    fn test_ranking() {
        let r = sample(1);
        let rank = r.ranking_index();
        assert!(rank > 0.0 && rank <= 1.0);
        assert_eq!(r.refined_ranking_index(0.0), 1.0);
        assert!((r.refined_ranking_index(1.0) - rank).abs() < f32::EPSILON);

        r.punish_ranking();
        assert!(r.ranking_index() < rank);
        let punished = r.ranking_index();
        r.punish_ranking();
        assert!(r.ranking_index() < punished);
    }

    #[test]
    fn test_zero_bandwidth_still_ranked() {
        let r = Router::new("zero", "1.2.3.4".parse().unwrap(), 1, Fingerprint::new([0; 20]));
        assert!(r.ranking_index() > 0.0);
    }

    #[test]
    fn test_class_c_network() {
        let r = sample(7);
        assert_eq!(r.class_c_network(), "10.0.7");
    }

    #[test]
    fn test_cache_round_trip() {
        let routers = vec![sample(1), sample(2), sample(3)];
        routers[1].punish_ranking();
        let dump = save_all(routers.iter()).unwrap();
        let loaded = load_all(&dump).unwrap();

        assert_eq!(loaded.len(), 3);
        for (a, b) in routers.iter().zip(&loaded) {
            assert_eq!(a.fingerprint, b.fingerprint);
            assert_eq!(a.flags, b.flags);
            assert_eq!(a.exit_policy, b.exit_policy);
            assert_eq!(a.family, b.family);
            assert_eq!(a.ntor_onion_key, b.ntor_onion_key);
            assert_eq!(a.ranking_index(), b.ranking_index());
        }
    }

    #[test]
    fn test_truncated_cache_rejected() {
        let dump = save_all([sample(1)].iter()).unwrap();
        assert!(load_all(&dump[..dump.len() - 3]).is_err());
        assert!(load_all(&[]).is_err());
    }
}
