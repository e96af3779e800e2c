use crate::alert::Notifier;
use crate::config::{Config, UpstreamConfig};
use arc_swap::ArcSwap;
use dashmap::DashMap;
use hyper::client::HttpConnector;
use hyper::header::HeaderName;
use hyper::{Body, Client, HeaderMap, Response};
use hyper_rustls::HttpsConnectorBuilder;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const HDR_AUTHORIZATION: HeaderName = hyper::header::AUTHORIZATION;

/// Overall timeout for one upstream attempt.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

pub type HttpClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

/// Shared process state. The config snapshot is replaced whole on reload;
/// rotation counters and the blacklist outlive snapshots.
pub struct GateState {
    snapshot: ArcSwap<Config>,

    /// Upstream name -> rotation cursor. Created lazily on first use and
    /// never reset, so a config reload does not disturb the rotation.
    rotors: DashMap<String, Arc<AtomicU64>>,

    /// Credential -> cooldown expiry (epoch ms). Keyed by the bare credential
    /// string: a credential shared between upstreams cools down everywhere.
    blacklist: DashMap<String, u64>,

    pub client: HttpClient,
    pub notifier: Notifier,
}

impl GateState {
    pub fn new(cfg: Config) -> Self {
        let https = HttpsConnectorBuilder::new()
            .with_native_roots()
            .https_or_http()
            .enable_http1()
            .build();

        // hyper caps idle connections per host, not in total.
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(20)
            .build::<_, Body>(https);

        let notifier = Notifier::new(client.clone());

        Self {
            snapshot: ArcSwap::from_pointee(cfg),
            rotors: DashMap::new(),
            blacklist: DashMap::new(),
            client,
            notifier,
        }
    }

    /// The active snapshot. Hold the returned `Arc` for the whole request so
    /// a concurrent reload cannot mix old and new config.
    #[inline]
    pub fn current(&self) -> Arc<Config> {
        self.snapshot.load_full()
    }

    pub fn install(&self, cfg: Config) {
        self.snapshot.store(Arc::new(cfg));
    }

    /// Next credential for `upstream`, skipping keys in cooldown. Expired
    /// cooldown entries are evicted on observation. `None` when every key is
    /// cooling down (or none are configured).
    pub fn next_key(&self, upstream: &UpstreamConfig, now_ms: u64) -> Option<String> {
        let n = upstream.keys.len() as u64;
        if n == 0 {
            return None;
        }

        let counter = self
            .rotors
            .entry(upstream.name.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();

        for _ in 0..n {
            let idx = (counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1) % n) as usize;
            let key = &upstream.keys[idx];

            let cooldown = self.blacklist.get(key.as_str()).map(|e| *e.value());
            match cooldown {
                Some(until) if until > now_ms => continue,
                Some(_) => {
                    self.blacklist.remove(key.as_str());
                }
                None => {}
            }
            return Some(key.clone());
        }
        None
    }

    /// Put a credential into cooldown until `until_ms`, overwriting any
    /// existing entry.
    pub fn mark_cooldown(&self, credential: &str, until_ms: u64) {
        self.blacklist.insert(credential.to_string(), until_ms);
    }

    pub fn is_blacklisted(&self, credential: &str, now_ms: u64) -> bool {
        let until = match self.blacklist.get(credential) {
            Some(e) => *e.value(),
            None => return false,
        };
        if until > now_ms {
            return true;
        }
        self.blacklist.remove(credential);
        false
    }

    /// Helper to produce the flat JSON error responses this proxy emits.
    pub fn json_error(status: http::StatusCode, message: &str) -> Response<Body> {
        let body = serde_json::json!({ "error": message }).to_string();
        Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .unwrap_or_else(|_| Response::new(Body::from("proxy error")))
    }
}

/// Hop-by-hop headers are connection-scoped and never relayed, in either
/// direction. Names are compared lowercase (the `http` crate normalizes).
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

#[inline]
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(&name.as_str())
}

/// Copy every end-to-end header from `src` into `dst`, preserving repeated
/// values.
pub fn copy_end_to_end_headers(src: &HeaderMap, dst: &mut HeaderMap) {
    for (name, value) in src.iter() {
        if is_hop_by_hop(name) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}
