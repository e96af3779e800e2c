
use crate::state::GateState;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Editors that replace files via rename-then-truncate can leave the path
/// briefly unreadable; the reload path re-reads a few times before giving up.
const RELOAD_READ_ATTEMPTS: usize = 5;
const RELOAD_READ_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    #[serde(default)]
    pub project_auth: Vec<ProjectKey>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen port, bound on all interfaces. A leading `:` is tolerated.
    pub port: String,

    /// Extra attempts after the first failed forward.
    pub max_retries: u32,

    /// How long a failing credential stays out of rotation.
    pub cool_down_minutes: u64,

    /// Webhook URL for upstream-failure alerts. Alerts are disabled when unset.
    pub notification_webhook: Option<String>,

    /// Client-visible alias -> `"<upstream>:<real_model>"` or `"<real_model>"`.
    pub auto_models: HashMap<String, String>,

    /// Tokio runtime worker threads.
    pub worker_threads: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: "8080".to_string(),
            max_retries: 3,
            cool_down_minutes: 5,
            notification_webhook: None,
            auto_models: HashMap::new(),
            worker_threads: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    /// Example: https://api.openai.com
    pub base_url: String,
    /// Model ids served by this upstream; `"*"` accepts anything.
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProjectKey {
    pub project_name: String,
    pub api_key: String,
    /// Models this project may request; `"*"` grants everything routable.
    #[serde(default)]
    pub allowed_models: Vec<String>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let s = fs::read_to_string(path)?;
        Self::parse(&s)
    }

    pub fn parse(s: &str) -> anyhow::Result<Self> {
        let mut cfg: Config = serde_yaml::from_str(s)?;
        cfg.normalize();
        cfg.validate()?;
        Ok(cfg)
    }

    fn normalize(&mut self) {
        self.server.port = self
            .server
            .port
            .trim()
            .trim_start_matches(':')
            .to_string();
        for u in self.upstreams.iter_mut() {
            for k in u.keys.iter_mut() {
                *k = k.trim().to_string();
            }
            u.keys.retain(|k| !k.is_empty());
            for m in u.models.iter_mut() {
                *m = m.trim().to_string();
            }
            u.models.retain(|m| !m.is_empty());
        }
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.server.port.is_empty() {
            anyhow::bail!("config: server.port must not be empty");
        }
        let mut names: HashSet<&str> = HashSet::with_capacity(self.upstreams.len());
        for (i, u) in self.upstreams.iter().enumerate() {
            if u.name.trim().is_empty() {
                anyhow::bail!("config: upstreams[{i}].name must not be empty");
            }
            if !names.insert(u.name.as_str()) {
                anyhow::bail!("config: duplicate upstream name: {}", u.name);
            }
            if !(u.base_url.starts_with("http://") || u.base_url.starts_with("https://")) {
                anyhow::bail!(
                    "config: upstreams[{i}].base_url must start with http:// or https://"
                );
            }
        }
        let mut api_keys: HashSet<&str> = HashSet::with_capacity(self.project_auth.len());
        for (i, p) in self.project_auth.iter().enumerate() {
            if p.api_key.is_empty() {
                anyhow::bail!("config: project_auth[{i}].api_key must not be empty");
            }
            if !api_keys.insert(p.api_key.as_str()) {
                anyhow::bail!(
                    "config: duplicate api_key for project '{}'",
                    p.project_name
                );
            }
        }
        Ok(())
    }

    /// Reload used by the watcher task. Only the file read is retried; a file
    /// that reads but fails to parse is a hard error for this round.
    pub async fn reload(path: &Path) -> anyhow::Result<Self> {
        let mut last_err: Option<std::io::Error> = None;
        for attempt in 0..RELOAD_READ_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(RELOAD_READ_BACKOFF).await;
            }
            match fs::read_to_string(path) {
                Ok(s) => return Self::parse(&s),
                Err(e) => last_err = Some(e),
            }
        }
        Err(anyhow::anyhow!(
            "config read failed after {} attempts: {}",
            RELOAD_READ_ATTEMPTS,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        ))
    }
}

/// Watch the config file and swap fresh snapshots into `state` on change.
/// The returned watcher must be kept alive; dropping it stops the reloads.
pub fn watch(path: PathBuf, state: Arc<GateState>) -> anyhow::Result<RecommendedWatcher> {
    let (tx, mut rx) = mpsc::channel::<()>(8);

    let mut watcher =
        notify::recommended_watcher(move |res: Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                if event.kind.is_modify() || event.kind.is_create() {
                    let _ = tx.blocking_send(());
                }
            }
            Err(e) => tracing::warn!(error = %e, "config watch error"),
        })?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;

    tokio::spawn(async move {
        while rx.recv().await.is_some() {
            match Config::reload(&path).await {
                Ok(cfg) => {
                    state.install(cfg);
                    tracing::info!(path = %path.display(), "config reloaded");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "config reload failed, keeping previous snapshot");
                }
            }
        }
    });

    Ok(watcher)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
server:
  port: "9100"
  max_retries: 1
  cool_down_minutes: 2
  notification_webhook: "https://hooks.example.com/x"
  auto_models:
    fast: "primary:gpt-x"
upstreams:
  - name: primary
    base_url: "https://api.example.com"
    models: ["gpt-x"]
    keys: ["k1", "k2"]
project_auth:
  - project_name: demo
    api_key: t1
    allowed_models: ["gpt-x"]
"#;

    #[test]
    fn parses_full_sample() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.server.port, "9100");
        assert_eq!(cfg.server.max_retries, 1);
        assert_eq!(cfg.server.cool_down_minutes, 2);
        assert_eq!(
            cfg.server.auto_models.get("fast").map(String::as_str),
            Some("primary:gpt-x")
        );
        assert_eq!(cfg.upstreams.len(), 1);
        assert_eq!(cfg.upstreams[0].keys, vec!["k1", "k2"]);
        assert_eq!(cfg.project_auth[0].project_name, "demo");
    }

    #[test]
    fn defaults_fill_missing_server_fields() {
        let cfg = Config::parse("upstreams: []\n").unwrap();
        assert_eq!(cfg.server.port, "8080");
        assert_eq!(cfg.server.max_retries, 3);
        assert_eq!(cfg.server.cool_down_minutes, 5);
        assert!(cfg.server.notification_webhook.is_none());
        assert!(cfg.server.auto_models.is_empty());
    }

    #[test]
    fn port_colon_prefix_is_stripped() {
        let cfg = Config::parse("server:\n  port: \":8081\"\n").unwrap();
        assert_eq!(cfg.server.port, "8081");
    }

    #[test]
    fn rejects_duplicate_upstream_names() {
        let s = r#"
upstreams:
  - name: a
    base_url: "https://x.example.com"
  - name: a
    base_url: "https://y.example.com"
"#;
        assert!(Config::parse(s).is_err());
    }

    #[test]
    fn rejects_non_http_base_url() {
        let s = "upstreams:\n  - name: a\n    base_url: \"ftp://x\"\n";
        assert!(Config::parse(s).is_err());
    }

    #[test]
    fn rejects_duplicate_project_keys() {
        let s = r#"
project_auth:
  - project_name: a
    api_key: same
  - project_name: b
    api_key: same
"#;
        assert!(Config::parse(s).is_err());
    }

    #[test]
    fn empty_keys_are_dropped() {
        let s = "upstreams:\n  - name: a\n    base_url: \"https://x\"\n    keys: [\" k1 \", \"\"]\n";
        let cfg = Config::parse(s).unwrap();
        assert_eq!(cfg.upstreams[0].keys, vec!["k1"]);
    }

    #[test]
    fn load_reads_from_disk() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();
        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.upstreams[0].name, "primary");
    }

    #[tokio::test]
    async fn reload_surfaces_missing_file() {
        let err = Config::reload(Path::new("/nonexistent/llmgate.yaml"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("config read failed"));
    }
}
