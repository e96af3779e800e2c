use crate::config::{Config, ProjectKey, UpstreamConfig};
use crate::util::now_ms;
use ahash::AHashSet;
use bytes::Bytes;
use std::fmt;

/// Outcome of alias resolution for one request.
pub struct Resolved {
    /// Upstream pinned by the alias, when the alias value was
    /// `"<upstream>:<model>"`.
    pub pinned: Option<String>,
    /// Effective (post-alias) model name.
    pub model: String,
    /// Request body, rewritten when the alias applied and the body was JSON.
    pub body: Bytes,
}

#[derive(Debug)]
pub enum RouteError {
    /// The alias pinned an upstream that does not exist or does not serve the
    /// model.
    PinnedUnavailable { upstream: String, model: String },
    NoUpstream { model: String },
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::PinnedUnavailable { upstream, model } => write!(
                f,
                "Target upstream '{upstream}' not found or does not support model '{model}'"
            ),
            RouteError::NoUpstream { model } => {
                write!(f, "No upstream found for model: {model}")
            }
        }
    }
}

/// Apply `auto_models` to the requested model. Alias values are split at the
/// FIRST `:` only; with two parts the upstream is pinned. The JSON body's
/// top-level `"model"` is rewritten to the effective name; a body that is not
/// a JSON object passes through untouched.
pub fn resolve(cfg: &Config, requested: &str, body: Bytes) -> Resolved {
    let Some(mapped) = cfg.server.auto_models.get(requested) else {
        return Resolved {
            pinned: None,
            model: requested.to_string(),
            body,
        };
    };

    let (pinned, model) = match mapped.split_once(':') {
        Some((upstream, model)) => (Some(upstream.to_string()), model.to_string()),
        None => (None, mapped.clone()),
    };

    let body = match rewrite_model(&body, &model) {
        Some(rewritten) => Bytes::from(rewritten),
        None => body,
    };

    Resolved { pinned, model, body }
}

fn rewrite_model(body: &[u8], model: &str) -> Option<Vec<u8>> {
    let mut obj: serde_json::Map<String, serde_json::Value> =
        serde_json::from_slice(body).ok()?;
    obj.insert(
        "model".to_string(),
        serde_json::Value::String(model.to_string()),
    );
    serde_json::to_vec(&obj).ok()
}

/// Pick the serving upstream. Pinned aliases must hit their named upstream;
/// otherwise exact model matches beat wildcards, declaration order breaking
/// ties within each pass.
pub fn pick_upstream<'a>(
    cfg: &'a Config,
    pinned: Option<&str>,
    model: &str,
) -> Result<&'a UpstreamConfig, RouteError> {
    if let Some(name) = pinned {
        return match cfg.upstreams.iter().find(|u| u.name == name) {
            Some(u) if supports(u, model) => Ok(u),
            _ => Err(RouteError::PinnedUnavailable {
                upstream: name.to_string(),
                model: model.to_string(),
            }),
        };
    }

    if let Some(u) = cfg
        .upstreams
        .iter()
        .find(|u| u.models.iter().any(|m| m == model))
    {
        return Ok(u);
    }
    if let Some(u) = cfg
        .upstreams
        .iter()
        .find(|u| u.models.iter().any(|m| m == "*"))
    {
        return Ok(u);
    }
    Err(RouteError::NoUpstream {
        model: model.to_string(),
    })
}

#[inline]
fn supports(u: &UpstreamConfig, model: &str) -> bool {
    u.models.iter().any(|m| m == "*" || m == model)
}

/// Aggregate the model listing visible to `project`: concrete upstream models
/// first (attributed to their upstream), then aliases whose target the caller
/// may use (attributed to `system-auto-map`). First occurrence of an id wins;
/// the `"*"` wildcard itself is never listed.
pub fn visible_models(cfg: &Config, project: &ProjectKey) -> serde_json::Value {
    let allow_all = project.allowed_models.iter().any(|m| m == "*");
    let allowed =
        |m: &str| allow_all || project.allowed_models.iter().any(|a| a == m);

    let created = now_ms() / 1000;
    let mut seen: AHashSet<&str> = AHashSet::new();
    let mut data = Vec::new();

    for u in &cfg.upstreams {
        for m in &u.models {
            if m == "*" || seen.contains(m.as_str()) || !allowed(m) {
                continue;
            }
            seen.insert(m.as_str());
            data.push(serde_json::json!({
                "id": m,
                "object": "model",
                "created": created,
                "owned_by": u.name,
            }));
        }
    }

    for (alias, mapped) in &cfg.server.auto_models {
        let real = match mapped.split_once(':') {
            Some((_, m)) => m,
            None => mapped.as_str(),
        };
        if seen.contains(alias.as_str()) || !allowed(real) {
            continue;
        }
        seen.insert(alias.as_str());
        data.push(serde_json::json!({
            "id": alias,
            "object": "model",
            "created": created,
            "owned_by": "system-auto-map",
        }));
    }

    serde_json::json!({ "object": "list", "data": data })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn upstream(name: &str, models: &[&str]) -> UpstreamConfig {
        UpstreamConfig {
            name: name.to_string(),
            base_url: "https://api.example.com".to_string(),
            models: models.iter().map(|m| m.to_string()).collect(),
            keys: vec!["k".to_string()],
        }
    }

    fn cfg_with_aliases(aliases: &[(&str, &str)], upstreams: Vec<UpstreamConfig>) -> Config {
        let mut auto_models = HashMap::new();
        for (k, v) in aliases {
            auto_models.insert(k.to_string(), v.to_string());
        }
        let mut cfg = Config {
            upstreams,
            ..Config::default()
        };
        cfg.server.auto_models = auto_models;
        cfg
    }

    #[test]
    fn alias_with_colon_pins_upstream() {
        let cfg = cfg_with_aliases(&[("fast", "a:gpt-x")], vec![upstream("a", &["gpt-x"])]);
        let r = resolve(&cfg, "fast", Bytes::from_static(b"{\"model\":\"fast\"}"));
        assert_eq!(r.pinned.as_deref(), Some("a"));
        assert_eq!(r.model, "gpt-x");
    }

    #[test]
    fn alias_without_colon_leaves_upstream_unpinned() {
        let cfg = cfg_with_aliases(&[("fast", "gpt-x")], vec![upstream("a", &["gpt-x"])]);
        let r = resolve(&cfg, "fast", Bytes::new());
        assert!(r.pinned.is_none());
        assert_eq!(r.model, "gpt-x");
    }

    #[test]
    fn alias_splits_at_first_colon_only() {
        let cfg = cfg_with_aliases(&[("odd", "a:m:v2")], vec![]);
        let r = resolve(&cfg, "odd", Bytes::new());
        assert_eq!(r.pinned.as_deref(), Some("a"));
        assert_eq!(r.model, "m:v2");
    }

    #[test]
    fn unaliased_model_passes_through() {
        let cfg = cfg_with_aliases(&[], vec![]);
        let body = Bytes::from_static(b"{\"model\":\"gpt-x\",\"n\":1}");
        let r = resolve(&cfg, "gpt-x", body.clone());
        assert!(r.pinned.is_none());
        assert_eq!(r.model, "gpt-x");
        assert_eq!(r.body, body);
    }

    #[test]
    fn body_rewrite_replaces_model_and_keeps_other_fields() {
        let cfg = cfg_with_aliases(&[("fast", "a:gpt-x")], vec![]);
        let body = Bytes::from_static(b"{\"model\":\"fast\",\"msg\":\"hi\",\"temperature\":0.5}");
        let r = resolve(&cfg, "fast", body);

        let v: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
        assert_eq!(v["model"], "gpt-x");
        assert_eq!(v["msg"], "hi");
        assert_eq!(v["temperature"], 0.5);
    }

    #[test]
    fn non_json_body_is_left_unchanged() {
        let cfg = cfg_with_aliases(&[("fast", "gpt-x")], vec![]);
        let body = Bytes::from_static(b"not json at all");
        let r = resolve(&cfg, "fast", body.clone());
        assert_eq!(r.model, "gpt-x");
        assert_eq!(r.body, body);
    }

    #[test]
    fn exact_match_beats_wildcard() {
        let cfg = cfg_with_aliases(
            &[],
            vec![upstream("wild", &["*"]), upstream("exact", &["gpt-x"])],
        );
        let u = pick_upstream(&cfg, None, "gpt-x").unwrap();
        assert_eq!(u.name, "exact");
    }

    #[test]
    fn wildcard_catches_unknown_models_in_declaration_order() {
        let cfg = cfg_with_aliases(
            &[],
            vec![
                upstream("a", &["gpt-x"]),
                upstream("w1", &["*"]),
                upstream("w2", &["*"]),
            ],
        );
        let u = pick_upstream(&cfg, None, "gpt-unknown").unwrap();
        assert_eq!(u.name, "w1");
    }

    #[test]
    fn no_upstream_for_model_is_an_error() {
        let cfg = cfg_with_aliases(&[], vec![upstream("a", &["gpt-x"])]);
        let err = pick_upstream(&cfg, None, "gpt-y").unwrap_err();
        assert!(matches!(err, RouteError::NoUpstream { .. }));
        assert!(err.to_string().contains("No upstream found"));
    }

    #[test]
    fn pinned_upstream_must_exist_and_serve_the_model() {
        let cfg = cfg_with_aliases(&[], vec![upstream("a", &["gpt-x"])]);

        assert!(pick_upstream(&cfg, Some("a"), "gpt-x").is_ok());
        assert!(matches!(
            pick_upstream(&cfg, Some("missing"), "gpt-x"),
            Err(RouteError::PinnedUnavailable { .. })
        ));
        assert!(matches!(
            pick_upstream(&cfg, Some("a"), "gpt-y"),
            Err(RouteError::PinnedUnavailable { .. })
        ));
    }

    #[test]
    fn pinned_wildcard_upstream_serves_anything() {
        let cfg = cfg_with_aliases(&[], vec![upstream("w", &["*"])]);
        assert!(pick_upstream(&cfg, Some("w"), "whatever").is_ok());
    }

    #[test]
    fn listing_aggregates_upstreams_and_aliases() {
        let cfg = cfg_with_aliases(
            &[("fast", "a:gpt-x")],
            vec![upstream("a", &["gpt-x"]), upstream("b", &["gpt-y", "*"])],
        );
        let project = ProjectKey {
            project_name: "p".to_string(),
            api_key: "t".to_string(),
            allowed_models: vec!["*".to_string()],
        };

        let v = visible_models(&cfg, &project);
        assert_eq!(v["object"], "list");
        let data = v["data"].as_array().unwrap();
        assert_eq!(data.len(), 3);

        let owned = |id: &str| {
            data.iter()
                .find(|e| e["id"] == id)
                .map(|e| e["owned_by"].as_str().unwrap().to_string())
        };
        assert_eq!(owned("gpt-x").as_deref(), Some("a"));
        assert_eq!(owned("gpt-y").as_deref(), Some("b"));
        assert_eq!(owned("fast").as_deref(), Some("system-auto-map"));
        // The wildcard itself is never listed.
        assert!(data.iter().all(|e| e["id"] != "*"));
        assert!(data.iter().all(|e| e["object"] == "model"));
    }

    #[test]
    fn listing_respects_the_allow_list() {
        let cfg = cfg_with_aliases(
            &[("fast", "a:gpt-x"), ("slow", "a:gpt-z")],
            vec![upstream("a", &["gpt-x", "gpt-z"])],
        );
        let project = ProjectKey {
            project_name: "p".to_string(),
            api_key: "t".to_string(),
            allowed_models: vec!["gpt-x".to_string()],
        };

        let v = visible_models(&cfg, &project);
        let data = v["data"].as_array().unwrap();
        let ids: Vec<&str> = data.iter().map(|e| e["id"].as_str().unwrap()).collect();
        assert!(ids.contains(&"gpt-x"));
        assert!(ids.contains(&"fast"), "alias target is allowed");
        assert!(!ids.contains(&"gpt-z"));
        assert!(!ids.contains(&"slow"), "alias with disallowed target hidden");
    }

    #[test]
    fn listing_first_occurrence_wins() {
        let cfg = cfg_with_aliases(
            &[],
            vec![upstream("a", &["gpt-x"]), upstream("b", &["gpt-x"])],
        );
        let project = ProjectKey {
            project_name: "p".to_string(),
            api_key: "t".to_string(),
            allowed_models: vec!["*".to_string()],
        };

        let v = visible_models(&cfg, &project);
        let data = v["data"].as_array().unwrap();
        assert_eq!(data.len(), 1);
        assert_eq!(data[0]["owned_by"], "a");
    }
}
