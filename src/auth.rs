use crate::config::{Config, ProjectKey};

/// Resolve the inbound `Authorization` header to a project record. A
/// `Bearer ` prefix is stripped when present; lookup is an exact match over
/// the (small) project list.
pub fn find_project<'a>(cfg: &'a Config, authorization: Option<&str>) -> Option<&'a ProjectKey> {
    let raw = authorization?;
    let token = raw.strip_prefix("Bearer ").unwrap_or(raw);
    if token.is_empty() {
        return None;
    }
    cfg.project_auth.iter().find(|p| p.api_key == token)
}

/// Whether the project may use `model`. Callers pass the effective
/// (post-alias) model name.
pub fn model_allowed(project: &ProjectKey, model: &str) -> bool {
    project
        .allowed_models
        .iter()
        .any(|m| m == "*" || m == model)
}
