
use crate::auth;
use crate::config::{Config, UpstreamConfig};
use crate::route;
use crate::state::{copy_end_to_end_headers, GateState, HDR_AUTHORIZATION, UPSTREAM_TIMEOUT};
use crate::util::{mask_key, now_ms};
use hyper::header::{HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response, Server, StatusCode, Uri};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::StreamExt;

/// Pause after an attempt that found every key cooling down.
const NO_KEY_BACKOFF: Duration = Duration::from_millis(100);
/// Pause between failed forward attempts.
const RETRY_BACKOFF: Duration = Duration::from_millis(200);

pub async fn serve_http(addr: SocketAddr, state: Arc<GateState>) -> anyhow::Result<()> {
    let make_svc = make_service_fn(move |_conn| {
        let state = state.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req| {
                let state = state.clone();
                async move { Ok::<_, Infallible>(handle(req, state).await) }
            }))
        }
    });

    let server = Server::try_bind(&addr)?.tcp_nodelay(true).serve(make_svc);
    server.await?;
    Ok(())
}

async fn handle(req: Request<Body>, state: Arc<GateState>) -> Response<Body> {
    let path = req.uri().path().to_string();

    if req.method() == Method::GET && path == "/health" {
        return Response::new(Body::from("ok"));
    }

    let sub_path = match path.strip_prefix("/v1") {
        Some(p) if p.starts_with('/') => p.to_string(),
        _ => return GateState::json_error(StatusCode::NOT_FOUND, "not found"),
    };

    if req.method() == Method::GET && (sub_path == "/models" || sub_path == "/models/") {
        return handle_models(&req, &state);
    }

    // One snapshot for the whole request; a concurrent reload cannot mix
    // old and new config here.
    let cfg = state.current();

    let (parts, body) = req.into_parts();
    let bearer = parts
        .headers
        .get(HDR_AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let Some(project) = auth::find_project(&cfg, bearer) else {
        return GateState::json_error(StatusCode::UNAUTHORIZED, "Unauthorized Project Key");
    };

    let body_bytes = match hyper::body::to_bytes(body).await {
        Ok(b) => b,
        Err(_) => return GateState::json_error(StatusCode::BAD_REQUEST, "Read body failed"),
    };

    let requested = extract_model(&body_bytes);
    let aliased = cfg.server.auto_models.contains_key(&requested);
    let resolved = route::resolve(&cfg, &requested, body_bytes);
    if aliased {
        tracing::info!(
            project = %project.project_name,
            from = %requested,
            to = %resolved.model,
            "alias mapped"
        );
    }

    if !auth::model_allowed(project, &resolved.model) {
        return GateState::json_error(
            StatusCode::FORBIDDEN,
            &format!(
                "Model '{}' is not allowed for project '{}'",
                resolved.model, project.project_name
            ),
        );
    }

    let upstream = match route::pick_upstream(&cfg, resolved.pinned.as_deref(), &resolved.model) {
        Ok(u) => u,
        Err(e) => return GateState::json_error(StatusCode::BAD_REQUEST, &e.to_string()),
    };

    forward(
        &state,
        &cfg,
        upstream,
        &parts,
        &sub_path,
        resolved.body,
        &project.project_name,
        &resolved.model,
    )
    .await
}

fn handle_models(req: &Request<Body>, state: &GateState) -> Response<Body> {
    let cfg = state.current();
    let bearer = req
        .headers()
        .get(HDR_AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let Some(project) = auth::find_project(&cfg, bearer) else {
        return GateState::json_error(StatusCode::UNAUTHORIZED, "Invalid API Key");
    };

    let body = route::visible_models(&cfg, project).to_string();
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_else(|_| {
            GateState::json_error(StatusCode::INTERNAL_SERVER_ERROR, "response build failed")
        })
}

fn extract_model(body: &[u8]) -> String {
    if body.is_empty() {
        return String::new();
    }
    serde_json::from_slice::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("model")
                .and_then(|m| m.as_str())
                .map(|s| s.to_string())
        })
        .unwrap_or_default()
}

/// `base_url` path (trailing slash trimmed) + `/v1` + sub-path, query carried
/// unchanged.
fn build_target_uri(base: &Uri, sub_path: &str, query: Option<&str>) -> anyhow::Result<Uri> {
    let scheme = base
        .scheme()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("base_url missing scheme"))?;
    let authority = base
        .authority()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("base_url missing authority"))?;

    let mut pq = String::with_capacity(base.path().len() + sub_path.len() + 16);
    pq.push_str(base.path().trim_end_matches('/'));
    pq.push_str("/v1");
    pq.push_str(sub_path);
    if let Some(q) = query {
        pq.push('?');
        pq.push_str(q);
    }

    let mut parts = http::uri::Parts::default();
    parts.scheme = Some(scheme);
    parts.authority = Some(authority);
    parts.path_and_query = Some(pq.parse()?);
    Ok(Uri::from_parts(parts)?)
}

async fn forward(
    state: &GateState,
    cfg: &Config,
    upstream: &UpstreamConfig,
    inbound: &http::request::Parts,
    sub_path: &str,
    body: bytes::Bytes,
    project: &str,
    model: &str,
) -> Response<Body> {
    let srv = &cfg.server;
    let webhook = srv.notification_webhook.as_deref();

    let base: Uri = match upstream.base_url.parse() {
        Ok(u) => u,
        Err(_) => {
            return GateState::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Config error: invalid base_url",
            )
        }
    };
    let target_uri = match build_target_uri(&base, sub_path, inbound.uri.query()) {
        Ok(u) => u,
        Err(_) => {
            return GateState::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Config error: invalid base_url",
            )
        }
    };
    let host_value = match target_uri
        .authority()
        .map(|a| HeaderValue::from_str(a.as_str()))
    {
        Some(Ok(v)) => v,
        _ => {
            return GateState::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Config error: invalid base_url",
            )
        }
    };

    let mut last_err = String::from("no attempt made");

    for attempt in 0..=srv.max_retries {
        let now = now_ms();
        let Some(key) = state.next_key(upstream, now) else {
            last_err = format!("all keys for upstream '{}' are cooling down", upstream.name);
            tokio::time::sleep(NO_KEY_BACKOFF).await;
            continue;
        };

        tracing::info!(
            project,
            model,
            upstream = %upstream.name,
            attempt = attempt + 1,
            "forwarding"
        );

        let auth_value = match HeaderValue::from_str(&format!("Bearer {key}")) {
            Ok(v) => v,
            Err(_) => {
                last_err = "credential not usable in an HTTP header".to_string();
                continue;
            }
        };

        let mut out_req = match Request::builder()
            .method(inbound.method.clone())
            .uri(target_uri.clone())
            .body(Body::from(body.clone()))
        {
            Ok(r) => r,
            Err(_) => {
                return GateState::json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "request build failed",
                )
            }
        };
        copy_end_to_end_headers(&inbound.headers, out_req.headers_mut());
        let headers = out_req.headers_mut();
        headers.insert(HDR_AUTHORIZATION, auth_value);
        headers.insert(HOST, host_value.clone());
        headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len() as u64));

        match tokio::time::timeout(UPSTREAM_TIMEOUT, state.client.request(out_req)).await {
            Err(_) => {
                last_err = "upstream request timeout".to_string();
                tracing::warn!(upstream = %upstream.name, "upstream request timeout");
            }
            Ok(Err(e)) => {
                // A severed inbound connection cancels this whole task by
                // drop, so any error seen here is an upstream-side failure.
                last_err = format!("network error: {e}");
                tracing::warn!(upstream = %upstream.name, error = %e, "upstream network error");
            }
            Ok(Ok(resp)) => {
                let status = resp.status();
                let flaky = status == StatusCode::UNAUTHORIZED
                    || status == StatusCode::TOO_MANY_REQUESTS
                    || status.is_server_error();
                if !flaky {
                    return relay(resp);
                }

                tracing::warn!(
                    upstream = %upstream.name,
                    status = status.as_u16(),
                    key = %mask_key(&key),
                    "upstream rejected credential, cooling it down"
                );
                state.mark_cooldown(&key, now + srv.cool_down_minutes * 60_000);

                let alert = format!(
                    "⚠️ [llmgate alert]\nUpstream: {}\nStatus: {}\nKey: {}\nProject: {}\nModel: {}\nTime: {}",
                    upstream.name,
                    status.as_u16(),
                    mask_key(&key),
                    project,
                    model,
                    chrono::Local::now().format("%H:%M:%S"),
                );
                state
                    .notifier
                    .notify(webhook, &upstream.name, model, status.as_u16(), alert);

                // Dropping the response closes the upstream body.
                last_err = format!("upstream status {}", status.as_u16());
            }
        }

        if attempt < srv.max_retries {
            tokio::time::sleep(RETRY_BACKOFF).await;
        }
    }

    let fail_alert = format!(
        "❌ [llmgate failure]\nAll retries exhausted.\nProject: {project}\nModel: {model}\nUpstream: {}\nLast error: {last_err}",
        upstream.name,
    );
    state
        .notifier
        .notify(webhook, &upstream.name, model, 0, fail_alert);

    GateState::json_error(
        StatusCode::SERVICE_UNAVAILABLE,
        &format!("Retries exhausted. Last error: {last_err}"),
    )
}

/// Relay the upstream response, stripping hop-by-hop headers and streaming
/// the body through without buffering. `X-Accel-Buffering: no` keeps
/// intermediaries from batching server-sent events.
fn relay(up_resp: Response<Body>) -> Response<Body> {
    let (mut parts, body) = up_resp.into_parts();

    let mut headers = hyper::HeaderMap::new();
    copy_end_to_end_headers(&parts.headers, &mut headers);
    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
    parts.headers = headers;

    let relayed = body.map(|chunk| {
        chunk.map_err(|e| {
            tracing::warn!(error = %e, "response relay failed");
            std::io::Error::new(std::io::ErrorKind::Other, e)
        })
    });
    Response::from_parts(parts, Body::wrap_stream(relayed))
}
