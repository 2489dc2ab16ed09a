//! Executes tunneled requests against their origin.

use std::time::Duration;

use tunnelgate_shared::protocol::{is_hop_by_hop, Credentials, Redirect, TunnelRequest, TunnelResponse};

/// HTTP client for origin requests. Redirects are never followed here:
/// the gateway side decides what to do with them.
pub fn client(timeout: Duration) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(timeout)
        .build()?)
}

/// Headers to send upstream for a request frame.
pub fn outbound_headers(req: &TunnelRequest) -> Vec<(String, String)> {
    let mut headers: Vec<(String, String)> = req
        .headers
        .iter()
        .filter(|(k, _)| !is_hop_by_hop(k))
        .filter(|(k, _)| req.credentials != Credentials::Omit || !k.eq_ignore_ascii_case("cookie"))
        .cloned()
        .collect();

    let bypass_cache = matches!(req.cache.as_deref(), Some("no-store" | "no-cache" | "reload"));
    if bypass_cache && !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case("cache-control")) {
        headers.push(("cache-control".into(), "no-cache".into()));
        headers.push(("pragma".into(), "no-cache".into()));
    }

    headers
}

/// Run one request. Failures come back as a 502 frame, never as an error.
pub async fn execute(client: &reqwest::Client, req: TunnelRequest) -> TunnelResponse {
    if req.redirect != Redirect::Manual {
        tracing::debug!("Request {} asked for {:?} redirects; relay answers manually", req.id, req.redirect);
    }

    let method = match reqwest::Method::from_bytes(req.method.as_bytes()) {
        Ok(m) => m,
        Err(_) => return TunnelResponse::error(req.id, 502, format!("Invalid method '{}'", req.method)),
    };

    let mut builder = client.request(method, &req.url);
    for (k, v) in outbound_headers(&req) {
        builder = builder.header(k, v);
    }
    if let Some(body) = req.body {
        builder = builder.body(body);
    }

    let resp = match builder.send().await {
        Ok(r) => r,
        Err(e) => {
            tracing::warn!("Upstream {} failed: {}", req.url, e);
            return TunnelResponse::error(req.id, 502, format!("Upstream request failed: {}", e));
        }
    };

    let status = resp.status();
    let headers = resp
        .headers()
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();

    match resp.bytes().await {
        Ok(body) => TunnelResponse {
            id: req.id,
            status: status.as_u16(),
            status_text: status.canonical_reason().unwrap_or_default().to_string(),
            headers,
            body: Some(body.to_vec()),
        },
        Err(e) => TunnelResponse::error(req.id, 502, format!("Reading upstream body failed: {}", e)),
    }
}
