use std::net::SocketAddr;

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::Next,
    response::{Html, IntoResponse, Response},
};
use inkhost_ssr::{RuntimeRegistry, ThemeCatalog};

use crate::state::{ADMIN_SCOPE, AppState};

/// Paths that always resolve locally, active SSR theme or not.
const SKIP_EXACT: &[&str] = &[
    "/healthz",
    "/robots.txt",
    "/sitemap.xml",
    "/rss.xml",
    "/feed.xml",
    "/atom.xml",
];

// /static/ and /assets/ are deliberately absent: the active theme owns those.
// Admin UI assets live under dedicated prefixes so they stay local. A cache
// purge prefix (/needcache/) is deliberately omitted too: no cache service
// sits behind this server.
const SKIP_PREFIXES: &[&str] = &[
    "/api/",
    "/admin",
    "/login",
    "/admin-static/",
    "/admin-assets/",
    "/f/",
];

pub fn should_skip_proxy(path: &str) -> bool {
    SKIP_EXACT.contains(&path) || SKIP_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Re-derives the proxy target from scratch: persisted intent first, then the
/// live registry. Both must agree; a flag naming a dead runtime or a runtime
/// the flag no longer names never receives traffic. Never cached, so a crash
/// is reflected on the very next request.
pub async fn resolve_proxy_target(
    catalog: &dyn ThemeCatalog,
    registry: &RuntimeRegistry,
    scope: u32,
) -> Option<(String, u16)> {
    let theme = match catalog.current_theme(scope).await {
        Ok(v) => v?,
        Err(e) => {
            // Catalog trouble degrades to local rendering, not to an error page.
            tracing::warn!(error = %e, "current-theme lookup failed, serving locally");
            return None;
        }
    };

    let entry = registry.get(&theme)?;
    Some((theme, entry.port))
}

/// Per-request routing middleware: forwards front-end requests to the active
/// SSR runtime, falls through to the local pipeline otherwise.
pub async fn ssr_proxy(State(state): State<AppState>, req: Request, next: Next) -> Response {
    if should_skip_proxy(req.uri().path()) {
        return next.run(req).await;
    }

    let Some((theme, port)) =
        resolve_proxy_target(state.catalog.as_ref(), state.supervisor.registry(), ADMIN_SCOPE)
            .await
    else {
        return next.run(req).await;
    };

    match forward(&state, port, req).await {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!(theme, port, error = %e, "ssr proxy request failed");
            unavailable_page(&theme)
        }
    }
}

fn is_hop_by_hop(name: &header::HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn forwarded_headers(req_headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in req_headers {
        // Host is re-derived by the client for the loopback target.
        if name == header::HOST || is_hop_by_hop(name) {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

async fn forward(state: &AppState, port: u16, req: Request) -> anyhow::Result<Response> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let url = format!("http://127.0.0.1:{port}{path_and_query}");

    let client_ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string());
    let original_host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    let (parts, body) = req.into_parts();
    let mut upstream = state
        .http
        .request(parts.method, url)
        .headers(forwarded_headers(&parts.headers))
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    // Preserve client identity for the runtime; some SSR frameworks build
    // absolute URLs from these.
    if let Some(host) = original_host {
        upstream = upstream.header("x-forwarded-host", host);
    }
    if let Some(ip) = client_ip {
        upstream = upstream.header("x-real-ip", ip);
    }

    let resp = upstream.send().await?;

    let mut builder = Response::builder().status(resp.status());
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in resp.headers() {
            if is_hop_by_hop(name) {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
    }
    // Stream the runtime's body through; dropping this response (client went
    // away) cancels the upstream request with it.
    let resp = builder.body(Body::from_stream(resp.bytes_stream()))?;
    Ok(resp)
}

/// Fixed fallback page: a runtime marked current but unreachable must never
/// leak a raw connection error to the visitor.
fn unavailable_page(theme: &str) -> Response {
    let body = format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="utf-8">
    <title>Theme temporarily unavailable</title>
    <style>
        body {{ font-family: -apple-system, BlinkMacSystemFont, sans-serif; text-align: center; padding: 50px; }}
        h1 {{ color: #333; }}
        p {{ color: #666; }}
    </style>
</head>
<body>
    <h1>Theme temporarily unavailable</h1>
    <p>The theme "{theme}" is starting up or ran into a problem. Please retry shortly.</p>
    <p><a href="/admin">Open the admin interface</a></p>
</body>
</html>"#
    );
    (StatusCode::SERVICE_UNAVAILABLE, Html(body)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use inkhost_ssr::registry::RuntimeEntry;

    struct StaticCatalog {
        current: Option<String>,
        fail: bool,
    }

    #[async_trait]
    impl ThemeCatalog for StaticCatalog {
        async fn is_installed(&self, _scope: u32, _theme: &str) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn current_theme(&self, _scope: u32) -> anyhow::Result<Option<String>> {
            if self.fail {
                anyhow::bail!("catalog unavailable");
            }
            Ok(self.current.clone())
        }

        async fn set_current_theme(&self, _scope: u32, _theme: &str) -> anyhow::Result<()> {
            Ok(())
        }

        async fn clear_current_theme(&self, _scope: u32) -> anyhow::Result<()> {
            Ok(())
        }

        async fn current_theme_count(&self, _scope: u32) -> anyhow::Result<usize> {
            Ok(usize::from(self.current.is_some()))
        }
    }

    fn live_entry(port: u16) -> RuntimeEntry {
        RuntimeEntry {
            pid: Some(100),
            pgid: Some(100),
            port,
            started_at: Utc::now(),
        }
    }

    #[test]
    fn exclusion_set_matches_reserved_paths() {
        for path in [
            "/robots.txt",
            "/sitemap.xml",
            "/rss.xml",
            "/feed.xml",
            "/atom.xml",
            "/healthz",
            "/api/posts",
            "/admin",
            "/admin/themes",
            "/admin-static/app.js",
            "/admin-assets/logo.svg",
            "/login",
            "/f/abc123",
        ] {
            assert!(should_skip_proxy(path), "expected local: {path}");
        }
    }

    #[test]
    fn front_end_paths_are_eligible_for_proxying() {
        for path in ["/", "/posts/hello-world", "/static/site.css", "/assets/a.png", "/about"] {
            assert!(!should_skip_proxy(path), "expected proxyable: {path}");
        }
    }

    #[tokio::test]
    async fn no_current_theme_means_no_target() {
        let catalog = StaticCatalog { current: None, fail: false };
        let registry = RuntimeRegistry::default();
        registry.try_insert("nova", live_entry(3001)).unwrap();

        assert!(resolve_proxy_target(&catalog, &registry, 1).await.is_none());
    }

    #[tokio::test]
    async fn flagged_but_dead_theme_never_becomes_a_target() {
        // The persisted flag says "nova" but no live process backs it up.
        let catalog = StaticCatalog {
            current: Some("nova".to_string()),
            fail: false,
        };
        let registry = RuntimeRegistry::default();

        assert!(resolve_proxy_target(&catalog, &registry, 1).await.is_none());
    }

    #[tokio::test]
    async fn agreement_of_flag_and_registry_yields_the_target() {
        let catalog = StaticCatalog {
            current: Some("nova".to_string()),
            fail: false,
        };
        let registry = RuntimeRegistry::default();
        registry.try_insert("nova", live_entry(3001)).unwrap();
        // A second runtime must not shadow the flagged one.
        registry.try_insert("other", live_entry(3009)).unwrap();

        let (theme, port) = resolve_proxy_target(&catalog, &registry, 1).await.unwrap();
        assert_eq!(theme, "nova");
        assert_eq!(port, 3001);
    }

    #[tokio::test]
    async fn catalog_failure_degrades_to_local_rendering() {
        let catalog = StaticCatalog {
            current: Some("nova".to_string()),
            fail: true,
        };
        let registry = RuntimeRegistry::default();
        registry.try_insert("nova", live_entry(3001)).unwrap();

        assert!(resolve_proxy_target(&catalog, &registry, 1).await.is_none());
    }

    #[test]
    fn unavailable_page_is_a_plain_503() {
        let resp = unavailable_page("nova");
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
