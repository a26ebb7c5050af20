//! Preview reverse proxy (§6): forwards requests under `/preview/:port/*` to
//! a local dev server and rewrites root-relative references in HTML so the
//! browser keeps asking this server rather than `127.0.0.1:<port>` directly.

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::warn;

use crate::auth;
use crate::state::AppState;

pub async fn proxy(
    State(state): State<AppState>,
    Path((port, rest)): Path<(u16, String)>,
    headers: HeaderMap,
) -> Response {
    let target = format!("http://127.0.0.1:{port}/{rest}");

    let client = reqwest::Client::new();
    let mut request = client.get(&target);
    if let Some(accept) = headers.get(header::ACCEPT) {
        request = request.header(header::ACCEPT, accept.clone());
    }

    let upstream = match request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(port, error = %e, "preview proxy upstream request failed");
            return (
                StatusCode::BAD_GATEWAY,
                format!("preview target on port {port} is unreachable"),
            )
                .into_response();
        }
    };

    let status = upstream.status();
    let content_type = upstream
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let is_html = content_type.starts_with("text/html");
    let prefix = format!("/preview/{port}/");

    let mut response = if is_html {
        let body = match upstream.text().await {
            Ok(text) => rewrite_absolute_paths(&text, &prefix),
            Err(e) => {
                warn!(port, error = %e, "failed to read preview upstream body");
                return (StatusCode::BAD_GATEWAY, "failed to read upstream body").into_response();
            }
        };
        (
            status,
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            body,
        )
            .into_response()
    } else {
        let bytes = match upstream.bytes().await {
            Ok(b) => b,
            Err(e) => {
                warn!(port, error = %e, "failed to read preview upstream body");
                return (StatusCode::BAD_GATEWAY, "failed to read upstream body").into_response();
            }
        };
        let mut builder = Response::builder().status(status);
        if !content_type.is_empty() {
            builder = builder.header(header::CONTENT_TYPE, content_type);
        }
        builder.body(Body::from(bytes)).unwrap().into_response()
    };

    response
        .headers_mut()
        .append(header::SET_COOKIE, auth::auth_cookie(&state).parse().unwrap());
    response
}

/// Rewrite root-relative `href="/..."` and `src="/..."` references so
/// sub-resource requests round-trip back through the same proxy prefix.
fn rewrite_absolute_paths(html: &str, prefix: &str) -> String {
    let mut rewritten = html.to_string();
    for attr in ["href=\"/", "src=\"/", "href='/", "src='/"] {
        let opening = &attr[..attr.len() - 1]; // drop the trailing '/', keep the quote
        let replacement = format!("{opening}{prefix}");
        rewritten = rewritten.replace(attr, &replacement);
    }
    rewritten
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrites_absolute_href_and_src() {
        let html = r#"<link href="/style.css"><script src="/bundle.js"></script>"#;
        let rewritten = rewrite_absolute_paths(html, "/preview/5173/");
        assert!(rewritten.contains(r#"href="/preview/5173/style.css""#));
        assert!(rewritten.contains(r#"src="/preview/5173/bundle.js""#));
    }

    #[test]
    fn leaves_relative_and_external_references_untouched() {
        let html = r#"<a href="./about">about</a><img src="https://cdn.example/a.png">"#;
        let rewritten = rewrite_absolute_paths(html, "/preview/3000/");
        assert_eq!(rewritten, html);
    }
}
