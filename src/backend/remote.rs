//! HTTP-upstream backend (`spec.md` §4.5, §6 "Wire (gateway ↔ remote
//! origin)"): forwards to an upstream Git smart-HTTP origin via `reqwest`.
//!
//! Grounded in `minionrt-cli`'s `git-proxy::routes::remote_info_refs` /
//! `remote_git_receive_pack` — issue the equivalent request upstream, copy
//! status/headers/body back — generalized from its fixed advertise/push
//! split into the single `serve` entry point `spec.md` specifies.

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use futures_util::TryStreamExt;
use reqwest::Client;
use std::sync::OnceLock;
use tracing::{debug, error};

use crate::context::{Context, ResponseBody};
use crate::error::GatewayError;

fn client() -> &'static Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();
    CLIENT.get_or_init(|| {
        Client::builder()
            .user_agent(concat!("git-gateway-core/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client builds with static configuration")
    })
}

/// `checkIfExists`/`checkIfEnabled`, remote branch: `status == 200` for a
/// plain `HEAD` request.
pub async fn check_status_ok(url: &str) -> bool {
    match client().head(url).send().await {
        Ok(resp) => resp.status() == StatusCode::OK,
        Err(e) => {
            debug!(url, error = %e, "remote HEAD probe failed");
            false
        }
    }
}

fn forward_headers(headers: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        if matches!(
            name.as_str(),
            "host" | "content-length" | "connection"
        ) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(name, value);
        }
    }
    out
}

/// `serve`, remote branch: `advertisement ? GET : POST` to `url`, body and
/// headers forwarded verbatim, upstream status/headers/streaming body
/// copied onto the response.
pub async fn serve(url: &str, ctx: &Context) -> Result<(), GatewayError> {
    let method = if ctx.advertisement() { Method::GET } else { Method::POST };
    let mut request = client()
        .request(
            reqwest::Method::from_bytes(method.as_str().as_bytes()).expect("GET/POST are valid"),
            url,
        )
        .headers(forward_headers(ctx.headers()));

    if !ctx.advertisement() {
        if let Some(body) = ctx.take_body().await {
            request = request.body(reqwest::Body::wrap_stream(body));
        }
    }

    let response = request.send().await.map_err(|e| GatewayError::BackendFailure { inner: e.into() })?;

    let status = response.status();
    debug!(url, status = status.as_u16(), "remote backend responded");

    ctx.set_response_status(
        StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
    );

    for (name, value) in response.headers() {
        if matches!(name.as_str(), "connection" | "transfer-encoding") {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            ctx.insert_response_header(name, value);
        }
    }

    let stream = response
        .bytes_stream()
        .map_err(|e| {
            error!(error = %e, "remote backend body stream failed");
            std::io::Error::other(e)
        });
    ctx.set_response_body(ResponseBody::Stream(Box::pin(stream)));

    Ok(())
}
