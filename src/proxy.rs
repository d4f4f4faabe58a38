//! Reverse-proxy plumbing shared by the latency sidecar and the routing
//! manager.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    response::Response,
};

use crate::error::Result;

/// Forward a request to `base` (scheme://host[:port]), preserving method,
/// path, query, headers and body, and rebuild the upstream response.
pub async fn forward(client: &reqwest::Client, base: &str, req: Request<Body>) -> Result<Response> {
    let path = req.uri().path();
    let query = req
        .uri()
        .query()
        .map(|query| format!("?{query}"))
        .unwrap_or_default();
    let url = format!("{}{}{}", base.trim_end_matches('/'), path, query);

    let method = reqwest::Method::from_bytes(req.method().as_str().as_bytes())
        .unwrap_or(reqwest::Method::GET);
    let original_host = req
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned);

    let mut builder = client.request(method, &url);
    for (name, value) in req.headers() {
        if name == header::HOST || name == header::CONTENT_LENGTH {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    if let Some(host) = original_host {
        builder = builder.header("x-forwarded-host", host);
    }

    let body = axum::body::to_bytes(req.into_body(), usize::MAX).await?;
    let upstream = builder.body(body).send().await?;

    let status =
        StatusCode::from_u16(upstream.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if name == reqwest::header::TRANSFER_ENCODING || name == reqwest::header::CONNECTION {
            continue;
        }
        response = response.header(name.as_str(), value.as_bytes());
    }

    let bytes = upstream.bytes().await?;
    Ok(response.body(Body::from(bytes))?)
}
