//! Discord REST transport backed by reqwest.
//!
//! Serenity keeps the gateway connection; every REST call the bot makes goes
//! through this transport so the governor sees all of them.

use super::{ApiRequest, ApiResponse, Method, Transport, TransportError};
use async_trait::async_trait;
use log::{debug, warn};
use reqwest::header::{HeaderMap, AUTHORIZATION, USER_AGENT};
use reqwest::StatusCode;
use serde::Deserialize;
use std::time::Duration;

/// Used when a 429 carries no usable retry-after
const FALLBACK_RETRY_AFTER: Duration = Duration::from_secs(1);

/// Longest retry-after honoured; larger values are clamped
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

const BOT_USER_AGENT: &str = concat!(
    "DiscordBot (https://github.com/gatekeeper-bot/gatekeeper, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Body Discord sends with a 429
#[derive(Debug, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

pub struct DiscordHttpTransport {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl DiscordHttpTransport {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        DiscordHttpTransport {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url_for(&self, route: &str) -> String {
        if route.starts_with('/') {
            format!("{}{}", self.base_url, route)
        } else {
            format!("{}/{}", self.base_url, route)
        }
    }
}

fn to_reqwest_method(method: Method) -> reqwest::Method {
    match method {
        Method::Get => reqwest::Method::GET,
        Method::Post => reqwest::Method::POST,
        Method::Put => reqwest::Method::PUT,
        Method::Patch => reqwest::Method::PATCH,
        Method::Delete => reqwest::Method::DELETE,
    }
}

/// Work out the retry delay and scope of a 429 from headers and body.
/// The body value wins because it carries sub-second precision.
fn classify_rate_limit(headers: &HeaderMap, body: Option<&RateLimitBody>) -> TransportError {
    let header_secs = headers
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<f64>().ok());
    let header_global = headers
        .get("x-ratelimit-global")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let secs = body.and_then(|b| b.retry_after).or(header_secs);
    let retry_after = match secs {
        Some(secs) if secs >= 0.0 => Duration::try_from_secs_f64(secs)
            .map(|d| d.min(MAX_RETRY_AFTER))
            .unwrap_or(MAX_RETRY_AFTER),
        _ => FALLBACK_RETRY_AFTER,
    };

    TransportError::RateLimited {
        retry_after,
        global: header_global || body.map(|b| b.global).unwrap_or(false),
    }
}

#[async_trait]
impl Transport for DiscordHttpTransport {
    async fn execute(&self, request: &ApiRequest) -> Result<ApiResponse, TransportError> {
        let url = self.url_for(&request.route);
        let mut builder = self
            .client
            .request(to_reqwest_method(request.method), &url)
            .header(AUTHORIZATION, format!("Bot {}", self.token))
            .header(USER_AGENT, BOT_USER_AGENT);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| TransportError::Failure {
            status: None,
            message: e.to_string(),
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let headers = response.headers().clone();
            let body = response.json::<RateLimitBody>().await.ok();
            let classified = classify_rate_limit(&headers, body.as_ref());
            warn!("Discord rate limited {request}: {classified}");
            return Err(classified);
        }

        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(TransportError::Failure {
                status: Some(status.as_u16()),
                message: if text.is_empty() {
                    status.to_string()
                } else {
                    text
                },
            });
        }

        let body = if status == StatusCode::NO_CONTENT {
            None
        } else {
            response.json::<serde_json::Value>().await.ok()
        };
        debug!("{request} -> {}", status.as_u16());

        Ok(ApiResponse {
            status: status.as_u16(),
            body,
        })
    }
}
