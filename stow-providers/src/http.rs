// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared HTTP plumbing for the HTTP-based drivers

use chrono::{DateTime, Utc};
use futures::StreamExt;
use reqwest::{redirect, Client, Response, StatusCode};
use std::net::IpAddr;
use std::time::Duration;

use stow_core::{ByteStream, ResolvedEndpoint, StowError, StowResult};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_ERROR_BODY: usize = 512;

/// Client that never follows redirects and only connects to the validated
/// addresses of each endpoint
pub(crate) fn pinned_client(endpoints: &[ResolvedEndpoint]) -> StowResult<Client> {
    let mut builder = Client::builder()
        .redirect(redirect::Policy::none())
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(concat!("stowage/", env!("CARGO_PKG_VERSION")));

    for endpoint in endpoints {
        if endpoint.host.parse::<IpAddr>().is_err() && !endpoint.addrs.is_empty() {
            builder = builder.resolve_to_addrs(&endpoint.host, &endpoint.addrs);
        }
    }

    builder
        .build()
        .map_err(|e| StowError::InvalidConfig(format!("http client: {e}")))
}

pub(crate) fn network(err: reqwest::Error) -> StowError {
    if err.is_timeout() {
        StowError::Timeout(err.to_string())
    } else {
        StowError::Network(err.to_string())
    }
}

/// Map a non-success response to the error taxonomy
pub(crate) async fn status_error(provider: &str, path: &str, response: Response) -> StowError {
    let status = response.status();
    match status {
        StatusCode::NOT_FOUND => StowError::NotFound(path.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StowError::PermissionDenied(format!("{path} ({status})"))
        }
        StatusCode::INSUFFICIENT_STORAGE => StowError::StorageFull(path.to_string()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            StowError::Timeout(format!("{path} ({status})"))
        }
        _ if status.is_redirection() => StowError::ProviderApi {
            provider: provider.to_string(),
            message: format!("{status}: redirects are not followed"),
        },
        _ => {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            StowError::ProviderApi {
                provider: provider.to_string(),
                message: format!("{status}: {}", body.trim()),
            }
        }
    }
}

pub(crate) fn body_stream(response: Response) -> ByteStream {
    Box::pin(response.bytes_stream().map(|chunk| chunk.map_err(network)))
}

/// HTTP dates show up in RFC 2822, RFC 3339 and asctime forms
pub(crate) fn parse_http_date(s: &str) -> Option<DateTime<Utc>> {
    let s = s.trim();
    if let Ok(dt) = DateTime::parse_from_rfc2822(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%a, %d %b %Y %H:%M:%S GMT", "%A, %d-%b-%y %H:%M:%S GMT", "%a %b %e %H:%M:%S %Y"]
        .iter()
        .find_map(|fmt| chrono::NaiveDateTime::parse_from_str(s, fmt).ok())
        .map(|dt| DateTime::from_naive_utc_and_offset(dt, Utc))
}
