//! Production [`HttpTransport`] backed by `reqwest`.
//!
//! One `reqwest::Client` is built per (proxy, redirect policy) pair and
//! reused, so connection pools survive across requests through the same hop.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use dashmap::DashMap;

use super::{HttpError, HttpRequest, HttpResponse, HttpTransport, Method};
use crate::resilience::ProxyEndpoint;
use crate::resilience::throttle::parse_retry_after;

const MAX_REDIRECTS: usize = 10;

#[derive(Debug, Default)]
pub struct ReqwestTransport {
    clients: DashMap<(ProxyEndpoint, bool), reqwest::Client>,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn client_for(&self, proxy: &ProxyEndpoint, follow_redirects: bool) -> Result<reqwest::Client, HttpError> {
        let key = (proxy.clone(), follow_redirects);
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }

        let redirect = if follow_redirects {
            reqwest::redirect::Policy::limited(MAX_REDIRECTS)
        } else {
            reqwest::redirect::Policy::none()
        };
        let mut builder = reqwest::Client::builder()
            .redirect(redirect)
            .connect_timeout(Duration::from_secs(15));
        if let Some(url) = proxy.url() {
            let proxy_cfg = reqwest::Proxy::all(url).map_err(|e| HttpError::Other {
                url: proxy.label().to_string(),
                message: format!("invalid proxy: {e}"),
            })?;
            builder = builder.proxy(proxy_cfg);
        } else {
            builder = builder.no_proxy();
        }
        let client = builder.build().map_err(|e| HttpError::Other {
            url: proxy.label().to_string(),
            message: format!("failed to build HTTP client: {e}"),
        })?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }
}

fn map_error(url: &str, err: reqwest::Error) -> HttpError {
    if err.is_timeout() {
        HttpError::Timeout {
            url: url.to_string(),
        }
    } else if err.is_connect() {
        HttpError::Connect {
            url: url.to_string(),
            message: err.to_string(),
        }
    } else {
        HttpError::Other {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

impl HttpTransport for ReqwestTransport {
    fn execute<'a>(
        &'a self,
        request: &'a HttpRequest,
        proxy: &'a ProxyEndpoint,
    ) -> Pin<Box<dyn Future<Output = Result<HttpResponse, HttpError>> + Send + 'a>> {
        Box::pin(async move {
            let client = self.client_for(proxy, request.follow_redirects)?;
            let mut builder = match request.method {
                Method::Get => client.get(&request.url),
                Method::Post => client.post(&request.url),
            };
            builder = builder.timeout(request.timeout);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(body) = &request.body {
                builder = builder.body(body.clone());
            }

            let resp = builder
                .send()
                .await
                .map_err(|e| map_error(&request.url, e))?;

            let status = resp.status().as_u16();
            let final_url = resp.url().to_string();
            let headers = resp.headers();
            let content_type = headers
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            let retry_after = headers
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = resp
                .bytes()
                .await
                .map_err(|e| map_error(&request.url, e))?
                .to_vec();

            tracing::trace!(url = %request.url, status, proxy = %proxy, "response received");

            Ok(HttpResponse {
                status,
                final_url,
                content_type,
                body,
                retry_after,
            })
        })
    }
}
