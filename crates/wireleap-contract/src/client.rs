//! The retrying HTTP client.

use serde::{de::DeserializeOwned, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::debug;
use url::Url;
use wireleap_proto::Status;

use crate::Error;

/// How many times a request is attempted before giving up.
const TRIES: u32 = 3;
/// Delay between attempts.
const RETRY_DELAY: Duration = Duration::from_millis(150);

/// HTTP client for contract and directory endpoints.
///
/// Wraps `reqwest` with a bounded retry loop and decodes contract error
/// bodies (`Status` frames) into typed errors.  When the TUN forwarder is
/// in use, the client must be built with DNS pins so that every request
/// lands on an address covered by a bypass route.
#[derive(Debug, Clone)]
pub struct ApiClient {
    /// The underlying HTTP client.
    http: reqwest::Client,
}

impl ApiClient {
    /// Create a client that uses the system resolver.
    pub fn new(timeout: Duration) -> Self {
        ApiClient {
            http: Self::builder(timeout).build().unwrap_or_default(),
        }
    }

    /// Create a client with pinned resolutions: requests to each named
    /// host connect only to the given addresses.
    pub fn pinned<'a, I>(timeout: Duration, pins: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a [SocketAddr])>,
    {
        let mut b = Self::builder(timeout);
        for (host, addrs) in pins {
            b = b.resolve_to_addrs(host, addrs);
        }
        ApiClient {
            http: b.build().unwrap_or_default(),
        }
    }

    /// Common builder settings.
    fn builder(timeout: Duration) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(format!("wireleap/{}", wireleap_proto::CLIENT_VERSION))
    }

    /// Perform a GET request and decode the JSON response.
    pub async fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, Error> {
        let resp = self
            .perform(|| self.http.get(url.clone()).send(), url)
            .await?;
        resp.json()
            .await
            .map_err(|e| decode_err(url, e))
    }

    /// Download raw bytes (used for accesskey bundle import).
    pub async fn get_bytes(&self, url: &Url) -> Result<Vec<u8>, Error> {
        let resp = self
            .perform(|| self.http.get(url.clone()).send(), url)
            .await?;
        Ok(resp
            .bytes()
            .await
            .map_err(|e| decode_err(url, e))?
            .to_vec())
    }

    /// Perform a POST request with a JSON body and decode the JSON
    /// response.
    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        url: &Url,
        body: &B,
    ) -> Result<T, Error> {
        let resp = self
            .perform(|| self.http.post(url.clone()).json(body).send(), url)
            .await?;
        resp.json()
            .await
            .map_err(|e| decode_err(url, e))
    }

    /// Run `send` up to [`TRIES`] times; convert error responses into
    /// `Status` errors.
    async fn perform<F, Fut>(&self, mut send: F, url: &Url) -> Result<reqwest::Response, Error>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<reqwest::Response, reqwest::Error>>,
    {
        let mut last_err = None;
        for attempt in 1..=TRIES {
            match send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => return Err(Error::Status(status_from_response(resp).await)),
                Err(e) => {
                    debug!("request to {} failed (attempt {}/{}): {}", url, attempt, TRIES, e);
                    last_err = Some(e);
                    if attempt < TRIES {
                        tokio::time::sleep(RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(Error::Request {
            url: url.to_string(),
            // last_err is always set when we fall out of the loop.
            source: last_err.ok_or_else(|| unreachable_transport_error(url))?,
        })
    }
}

/// Decode an error response body into a `Status`, synthesizing one from
/// the HTTP status line if the body is not a status frame.
async fn status_from_response(resp: reqwest::Response) -> Status {
    let code = resp.status().as_u16();
    let reason = resp
        .status()
        .canonical_reason()
        .unwrap_or("error")
        .to_owned();
    match resp.bytes().await.ok().and_then(|b| serde_json::from_slice::<Status>(&b).ok()) {
        Some(status) => status,
        None => Status {
            code,
            desc: reason,
            origin: None,
        },
    }
}

/// Construct a Decode error.
fn decode_err(url: &Url, source: reqwest::Error) -> Error {
    Error::Decode {
        url: url.to_string(),
        source,
    }
}

/// Helper for the unreachable no-error case of the retry loop.
fn unreachable_transport_error(url: &Url) -> Error {
    Error::Status(Status {
        code: 500,
        desc: format!("retry loop for {} ended without an error", url),
        origin: None,
    })
}
