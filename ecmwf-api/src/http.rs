//! Thin wrapper around [`reqwest::Client`] producing fully buffered
//! `(status, headers, body)` responses.
//!
//! Redirects are never followed: the API signals job locations through 3xx
//! statuses and `Location` headers which the session layer must see as-is.

use std::time::Duration;

use bytes::Bytes;
use http::{
    header::{HeaderValue, CONTENT_TYPE},
    HeaderMap, StatusCode,
};

use crate::error::HttpError;

/// Default timeout for one API call.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client facade for the API session and the range downloader.
#[derive(Clone, Debug)]
pub struct HttpClient {
    inner: reqwest::Client,
}

/// A fully buffered HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpClient {
    /// Builds a client with redirects disabled. `disable_ssl_validation`
    /// turns off TLS certificate checks for servers with broken chains.
    pub fn new(disable_ssl_validation: bool) -> Self {
        let inner = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(disable_ssl_validation)
            .build()
            .expect("Failed to build reqwest Client");
        Self { inner }
    }

    pub async fn get(
        &self,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<HttpResponse, HttpError> {
        let request = self.inner.get(url).headers(headers).timeout(timeout);
        self.send(url, request, timeout).await
    }

    pub async fn head(
        &self,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<HttpResponse, HttpError> {
        let request = self.inner.head(url).headers(headers).timeout(timeout);
        self.send(url, request, timeout).await
    }

    /// POSTs `body` to `url`. The upstream API expects
    /// `application/x-www-form-urlencoded` as the content type even for
    /// JSON payloads, so that is the default unless the caller set one.
    pub async fn post(
        &self,
        url: &str,
        body: Vec<u8>,
        mut headers: HeaderMap,
        timeout: Duration,
    ) -> Result<HttpResponse, HttpError> {
        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
        }
        let request = self
            .inner
            .post(url)
            .headers(headers)
            .body(body)
            .timeout(timeout);
        self.send(url, request, timeout).await
    }

    pub async fn delete(
        &self,
        url: &str,
        headers: HeaderMap,
        timeout: Duration,
    ) -> Result<HttpResponse, HttpError> {
        let request = self.inner.delete(url).headers(headers).timeout(timeout);
        self.send(url, request, timeout).await
    }

    async fn send(
        &self,
        url: &str,
        request: reqwest::RequestBuilder,
        timeout: Duration,
    ) -> Result<HttpResponse, HttpError> {
        let response = request
            .send()
            .await
            .map_err(|error| transport_error(url, timeout, error))?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|error| transport_error(url, timeout, error))?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn transport_error(
    url: &str,
    timeout: Duration,
    error: reqwest::Error,
) -> HttpError {
    if error.is_timeout() {
        HttpError::Timeout {
            timeout: timeout.as_secs(),
        }
    } else {
        HttpError::Transport {
            url: url.to_owned(),
            source: error,
        }
    }
}
