//! The stateful conversation with the remote API: submit a request, poll
//! the job it becomes, download the result artifact, delete the job.

use std::{
    collections::BTreeMap,
    path::Path,
    time::{Duration, Instant},
};

use http::{
    header::{HeaderName, HeaderValue, ACCEPT, FROM, LOCATION, RETRY_AFTER},
    HeaderMap, StatusCode,
};
use serde_json::Value;
use tokio::{fs::File, time};
use tracing::{debug, info, warn};

use crate::{
    credentials::Credentials,
    download::{self, DownloadOptions},
    error::ApiError,
    http::{HttpClient, DEFAULT_TIMEOUT},
};

/// Attempts for one API call before giving up.
const API_ATTEMPTS: u32 = 7;
/// Pause between failed API call attempts.
const RETRY_PAUSE: Duration = Duration::from_secs(1);
/// Poll interval used until the server supplies a `Retry-After`.
const DEFAULT_RETRY_AFTER_SECS: u64 = 5;
/// Message batch size requested from the API.
const MESSAGE_LIMIT: u32 = 500;

/// Request parameters, handed to the remote API unaltered. Only `dataset`
/// and `target` are interpreted locally.
pub type RequestParams = BTreeMap<String, String>;

#[derive(Clone, Copy)]
enum ApiMethod {
    Get,
    Post,
    Delete,
}

/// One submit → poll → download → delete conversation with the API.
///
/// The session tracks the job's `Location`, the server-requested poll
/// interval, and the offset into the server-side message stream. Consumed
/// messages are never replayed: the offset only grows.
#[derive(Debug)]
pub struct ApiSession {
    http: HttpClient,
    base_url: String,
    service_path: String,
    headers: HeaderMap,
    location: Option<String>,
    retry_after_secs: u64,
    message_offset: u64,
    status: Option<String>,
    done: bool,
    disable_ssl_validation: bool,
}

impl ApiSession {
    /// Opens a session for one request against `service_path` (e.g.
    /// `datasets/s2s` or `services/mars`): verifies the credentials with
    /// `who-am-i` and optionally reports server news.
    pub async fn connect(
        credentials: &Credentials,
        service_path: String,
        report_news: bool,
        disable_ssl_validation: bool,
    ) -> Result<Self, ApiError> {
        let mut session = Self {
            http: HttpClient::new(disable_ssl_validation),
            base_url: credentials.url.trim_end_matches('/').to_owned(),
            service_path,
            headers: request_headers(credentials)?,
            location: None,
            retry_after_secs: DEFAULT_RETRY_AFTER_SECS,
            message_offset: 0,
            status: None,
            done: false,
            disable_ssl_validation,
        };

        info!("Connecting to ECMWF API at {}", session.base_url);

        let url = format!("{}/who-am-i", session.base_url);
        let user = session.api_request(&url, ApiMethod::Get, None).await?;
        match field_to_string(&user, "full_name").filter(|s| !s.is_empty()) {
            Some(full_name) => info!("Registered as {full_name}"),
            None => {
                let uid = field_to_string(&user, "uid").unwrap_or_default();
                info!("Registered as user '{uid}'");
            }
        }

        if report_news {
            let url = format!(
                "{}/{}/news",
                session.base_url, session.service_path
            );
            let news = session.api_request(&url, ApiMethod::Get, None).await?;
            if let Some(news) = news.get("news").and_then(Value::as_str) {
                for item in news.lines().filter(|line| !line.is_empty()) {
                    info!("News: {item}");
                }
            }
        }

        Ok(session)
    }

    /// Submits `request`, polls the job to completion, and (when `target`
    /// is given) downloads the result artifact into it. The server-side
    /// job is deleted afterwards on a best-effort basis.
    pub async fn transfer_request(
        &mut self,
        request: &RequestParams,
        target: Option<&Path>,
    ) -> Result<(), ApiError> {
        let url = format!("{}/{}/requests", self.base_url, self.service_path);
        let mut content =
            self.api_request(&url, ApiMethod::Post, Some(request)).await?;
        info!("Request submitted");
        if let Some(name) = field_to_string(&content, "name") {
            info!("Request id: {name}");
        }
        self.observe_status(&content);

        while !self.done {
            time::sleep(Duration::from_secs(self.retry_after_secs)).await;
            let location =
                self.location.clone().ok_or(ApiError::MissingLocation)?;
            content =
                self.api_request(&location, ApiMethod::Get, None).await?;
            self.observe_status(&content);
        }

        if let Some(target) = target {
            self.download_result(&content, target).await?;
        }

        // Deleting the finished job is a courtesy to the server; a failure
        // here must never mask the transfer result.
        if let Some(location) = self.location.clone() {
            ignore_cleanup_error(
                self.api_request(&location, ApiMethod::Delete, None).await,
            );
        }
        Ok(())
    }

    /// Records the job status from a response body, logging it only when
    /// it changed since the previous observation.
    fn observe_status(&mut self, content: &Value) {
        let Some(status) = content.get("status").and_then(Value::as_str)
        else {
            return;
        };
        if self.status.as_deref() != Some(status) {
            info!("Request is {status}");
            self.status = Some(status.to_owned());
        }
        if status == "complete" {
            self.done = true;
        }
    }

    async fn download_result(
        &self,
        content: &Value,
        target: &Path,
    ) -> Result<(), ApiError> {
        let href = content
            .get("href")
            .and_then(Value::as_str)
            .ok_or(ApiError::MissingField("href"))?;
        let mut file = File::create(target).await.map_err(|source| {
            ApiError::Target {
                path: target.display().to_string(),
                source,
            }
        })?;

        let options = DownloadOptions {
            disable_ssl_validation: self.disable_ssl_validation,
            ..DownloadOptions::default()
        };
        let started = Instant::now();
        let transferred =
            download::fetch_file(href, &mut file, &options).await?;
        let elapsed = started.elapsed();
        if !elapsed.is_zero() {
            let rate = transferred as f64 / elapsed.as_secs_f64();
            info!("Transfer rate {}/s", human_bytes(rate));
        }
        Ok(())
    }

    /// One call against the API. Transport failures are retried up to
    /// [`API_ATTEMPTS`] times with a short pause; the response body must
    /// be JSON and is checked for `error` and `messages` fields. The poll
    /// interval and job location are updated from the response headers.
    async fn api_request(
        &mut self,
        url: &str,
        method: ApiMethod,
        payload: Option<&RequestParams>,
    ) -> Result<Value, ApiError> {
        let url = format!(
            "{}/?offset={}&limit={}",
            url, self.message_offset, MESSAGE_LIMIT
        );
        let body = payload
            .map(|payload| {
                serde_json::to_vec(payload)
                    .expect("A string map always serializes")
            })
            .unwrap_or_default();

        let mut attempts = 0;
        let response = loop {
            let result = match method {
                ApiMethod::Get => {
                    self.http
                        .get(&url, self.headers.clone(), DEFAULT_TIMEOUT)
                        .await
                }
                ApiMethod::Post => {
                    self.http
                        .post(
                            &url,
                            body.clone(),
                            self.headers.clone(),
                            DEFAULT_TIMEOUT,
                        )
                        .await
                }
                ApiMethod::Delete => {
                    self.http
                        .delete(&url, self.headers.clone(), DEFAULT_TIMEOUT)
                        .await
                }
            };
            match result {
                Ok(response) => break response,
                Err(error) => {
                    warn!("Api request failed: {error}");
                    attempts += 1;
                    if attempts >= API_ATTEMPTS {
                        return Err(ApiError::RetriesExhausted);
                    }
                    time::sleep(RETRY_PAUSE).await;
                }
            }
        };

        let content: Value = serde_json::from_slice(&response.body)
            .map_err(|error| ApiError::Decode(error.to_string()))?;

        if let Some(error) = content.get("error") {
            return Err(ApiError::Server(json_to_string(error)));
        }

        if let Some(messages) =
            content.get("messages").and_then(Value::as_array)
        {
            for message in messages {
                info!("API message: {}", json_to_string(message));
            }
            self.message_offset += messages.len() as u64;
        }

        if let Some(retry_after) = response
            .headers
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse().ok())
        {
            self.retry_after_secs = retry_after;
        }

        if matches!(
            response.status,
            StatusCode::CREATED | StatusCode::ACCEPTED
        ) {
            if let Some(location) = response
                .headers
                .get(LOCATION)
                .and_then(|value| value.to_str().ok())
            {
                self.location = Some(location.to_owned());
            }
        }

        Ok(content)
    }
}

fn request_headers(credentials: &Credentials) -> Result<HeaderMap, ApiError> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
    headers.insert(
        FROM,
        HeaderValue::from_str(&credentials.email)
            .map_err(|_| ApiError::InvalidCredentials)?,
    );
    headers.insert(
        HeaderName::from_static("x-ecmwf-key"),
        HeaderValue::from_str(&credentials.key)
            .map_err(|_| ApiError::InvalidCredentials)?,
    );
    Ok(headers)
}

fn ignore_cleanup_error(result: Result<Value, ApiError>) {
    if let Err(error) = result {
        debug!("Ignoring cleanup failure: {error}");
    }
}

/// Renders a JSON field as a bare string: string values lose their quotes,
/// everything else keeps its JSON form.
fn field_to_string(value: &Value, key: &str) -> Option<String> {
    value.get(key).map(json_to_string)
}

fn json_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Formats a byte count (or bytes-per-second rate) in human units.
fn human_bytes(size: f64) -> String {
    const PREFIXES: [&str; 7] = ["", "K", "M", "G", "T", "P", "E"];
    let mut size = size;
    let mut index = 0;
    while size > 1024.0 && index + 1 < PREFIXES.len() {
        size /= 1024.0;
        index += 1;
    }
    let rounded = (size * 100.0).round() / 100.0;
    let plural = if rounded > 1.0 { "s" } else { "" };
    format!("{rounded} {}byte{plural}", PREFIXES[index])
}
