//! Error types for the API client, split by layer: transport
//! ([`HttpError`]), API conversation ([`ApiError`]) and credential
//! discovery ([`CredentialError`]).

use std::io;

use http::StatusCode;
use thiserror::Error;

/// Transport-level failures from the HTTP facade and the range downloader.
///
/// These are kept distinct from [`ApiError`] so the session layer can tell
/// a flaky network apart from a server that rejected the request.
#[derive(Debug, Error)]
pub enum HttpError {
    /// DNS failure, refused / reset connection, TLS error, or any other
    /// failure below the HTTP layer.
    #[error("Could not retrieve URL {url}: {source}")]
    Transport {
        url: String,
        source: reqwest::Error,
    },

    #[error(
        "Request timed out after specified timeout period of {timeout} seconds"
    )]
    Timeout { timeout: u64 },

    #[error("Unexpected status {status} for {url}")]
    Status { url: String, status: StatusCode },

    /// A downloader parameter outside its accepted range.
    #[error("{0}")]
    InvalidParameter(&'static str),

    /// The server did not report a size for the artifact, so it cannot be
    /// partitioned into range requests.
    #[error("Content length not set")]
    ContentLengthNotSet,

    #[error(
        "Failed to retrieve header information for {url} after {retries} \
         retries"
    )]
    HeadRetriesExhausted { url: String, retries: u32 },

    #[error("Downloading of block failed after {retries} retries")]
    BlockRetriesExhausted { retries: u32 },

    #[error("Failed to write downloaded data: {0}")]
    Write(#[from] io::Error),
}

/// Failures in the conversation with the remote API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Transport kept failing; see the preceding warnings for the causes.
    #[error("Failed to complete API request")]
    RetriesExhausted,

    /// The response body was not the UTF-8 JSON the API promises.
    #[error("Failed to decode result: {0}")]
    Decode(String),

    /// The response body carried an `error` field.
    #[error("API reported error: {0}")]
    Server(String),

    #[error("API response is missing the '{0}' field")]
    MissingField(&'static str),

    /// The submit response did not carry a `Location` to poll.
    #[error("No job location returned by the API")]
    MissingLocation,

    #[error("Request has no '{0}' parameter")]
    MissingParameter(&'static str),

    #[error(
        "API credentials contain characters that are not valid in HTTP \
         headers"
    )]
    InvalidCredentials,

    #[error("Failed to open target file {path}: {source}")]
    Target { path: String, source: io::Error },

    #[error("Transfer failed: {0}")]
    Download(#[from] HttpError),

    #[error("{failed} of {total} requests failed")]
    RequestsFailed { failed: usize, total: usize },
}

/// No usable `(url, key, email)` triple could be found.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Could not get the API credentials from the environment")]
    Environment,

    #[error("Failed to read '{path}': {source}")]
    Read { path: String, source: io::Error },

    #[error("Missing or malformed API key in '{path}'")]
    Malformed { path: String },

    #[error("No API credentials found in the environment or ~/.ecmwfapirc")]
    NotFound,
}
