//! Client for the ECMWF data-retrieval API.
//!
//! The API is asynchronous on the server side: a submitted request becomes a
//! job which is polled until it reports `complete`, at which point the result
//! artifact is downloaded to a local file using range requests, with retries
//! on transient failures.
//!
//! The main entry point is [`Client`], which drives one or many requests
//! either sequentially or through a bounded worker pool:
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use ecmwf_api::{Client, RequestParams};
//!
//! let client = Client::from_env()?;
//! let mut request = RequestParams::new();
//! request.insert("dataset".to_owned(), "s2s".to_owned());
//! request.insert("date".to_owned(), "2015-01-01".to_owned());
//! request.insert("target".to_owned(), "output.grib".to_owned());
//! client.retrieve(vec![request]).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod credentials;
pub mod download;
pub mod error;
pub mod http;
pub mod session;

pub use client::{Client, ClientOptions};
pub use credentials::Credentials;
pub use error::{ApiError, CredentialError, HttpError};
pub use session::{ApiSession, RequestParams};
