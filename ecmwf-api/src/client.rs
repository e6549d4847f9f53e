//! The request orchestrator: runs one or many retrieval requests, either
//! sequentially or through a bounded worker pool.

use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::{
    sync::{mpsc, Mutex},
    time,
};
use tracing::{error, info, info_span, warn, Instrument};

use crate::{
    credentials::Credentials,
    error::{ApiError, CredentialError},
    session::{ApiSession, RequestParams},
};

/// Pause between enqueueing parallel requests, so the API does not see a
/// burst of first submits.
const DEFAULT_ENQUEUE_STAGGER: Duration = Duration::from_secs(3);

/// Behavior knobs for a [`Client`].
#[derive(Clone, Debug)]
pub struct ClientOptions {
    /// Log news messages published by the API on session start.
    pub report_news: bool,
    /// Skip TLS certificate validation.
    pub disable_ssl_validation: bool,
    /// Pause between enqueueing requests in [`Client::retrieve_parallel`].
    pub enqueue_stagger: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            report_news: true,
            disable_ssl_validation: false,
            enqueue_stagger: DEFAULT_ENQUEUE_STAGGER,
        }
    }
}

/// Drives retrieval requests against the ECMWF API.
///
/// Each request gets its own [`ApiSession`] and a locally assigned request
/// id (starting at 1) which tags all of its log output, so interleaved
/// transfers can be told apart.
#[derive(Clone)]
pub struct Client {
    credentials: Credentials,
    options: ClientOptions,
}

impl Client {
    pub fn new(credentials: Credentials) -> Self {
        Self::with_options(credentials, ClientOptions::default())
    }

    pub fn with_options(
        credentials: Credentials,
        options: ClientOptions,
    ) -> Self {
        Self {
            credentials,
            options,
        }
    }

    /// Builds a client from credentials discovered in the environment or
    /// `~/.ecmwfapirc`.
    pub fn from_env() -> Result<Self, CredentialError> {
        Ok(Self::new(Credentials::discover()?))
    }

    /// Runs the given dataset requests in sequence. Failed requests are
    /// logged and do not stop the remaining ones; the first failure is
    /// returned once all requests have run.
    pub async fn retrieve(
        &self,
        requests: Vec<RequestParams>,
    ) -> Result<(), ApiError> {
        if requests.is_empty() {
            warn!("No requests were given");
            return Ok(());
        }

        let mut first_error = None;
        for (index, request) in requests.into_iter().enumerate() {
            let request_id = (index + 1) as u32;
            if let Err(error) = self.process_request(request, request_id).await
            {
                error!("API connection error: {error}");
                first_error.get_or_insert(error);
            }
        }
        info!("All requests completed");

        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Runs the given dataset requests through `parallel_count` workers.
    /// Each transfer still downloads sequentially; only whole requests run
    /// concurrently. Completion order is not defined.
    pub async fn retrieve_parallel(
        &self,
        requests: Vec<RequestParams>,
        parallel_count: usize,
    ) -> Result<(), ApiError> {
        if requests.is_empty() {
            warn!("No requests were given");
            return Ok(());
        }
        let parallel_count = parallel_count.max(1);
        info!("Launching {parallel_count} workers to process transfers");

        let total = requests.len();
        let (work_tx, work_rx) = mpsc::channel(total);
        let work_rx = Arc::new(Mutex::new(work_rx));
        let failures = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::with_capacity(parallel_count);
        for _ in 0..parallel_count {
            let client = self.clone();
            let work_rx = Arc::clone(&work_rx);
            let failures = Arc::clone(&failures);
            workers.push(tokio::spawn(async move {
                loop {
                    let next = work_rx.lock().await.recv().await;
                    // Queue closure is the stop signal.
                    let Some((request, request_id)) = next else {
                        break;
                    };
                    if let Err(error) =
                        client.process_request(request, request_id).await
                    {
                        error!("API connection error: {error}");
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }

        for (index, request) in requests.into_iter().enumerate() {
            work_tx
                .send((request, (index + 1) as u32))
                .await
                .expect("Queue capacity equals the request count");
            time::sleep(self.options.enqueue_stagger).await;
        }
        drop(work_tx);

        for worker in workers {
            let _ = worker.await;
        }
        info!("All requests completed");

        let failed = failures.load(Ordering::Relaxed);
        if failed > 0 {
            return Err(ApiError::RequestsFailed { failed, total });
        }
        Ok(())
    }

    /// Runs one request against a named service (e.g. `mars`), writing the
    /// result to `target`.
    pub async fn execute(
        &self,
        service: &str,
        request: RequestParams,
        target: &std::path::Path,
    ) -> Result<(), ApiError> {
        let span = info_span!("(service)", service);
        async {
            info!("Starting request");
            let mut session = ApiSession::connect(
                &self.credentials,
                format!("services/{service}"),
                self.options.report_news,
                self.options.disable_ssl_validation,
            )
            .await?;
            session.transfer_request(&request, Some(target)).await
        }
        .instrument(span)
        .await
    }

    /// Runs one dataset request. The `dataset` parameter selects the API
    /// path; `target`, when present, selects the local output file.
    async fn process_request(
        &self,
        request: RequestParams,
        request_id: u32,
    ) -> Result<(), ApiError> {
        let span = info_span!("(request)", id = request_id);
        async {
            info!("Starting request {request_id}");
            let dataset = request
                .get("dataset")
                .ok_or(ApiError::MissingParameter("dataset"))?;
            let service_path = format!("datasets/{dataset}");
            let target = request.get("target").map(PathBuf::from);

            let mut session = ApiSession::connect(
                &self.credentials,
                service_path,
                self.options.report_news,
                self.options.disable_ssl_validation,
            )
            .await?;
            session.transfer_request(&request, target.as_deref()).await
        }
        .instrument(span)
        .await
    }
}
