//! Robust artifact download using HTTP range requests.
//!
//! The artifact is split into fixed-size blocks, each fetched with its own
//! `Range` request and retried independently, so one flaky block never
//! restarts the whole transfer. [`fetch_file`] downloads blocks in order;
//! [`fetch_file_parallel`] fans the block fetches out to worker tasks while
//! a single writer reassembles them, so the bytes reaching the sink are
//! identical to a serial download.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use bytes::Bytes;
use http::{
    header::{HeaderValue, CONTENT_LENGTH, RANGE},
    HeaderMap,
};
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::{mpsc, Mutex},
};
use tracing::warn;

use crate::{error::HttpError, http::HttpClient};

/// Smallest accepted block size.
pub const MIN_BLOCK_SIZE: u64 = 512;
/// Largest accepted block size (256 MiB).
pub const MAX_BLOCK_SIZE: u64 = 268_435_456;
/// Default number of parallel block fetchers.
pub const DEFAULT_WORKERS: usize = 5;

const MIN_TIMEOUT_SECS: u64 = 1;
const MAX_TIMEOUT_SECS: u64 = 86_400;
/// Retries for the initial HEAD request, connect and timeout errors only.
const HEAD_RETRIES: u32 = 5;
/// Attempts for each block before the download is failed.
const BLOCK_ATTEMPTS: u32 = 7;

/// Tuning knobs for a download. The defaults match the upstream service:
/// 1 MiB blocks and a 20 second per-block timeout.
#[derive(Clone, Debug)]
pub struct DownloadOptions {
    /// Size of individual range requests, in bytes.
    pub block_size: u64,
    /// Timeout for each HTTP call, in seconds.
    pub timeout_secs: u64,
    /// Skip TLS certificate validation.
    pub disable_ssl_validation: bool,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            block_size: 1_048_576,
            timeout_secs: 20,
            disable_ssl_validation: false,
        }
    }
}

/// One contiguous byte range of the artifact, fetched with a single
/// `Range` request. Blocks partition `[0, content_length)` in id order;
/// `end` is inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Block {
    id: u64,
    start: u64,
    end: u64,
}

/// Downloads `url` to `sink`, fetching blocks strictly in order. Returns
/// the artifact's content length.
pub async fn fetch_file<W>(
    url: &str,
    sink: &mut W,
    options: &DownloadOptions,
) -> Result<u64, HttpError>
where
    W: AsyncWrite + Unpin,
{
    validate(options)?;
    let client = HttpClient::new(options.disable_ssl_validation);
    let timeout = Duration::from_secs(options.timeout_secs);

    let content_length = fetch_content_length(&client, url, timeout).await?;
    for block in partition(content_length, options.block_size) {
        let bytes = fetch_block(&client, url, block, timeout).await?;
        sink.write_all(&bytes).await?;
    }
    sink.flush().await?;
    Ok(content_length)
}

/// Like [`fetch_file`], but fans block fetches out to `workers` tasks.
/// The sink still receives the blocks in ascending id order.
pub async fn fetch_file_parallel<W>(
    url: &str,
    sink: &mut W,
    options: &DownloadOptions,
    workers: usize,
) -> Result<u64, HttpError>
where
    W: AsyncWrite + Unpin,
{
    validate(options)?;
    let workers = workers.max(1);
    let client = HttpClient::new(options.disable_ssl_validation);
    let timeout = Duration::from_secs(options.timeout_secs);

    let content_length = fetch_content_length(&client, url, timeout).await?;
    let blocks = partition(content_length, options.block_size);
    let total = blocks.len() as u64;
    if total == 0 {
        sink.flush().await?;
        return Ok(content_length);
    }

    // Pre-fill the work queue and drop the sender: once the queue runs dry
    // each fetcher observes `None` and exits.
    let (work_tx, work_rx) = mpsc::channel(blocks.len());
    for block in blocks {
        work_tx
            .send(block)
            .await
            .expect("Queue capacity equals the block count");
    }
    drop(work_tx);
    let work_rx = Arc::new(Mutex::new(work_rx));

    let (result_tx, mut result_rx) =
        mpsc::channel::<(u64, Result<Bytes, HttpError>)>(workers);
    let mut fetchers = Vec::with_capacity(workers);
    for _ in 0..workers {
        let client = client.clone();
        let url = url.to_owned();
        let work_rx = Arc::clone(&work_rx);
        let result_tx = result_tx.clone();
        fetchers.push(tokio::spawn(async move {
            while let Some(block) = next_item(&work_rx).await {
                let result = fetch_block(&client, &url, block, timeout).await;
                let failed = result.is_err();
                // The writer dropping its receiver is the abort signal.
                if result_tx.send((block.id, result)).await.is_err() || failed
                {
                    break;
                }
            }
        }));
    }
    drop(result_tx);

    // Reassemble: buffer out-of-order blocks, write the next expected id
    // as soon as it is available.
    let mut pending = BTreeMap::new();
    let mut next_id = 0u64;
    let mut outcome = Ok(());
    while next_id < total && outcome.is_ok() {
        match result_rx.recv().await {
            Some((id, Ok(bytes))) => {
                pending.insert(id, bytes);
                while let Some(bytes) = pending.remove(&next_id) {
                    if let Err(error) = sink.write_all(&bytes).await {
                        outcome = Err(HttpError::Write(error));
                        break;
                    }
                    next_id += 1;
                }
            }
            Some((_, Err(error))) => outcome = Err(error),
            None => {
                outcome = Err(HttpError::BlockRetriesExhausted {
                    retries: BLOCK_ATTEMPTS,
                })
            }
        }
    }
    drop(result_rx);

    for fetcher in fetchers {
        let _ = fetcher.await;
    }
    outcome?;
    sink.flush().await?;
    Ok(content_length)
}

async fn next_item<T>(queue: &Mutex<mpsc::Receiver<T>>) -> Option<T> {
    queue.lock().await.recv().await
}

fn validate(options: &DownloadOptions) -> Result<(), HttpError> {
    if options.block_size < MIN_BLOCK_SIZE {
        return Err(HttpError::InvalidParameter(
            "The block size should be at least 512 bytes",
        ));
    }
    if options.block_size > MAX_BLOCK_SIZE {
        return Err(HttpError::InvalidParameter(
            "The block size can not be more than 256 megabytes",
        ));
    }
    if options.timeout_secs < MIN_TIMEOUT_SECS {
        return Err(HttpError::InvalidParameter(
            "The timeout should be at least 1 second",
        ));
    }
    if options.timeout_secs > MAX_TIMEOUT_SECS {
        return Err(HttpError::InvalidParameter(
            "The timeout can not be more than 86400 seconds",
        ));
    }
    Ok(())
}

fn partition(content_length: u64, block_size: u64) -> Vec<Block> {
    let mut blocks = Vec::new();
    let mut start = 0;
    let mut id = 0;
    while start < content_length {
        let end = content_length.min(start + block_size) - 1;
        blocks.push(Block { id, start, end });
        start = end + 1;
        id += 1;
    }
    blocks
}

/// Issues the initial HEAD request and reads `Content-Length`. Connect and
/// timeout errors are retried; anything else fails immediately, as does a
/// response without a length (no ranges can be computed from it).
async fn fetch_content_length(
    client: &HttpClient,
    url: &str,
    timeout: Duration,
) -> Result<u64, HttpError> {
    let mut retries = 0;
    let response = loop {
        if retries > 0 {
            warn!(
                "Failed to retrieve header information, retry {retries} of \
                 {HEAD_RETRIES}"
            );
        }
        match client.head(url, HeaderMap::new(), timeout).await {
            Ok(response) => break response,
            Err(error) => {
                if !is_head_retriable(&error) {
                    return Err(error);
                }
                retries += 1;
                if retries > HEAD_RETRIES {
                    return Err(HttpError::HeadRetriesExhausted {
                        url: url.to_owned(),
                        retries: HEAD_RETRIES,
                    });
                }
            }
        }
    };

    response
        .headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or(HttpError::ContentLengthNotSet)
}

fn is_head_retriable(error: &HttpError) -> bool {
    match error {
        HttpError::Timeout { .. } => true,
        HttpError::Transport { source, .. } => source.is_connect(),
        _ => false,
    }
}

/// Fetches one block with up to [`BLOCK_ATTEMPTS`] attempts. Any failure
/// counts, including non-2xx statuses.
async fn fetch_block(
    client: &HttpClient,
    url: &str,
    block: Block,
    timeout: Duration,
) -> Result<Bytes, HttpError> {
    let mut headers = HeaderMap::new();
    let range = format!("bytes={}-{}", block.start, block.end);
    headers.insert(
        RANGE,
        HeaderValue::from_str(&range)
            .expect("A numeric range is a valid header value"),
    );

    let mut attempts = 0;
    loop {
        let result = client.get(url, headers.clone(), timeout).await.and_then(
            |response| {
                if response.status.is_success() {
                    Ok(response.body)
                } else {
                    Err(HttpError::Status {
                        url: url.to_owned(),
                        status: response.status,
                    })
                }
            },
        );
        match result {
            Ok(bytes) => return Ok(bytes),
            Err(error) => {
                attempts += 1;
                if attempts >= BLOCK_ATTEMPTS {
                    return Err(HttpError::BlockRetriesExhausted {
                        retries: BLOCK_ATTEMPTS,
                    });
                }
                warn!("Failed a block, retrying ({error})");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{
        net::SocketAddr,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Mutex as StdMutex,
        },
    };

    use axum::{
        body::Body,
        extract::State,
        http::{header::RANGE, HeaderMap, StatusCode},
        response::{IntoResponse, Response},
        routing::get,
        Router,
    };

    use super::*;

    fn options(block_size: u64) -> DownloadOptions {
        DownloadOptions {
            block_size,
            ..DownloadOptions::default()
        }
    }

    struct Artifact {
        body: Vec<u8>,
        ranges: StdMutex<Vec<String>>,
        get_count: AtomicUsize,
        fail_first: AtomicUsize,
    }

    impl Artifact {
        fn new(body: Vec<u8>) -> Arc<Self> {
            Arc::new(Self {
                body,
                ranges: StdMutex::new(Vec::new()),
                get_count: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
            })
        }
    }

    fn test_body(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn artifact_handler(
        State(artifact): State<Arc<Artifact>>,
        headers: HeaderMap,
    ) -> Response {
        match headers.get(RANGE) {
            Some(range) => {
                let range = range.to_str().unwrap().to_owned();
                artifact.get_count.fetch_add(1, Ordering::SeqCst);
                if artifact
                    .fail_first
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                        n.checked_sub(1)
                    })
                    .is_ok()
                {
                    return StatusCode::INTERNAL_SERVER_ERROR.into_response();
                }
                artifact.ranges.lock().unwrap().push(range.clone());
                let spec = range.strip_prefix("bytes=").unwrap();
                let (start, end) = spec.split_once('-').unwrap();
                let start: usize = start.parse().unwrap();
                let end: usize = end.parse().unwrap();
                (
                    StatusCode::PARTIAL_CONTENT,
                    artifact.body[start..=end].to_vec(),
                )
                    .into_response()
            }
            // HEAD and plain GET: report the full length.
            None => (
                [(CONTENT_LENGTH, artifact.body.len().to_string())],
                artifact.body.clone(),
            )
                .into_response(),
        }
    }

    async fn spawn_artifact_server(artifact: Arc<Artifact>) -> SocketAddr {
        let app = Router::new()
            .route("/artifact", get(artifact_handler))
            .with_state(artifact);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[test]
    fn partition_covers_the_content_exactly() {
        // 3 full blocks and one single-byte tail.
        let blocks = partition(3_145_729, 1_048_576);
        assert_eq!(blocks.len(), 4);
        assert_eq!((blocks[0].start, blocks[0].end), (0, 1_048_575));
        assert_eq!((blocks[1].start, blocks[1].end), (1_048_576, 2_097_151));
        assert_eq!((blocks[2].start, blocks[2].end), (2_097_152, 3_145_727));
        assert_eq!((blocks[3].start, blocks[3].end), (3_145_728, 3_145_728));
        for (index, block) in blocks.iter().enumerate() {
            assert_eq!(block.id, index as u64);
            assert!(block.start <= block.end);
            assert!(block.end - block.start + 1 <= 1_048_576);
        }

        // Shorter than one block: a single range.
        let blocks = partition(100, 1_048_576);
        assert_eq!(blocks.len(), 1);
        assert_eq!((blocks[0].start, blocks[0].end), (0, 99));

        // An exact multiple has no tail block.
        let blocks = partition(1024, 512);
        assert_eq!(blocks.len(), 2);
        assert_eq!((blocks[1].start, blocks[1].end), (512, 1023));

        // Empty content yields no requests at all.
        assert!(partition(0, 512).is_empty());
    }

    #[test]
    fn parameter_validation_boundaries() {
        assert!(validate(&options(511)).is_err());
        assert!(validate(&options(512)).is_ok());
        assert!(validate(&options(MAX_BLOCK_SIZE)).is_ok());
        assert!(validate(&options(MAX_BLOCK_SIZE + 1)).is_err());

        let mut opts = options(512);
        opts.timeout_secs = 0;
        assert!(validate(&opts).is_err());
        opts.timeout_secs = 1;
        assert!(validate(&opts).is_ok());
        opts.timeout_secs = 86_400;
        assert!(validate(&opts).is_ok());
        opts.timeout_secs = 86_401;
        assert!(validate(&opts).is_err());
    }

    #[tokio::test]
    async fn serial_download_issues_ordered_ranges() {
        let body = test_body(3_145_729);
        let artifact = Artifact::new(body.clone());
        let addr = spawn_artifact_server(Arc::clone(&artifact)).await;

        let mut sink = Vec::new();
        let length = fetch_file(
            &format!("http://{addr}/artifact"),
            &mut sink,
            &options(1_048_576),
        )
        .await
        .unwrap();

        assert_eq!(length, 3_145_729);
        assert_eq!(sink, body);
        assert_eq!(
            *artifact.ranges.lock().unwrap(),
            vec![
                "bytes=0-1048575",
                "bytes=1048576-2097151",
                "bytes=2097152-3145727",
                "bytes=3145728-3145728",
            ]
        );
    }

    #[tokio::test]
    async fn parallel_download_matches_serial_output() {
        let body = test_body(300_000);
        let artifact = Artifact::new(body.clone());
        let addr = spawn_artifact_server(Arc::clone(&artifact)).await;
        let url = format!("http://{addr}/artifact");

        let mut parallel = Vec::new();
        let length =
            fetch_file_parallel(&url, &mut parallel, &options(4096), 5)
                .await
                .unwrap();
        assert_eq!(length, 300_000);
        assert_eq!(parallel, body);

        let mut serial = Vec::new();
        fetch_file(&url, &mut serial, &options(4096)).await.unwrap();
        assert_eq!(parallel, serial);
    }

    #[tokio::test]
    async fn empty_artifact_downloads_nothing() {
        let artifact = Artifact::new(Vec::new());
        let addr = spawn_artifact_server(Arc::clone(&artifact)).await;

        let mut sink = Vec::new();
        let length = fetch_file(
            &format!("http://{addr}/artifact"),
            &mut sink,
            &options(512),
        )
        .await
        .unwrap();

        assert_eq!(length, 0);
        assert!(sink.is_empty());
        assert_eq!(artifact.get_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn missing_content_length_fails_before_any_get() {
        // A streamed body has no Content-Length header.
        let get_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&get_count);
        let app = Router::new().route(
            "/artifact",
            get(move |headers: HeaderMap| {
                let counter = Arc::clone(&counter);
                async move {
                    if headers.contains_key(RANGE) {
                        counter.fetch_add(1, Ordering::SeqCst);
                    }
                    Body::from_stream(futures::stream::once(async {
                        Ok::<_, std::io::Error>(Bytes::from_static(b"data"))
                    }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let error = fetch_file(
            &format!("http://{addr}/artifact"),
            &mut Vec::new(),
            &options(512),
        )
        .await
        .unwrap_err();

        assert!(matches!(error, HttpError::ContentLengthNotSet));
        assert_eq!(get_count.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn transient_block_failures_are_retried() {
        let body = test_body(2000);
        let artifact = Artifact::new(body.clone());
        artifact.fail_first.store(2, Ordering::SeqCst);
        let addr = spawn_artifact_server(Arc::clone(&artifact)).await;

        let mut sink = Vec::new();
        fetch_file(&format!("http://{addr}/artifact"), &mut sink, &options(512))
            .await
            .unwrap();

        assert_eq!(sink, body);
        // 4 blocks plus the 2 failed attempts.
        assert_eq!(artifact.get_count.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn unreachable_server_exhausts_head_retries() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let error = fetch_file(
            &format!("http://{addr}/artifact"),
            &mut Vec::new(),
            &options(512),
        )
        .await
        .unwrap_err();

        assert!(matches!(error, HttpError::HeadRetriesExhausted { .. }));
    }
}
