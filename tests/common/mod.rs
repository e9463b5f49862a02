//! Common test utilities: an emulated account, fault-injecting transports
//! and payload generators.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http::Method;
use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, RngCore, SeedableRng};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use azblob_rs::{
    BlobServiceClient, ClientConfig, ContainerClient, ErrorCode, MemoryBlobService, RetryOptions,
    StorageError, TransferOptions, Transport, TransportError, TransportRequest, TransportResponse,
};

pub fn init() {
    azblob_rs::init_tracing("azblob_rs=warn");
}

/// Retries quickly so fault-injection tests stay fast.
pub fn fast_retry() -> RetryOptions {
    RetryOptions::default()
        .with_max_attempts(4)
        .with_delays(Duration::from_millis(1), Duration::from_millis(5))
        .with_jitter(0.0)
}

/// Block, threshold and chunk size all set to `size`.
pub fn small_transfers(size: u64, concurrency: usize) -> TransferOptions {
    TransferOptions::default()
        .with_block_size(size)
        .with_single_upload_threshold(size)
        .with_chunk_size(size)
        .with_max_concurrency(concurrency)
}

pub fn client_over(transport: Arc<dyn Transport>) -> BlobServiceClient {
    BlobServiceClient::with_config(
        transport,
        None,
        ClientConfig::default().with_retry(fast_retry()),
    )
}

/// Deterministic pseudo-random payload.
pub fn payload(len: usize, seed: u64) -> Bytes {
    let mut data = vec![0u8; len];
    StdRng::seed_from_u64(seed).fill_bytes(&mut data);
    Bytes::from(data)
}

/// An emulated account and a client talking to it directly.
pub struct TestAccount {
    pub service: MemoryBlobService,
    pub client: BlobServiceClient,
}

impl TestAccount {
    pub fn new() -> Self {
        init();
        let service = MemoryBlobService::new();
        let client = client_over(Arc::new(service.clone()));
        Self { service, client }
    }

    /// A client that reaches the same account through `wrap`.
    pub fn client_via<T, F>(&self, wrap: F) -> (Arc<T>, BlobServiceClient)
    where
        T: Transport,
        F: FnOnce(Arc<dyn Transport>) -> T,
    {
        let transport = Arc::new(wrap(Arc::new(self.service.clone())));
        let client = client_over(transport.clone());
        (transport, client)
    }

    pub async fn container(&self, name: &str) -> ContainerClient {
        let container = self.client.container_client(name);
        container.create_if_not_exists().await.unwrap();
        container
    }
}

fn comp(request: &TransportRequest) -> Option<&str> {
    request.query_param("comp")
}

fn is_stage_block(request: &TransportRequest) -> bool {
    request.method == Method::PUT && comp(request) == Some("block")
}

fn is_range_read(request: &TransportRequest) -> bool {
    request.method == Method::GET && request.header("x-ms-range").is_some()
}

type Matcher = Box<dyn Fn(&TransportRequest) -> bool + Send + Sync>;

/// Wraps a transport and injects delays and failures into block stages and
/// range reads. Every request is logged.
pub struct FaultyTransport {
    inner: Arc<dyn Transport>,
    delay: Option<Duration>,
    random_delay: bool,
    transient_failures: u32,
    attempts: Mutex<HashMap<String, u32>>,
    always_fail: Option<Matcher>,
    corrupt_ranges: bool,
    log: Mutex<Vec<TransportRequest>>,
}

impl FaultyTransport {
    pub fn new(inner: Arc<dyn Transport>) -> Self {
        Self {
            inner,
            delay: None,
            random_delay: false,
            transient_failures: 0,
            attempts: Mutex::new(HashMap::new()),
            always_fail: None,
            corrupt_ranges: false,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Delays each block stage and range read by up to `max`, at random, so
    /// sub-requests complete out of order.
    pub fn with_random_delay(mut self, max: Duration) -> Self {
        self.delay = Some(max);
        self.random_delay = true;
        self
    }

    /// Delays each block stage and range read by exactly `delay`.
    pub fn with_fixed_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self.random_delay = false;
        self
    }

    /// The first `times` attempts of every distinct block stage or range
    /// read fail: odd attempts with a reset connection, even ones with 503.
    pub fn with_transient_failures(mut self, times: u32) -> Self {
        self.transient_failures = times;
        self
    }

    /// Requests matching `matcher` always get 503 ServerBusy.
    pub fn failing_always<F>(mut self, matcher: F) -> Self
    where
        F: Fn(&TransportRequest) -> bool + Send + Sync + 'static,
    {
        self.always_fail = Some(Box::new(matcher));
        self
    }

    /// Flips one byte of every range read's body.
    pub fn corrupting_ranges(mut self) -> Self {
        self.corrupt_ranges = true;
        self
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.log.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&TransportRequest) -> bool) -> usize {
        self.log.lock().iter().filter(|r| predicate(r)).count()
    }

    pub fn commits(&self) -> usize {
        self.count(|r| r.method == Method::PUT && comp(r) == Some("blocklist"))
    }

    pub fn stages(&self) -> usize {
        self.count(is_stage_block)
    }

    fn key(request: &TransportRequest) -> String {
        format!(
            "{} {} {:?} {:?}",
            request.method,
            request.path,
            request.query,
            request.header("x-ms-range")
        )
    }
}

#[async_trait]
impl Transport for FaultyTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        self.log.lock().push(request.clone());
        let targeted = is_stage_block(&request) || is_range_read(&request);

        if let (true, Some(max)) = (targeted, self.delay) {
            let delay = if self.random_delay {
                let millis = max.as_millis() as u64;
                Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
            } else {
                max
            };
            tokio::time::sleep(delay).await;
        }

        if self.always_fail.as_ref().is_some_and(|m| m(&request)) {
            return Ok(StorageError::new(ErrorCode::ServerBusy).into_response());
        }

        if targeted && self.transient_failures > 0 {
            let attempt = {
                let mut attempts = self.attempts.lock();
                let seen = attempts.entry(Self::key(&request)).or_insert(0);
                *seen += 1;
                *seen
            };
            if attempt <= self.transient_failures {
                if attempt % 2 == 1 {
                    return Err(TransportError::Connect("connection reset by peer".into()));
                }
                return Ok(StorageError::new(ErrorCode::ServerBusy).into_response());
            }
        }

        let corrupt = self.corrupt_ranges && is_range_read(&request);
        let response = self.inner.send(request).await?;
        if !corrupt || !response.is_success() {
            return Ok(response);
        }
        let TransportResponse {
            status,
            headers,
            body,
        } = response;
        let mut data = body.collect().await?.to_vec();
        if let Some(first) = data.first_mut() {
            *first ^= 0xff;
        }
        Ok(TransportResponse::new(status, headers, Bytes::from(data)))
    }
}

fn is_upload_write(request: &TransportRequest) -> bool {
    request.method == Method::PUT
        && match comp(request) {
            None => request.header("x-ms-blob-type").is_some(),
            Some(c) => c == "blocklist",
        }
}

async fn overwrite(
    inner: &Arc<dyn Transport>,
    path: &str,
    replacement: &Bytes,
) -> Result<(), TransportError> {
    let request = TransportRequest::new(Method::PUT, path.to_string())
        .with_header("x-ms-blob-type", "BlockBlob")
        .expect("valid header")
        .with_body(replacement.clone());
    let response = inner.send(request).await?;
    assert!(response.is_success(), "overwrite failed: {}", response.status);
    Ok(())
}

/// Lets the first upload write (Put Blob or Put Block List) through, then
/// overwrites the blob with `replacement` before the caller sees the reply.
pub struct OverwriteAfterFirstWrite {
    inner: Arc<dyn Transport>,
    replacement: Bytes,
    fired: AtomicBool,
}

impl OverwriteAfterFirstWrite {
    pub fn new(inner: Arc<dyn Transport>, replacement: Bytes) -> Self {
        Self {
            inner,
            replacement,
            fired: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for OverwriteAfterFirstWrite {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let path = request.path.clone();
        let write = is_upload_write(&request);
        let response = self.inner.send(request).await?;
        if write && response.is_success() && !self.fired.swap(true, Ordering::SeqCst) {
            overwrite(&self.inner, &path, &self.replacement).await?;
        }
        Ok(response)
    }
}

/// Overwrites the blob with `replacement` just before the first range read
/// is served, as a concurrent writer would.
pub struct OverwriteOnFirstRead {
    inner: Arc<dyn Transport>,
    replacement: Bytes,
    fired: AtomicBool,
}

impl OverwriteOnFirstRead {
    pub fn new(inner: Arc<dyn Transport>, replacement: Bytes) -> Self {
        Self {
            inner,
            replacement,
            fired: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for OverwriteOnFirstRead {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        if is_range_read(&request) && !self.fired.swap(true, Ordering::SeqCst) {
            overwrite(&self.inner, &request.path, &self.replacement).await?;
        }
        self.inner.send(request).await
    }
}
