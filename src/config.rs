//! Client configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

use crate::error::{BlobError, BlobResult};

/// Default account name for development storage.
pub const DEFAULT_ACCOUNT: &str = "devstoreaccount1";

/// Default API version.
pub const DEFAULT_API_VERSION: &str = "2021-10-04";

/// Default block size for staged uploads (4 MiB).
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

/// Inputs up to this size are uploaded with a single PUT (8 MiB).
pub const DEFAULT_SINGLE_UPLOAD_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Default range size for downloads (4 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Default number of sub-requests in flight per transfer.
pub const DEFAULT_MAX_CONCURRENCY: usize = 4;

/// Upper bound on sub-requests in flight per transfer.
pub const MAX_CONCURRENCY: usize = 64;

/// Largest block the service accepts (4000 MiB).
pub const MAX_BLOCK_SIZE: u64 = 4000 * 1024 * 1024;

/// Most blocks a single blob may commit.
pub const MAX_BLOCK_COUNT: usize = 50_000;

/// The service computes range MD5s only for ranges up to 4 MiB.
pub const MAX_RANGE_MD5_SIZE: u64 = 4 * 1024 * 1024;

/// Default `maxresults` for listings.
pub const DEFAULT_PAGE_SIZE: u32 = 5000;

pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 4;
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 200;
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 10_000;
pub const DEFAULT_RETRY_JITTER: f64 = 0.25;

/// Longest backoff between two attempts (ten minutes).
pub const MAX_RETRY_DELAY_MS: u64 = 10 * 60 * 1000;

/// What happens to in-flight sub-requests when a transfer is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    /// Drop in-flight sub-requests immediately.
    #[default]
    Abandon,
    /// Let in-flight sub-requests finish, start no new ones.
    Drain,
}

/// Block/range sizing and parallelism for transfers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferOptions {
    pub block_size: u64,
    pub single_upload_threshold: u64,
    pub chunk_size: u64,
    pub max_concurrency: usize,
    /// Send a Content-MD5 per staged block and verify range MD5s on download.
    pub validate_content_md5: bool,
    /// Abort remaining blocks on the first failure.
    pub fail_fast: bool,
    pub cancel_policy: CancelPolicy,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            single_upload_threshold: DEFAULT_SINGLE_UPLOAD_THRESHOLD,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            validate_content_md5: false,
            fail_fast: true,
            cancel_policy: CancelPolicy::Abandon,
        }
    }
}

impl TransferOptions {
    pub fn with_block_size(mut self, block_size: u64) -> Self {
        self.block_size = block_size;
        self
    }

    pub fn with_single_upload_threshold(mut self, threshold: u64) -> Self {
        self.single_upload_threshold = threshold;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_content_md5(mut self, validate: bool) -> Self {
        self.validate_content_md5 = validate;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_cancel_policy(mut self, policy: CancelPolicy) -> Self {
        self.cancel_policy = policy;
        self
    }

    /// Rejects sizes and concurrency the service or engine cannot honour.
    pub fn validate(&self) -> BlobResult<()> {
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(BlobError::InvalidInput(format!(
                "block size {} outside 1..={}",
                self.block_size, MAX_BLOCK_SIZE
            )));
        }
        if self.chunk_size == 0 {
            return Err(BlobError::InvalidInput("chunk size must be positive".into()));
        }
        if self.max_concurrency == 0 || self.max_concurrency > MAX_CONCURRENCY {
            return Err(BlobError::InvalidInput(format!(
                "max concurrency {} outside 1..={}",
                self.max_concurrency, MAX_CONCURRENCY
            )));
        }
        Ok(())
    }
}

/// Exponential backoff settings applied to every sub-request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryOptions {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Fraction of the computed delay added as random jitter (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            base_delay_ms: DEFAULT_RETRY_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
            jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

impl RetryOptions {
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_delays(mut self, base: Duration, max: Duration) -> Self {
        self.base_delay_ms = base.as_millis() as u64;
        self.max_delay_ms = max.as_millis() as u64;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn validate(&self) -> BlobResult<()> {
        if !self.jitter.is_finite() || !(0.0..=1.0).contains(&self.jitter) {
            return Err(BlobError::InvalidInput(format!(
                "retry jitter {} outside 0.0..=1.0",
                self.jitter
            )));
        }
        if self.max_delay_ms > MAX_RETRY_DELAY_MS {
            return Err(BlobError::InvalidInput(format!(
                "max retry delay {}ms above {}ms",
                self.max_delay_ms, MAX_RETRY_DELAY_MS
            )));
        }
        if self.base_delay_ms > self.max_delay_ms {
            return Err(BlobError::InvalidInput(format!(
                "base retry delay {}ms above the maximum {}ms",
                self.base_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Value stamped into `x-ms-version`.
    pub api_version: String,
    /// Public endpoint of the account, used to build absolute copy-source URLs.
    pub account_url: Option<Url>,
    /// `maxresults` sent by listings unless overridden.
    pub page_size: u32,
    pub transfer: TransferOptions,
    pub retry: RetryOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_version: DEFAULT_API_VERSION.to_string(),
            account_url: None,
            page_size: DEFAULT_PAGE_SIZE,
            transfer: TransferOptions::default(),
            retry: RetryOptions::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_account_url(mut self, url: Url) -> Self {
        self.account_url = Some(url);
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn with_transfer(mut self, transfer: TransferOptions) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Loads a configuration from JSON; absent fields take their defaults.
    pub fn from_json(json: &str) -> BlobResult<Self> {
        let config: ClientConfig = serde_json::from_str(json)
            .map_err(|e| BlobError::InvalidInput(format!("invalid client configuration: {e}")))?;
        config.transfer.validate()?;
        config.retry.validate()?;
        Ok(config)
    }
}
