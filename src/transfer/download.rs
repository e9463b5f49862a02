use bytes::Bytes;
use futures::stream::{self, StreamExt};
use http::Method;
use std::collections::BTreeMap;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{cancelled, effective, md5_base64, ChunkStream, DownloadOptions};
use crate::client::BlobClient;
use crate::config::{CancelPolicy, TransferOptions, MAX_RANGE_MD5_SIZE};
use crate::error::{BlobError, BlobResult};

/// Ranges to read, all pinned to the ETag seen by the size probe.
struct Plan {
    etag: String,
    start: u64,
    ranges: Vec<(u64, u64)>,
    transfer: TransferOptions,
}

impl Plan {
    async fn prepare(blob: &BlobClient, options: &DownloadOptions) -> BlobResult<Self> {
        let transfer = effective(options.transfer.as_ref(), blob.pipeline().config())?;
        if transfer.validate_content_md5 && transfer.chunk_size > MAX_RANGE_MD5_SIZE {
            return Err(BlobError::InvalidInput(format!(
                "chunk size {} exceeds {MAX_RANGE_MD5_SIZE}, the largest range the service \
                 will checksum",
                transfer.chunk_size
            )));
        }

        let properties = blob.get_properties(&options.conditions).await?;
        let size = properties.content_length;
        let (start, end) = match options.range {
            Some((start, _)) if start >= size && !(start == 0 && size == 0) => {
                return Err(BlobError::InvalidInput(format!(
                    "range start {start} is beyond the blob's {size} bytes"
                )));
            }
            Some((start, Some(last))) if last < start => {
                return Err(BlobError::InvalidInput(format!(
                    "range end {last} precedes start {start}"
                )));
            }
            Some((start, Some(last))) => (start, size.min(last.saturating_add(1))),
            Some((start, None)) => (start, size),
            None => (0, size),
        };

        let ranges = (start..end)
            .step_by(usize::try_from(transfer.chunk_size).unwrap_or(usize::MAX))
            .map(|offset| (offset, transfer.chunk_size.min(end - offset)))
            .collect();
        debug!(
            blob = %blob.handle(),
            size,
            start,
            end,
            etag = %properties.etag,
            "download planned"
        );
        Ok(Self {
            etag: properties.etag,
            start,
            ranges,
            transfer,
        })
    }
}

/// Reads one range, retried on its own. The `If-Match` pin turns a
/// concurrent overwrite into `PreconditionFailed`.
async fn fetch_range(
    blob: BlobClient,
    etag: String,
    offset: u64,
    len: u64,
    validate_md5: bool,
    cancel: Option<CancellationToken>,
) -> BlobResult<Bytes> {
    let resource = blob.resource();
    if cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
        return Err(cancelled("download", &resource));
    }
    let last = offset + len - 1;
    let mut request = blob.request(Method::GET);
    request.set_header("x-ms-range", format!("bytes={offset}-{last}"))?;
    request.set_header("if-match", &etag)?;
    if validate_md5 {
        request.set_header("x-ms-range-get-content-md5", "true")?;
    }

    let fail = |reason: String, source: Option<BlobError>| {
        BlobError::transfer(&resource, format!("range {offset}-{last}: {reason}"), source)
    };
    let (response, body) = match blob
        .pipeline()
        .send_collect("download_range", request, cancel.as_ref())
        .await
    {
        Ok(pair) => pair,
        Err(e @ (BlobError::PreconditionFailed { .. } | BlobError::Cancelled { .. })) => {
            return Err(e)
        }
        Err(e) => return Err(fail("read failed".into(), Some(e))),
    };

    if body.len() as u64 != len {
        return Err(fail(format!("expected {len} bytes, got {}", body.len()), None));
    }
    if validate_md5 {
        let actual = md5_base64(&body);
        match response.header("content-md5") {
            Some(expected) if expected == actual => {}
            Some(expected) => {
                return Err(fail(
                    format!("checksum mismatch: service sent {expected}, data hashes to {actual}"),
                    None,
                ))
            }
            None => return Err(fail("service sent no range checksum".into(), None)),
        }
    }
    Ok(body)
}

/// Reads the planned ranges concurrently and writes them to `sink` in
/// ascending offset order. At most `2 * max_concurrency` chunks are held in
/// memory at once.
pub(crate) async fn download_to<W>(
    blob: &BlobClient,
    sink: &mut W,
    options: &DownloadOptions,
) -> BlobResult<u64>
where
    W: AsyncWrite + Unpin + Send,
{
    let plan = Plan::prepare(blob, options).await?;
    let resource = blob.resource();
    let validate = plan.transfer.validate_content_md5;
    let concurrency = plan.transfer.max_concurrency;
    let window = concurrency * 2;
    let cancel = options.cancel.clone().unwrap_or_default();

    let mut pending = plan.ranges.into_iter();
    let mut tasks: JoinSet<(u64, BlobResult<Bytes>)> = JoinSet::new();
    let mut reorder: BTreeMap<u64, Bytes> = BTreeMap::new();
    let mut next_offset = plan.start;
    let mut written: u64 = 0;

    loop {
        while tasks.len() < concurrency && tasks.len() + reorder.len() < window {
            let Some((offset, len)) = pending.next() else { break };
            let fetch = fetch_range(
                blob.clone(),
                plan.etag.clone(),
                offset,
                len,
                validate,
                Some(cancel.clone()),
            );
            tasks.spawn(async move { (offset, fetch.await) });
        }
        if tasks.is_empty() {
            break;
        }

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                if plan.transfer.cancel_policy == CancelPolicy::Abandon {
                    tasks.abort_all();
                }
                while tasks.join_next().await.is_some() {}
                return Err(cancelled("download", &resource));
            }
            joined = tasks.join_next() => joined,
        };
        let Some(joined) = joined else { break };
        let (offset, result) = joined.map_err(|e| {
            BlobError::transfer(&resource, format!("range task failed: {e}"), None)
        })?;
        match result {
            Ok(chunk) => {
                reorder.insert(offset, chunk);
            }
            Err(err) => {
                tasks.abort_all();
                return Err(err);
            }
        }

        while let Some(chunk) = reorder.remove(&next_offset) {
            sink.write_all(&chunk).await.map_err(|e| {
                tasks.abort_all();
                BlobError::transfer(&resource, format!("writing to sink: {e}"), None)
            })?;
            next_offset += chunk.len() as u64;
            written += chunk.len() as u64;
        }
    }

    info!(blob = %blob.handle(), bytes = written, "download complete");
    Ok(written)
}

/// Pull-based download. Ranges are fetched only as the stream is polled,
/// with up to `max_concurrency` reads ahead of the consumer.
pub(crate) async fn download_stream(
    blob: &BlobClient,
    options: &DownloadOptions,
) -> BlobResult<ChunkStream> {
    let plan = Plan::prepare(blob, options).await?;
    let blob = blob.clone();
    let etag = plan.etag;
    let validate = plan.transfer.validate_content_md5;
    let cancel = options.cancel.clone();

    let chunks = stream::iter(plan.ranges)
        .map(move |(offset, len)| {
            fetch_range(blob.clone(), etag.clone(), offset, len, validate, cancel.clone())
        })
        .buffered(plan.transfer.max_concurrency);
    Ok(chunks.boxed())
}
