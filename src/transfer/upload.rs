use bytes::{Bytes, BytesMut};
use futures::stream::{self, Stream, StreamExt};
use std::io;
use std::pin::pin;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{cancelled, effective, UploadOptions};
use crate::client::BlobClient;
use crate::config::{CancelPolicy, TransferOptions, MAX_BLOCK_COUNT};
use crate::error::{BlobError, BlobResult};
use crate::models::{BlobProperties, BlockId};

type StageOutcome = (usize, BlobResult<()>);

pub(crate) async fn upload_bytes(
    blob: &BlobClient,
    data: Bytes,
    options: &UploadOptions,
) -> BlobResult<BlobProperties> {
    let transfer = effective(options.transfer.as_ref(), blob.pipeline().config())?;
    if data.len() as u64 <= transfer.single_upload_threshold {
        return put_single(blob, data, options, &transfer).await;
    }
    let block_size = block_size(&transfer);
    let blocks: Vec<io::Result<Bytes>> = (0..data.len())
        .step_by(block_size)
        .map(|start| Ok(data.slice(start..data.len().min(start + block_size))))
        .collect();
    stage_and_commit(blob, stream::iter(blocks), options, &transfer).await
}

pub(crate) async fn upload_stream<S>(
    blob: &BlobClient,
    mut source: S,
    options: &UploadOptions,
) -> BlobResult<BlobProperties>
where
    S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
{
    let transfer = effective(options.transfer.as_ref(), blob.pipeline().config())?;

    // Buffer one byte past the threshold to learn which path applies.
    let mut head = BytesMut::new();
    while head.len() as u64 <= transfer.single_upload_threshold {
        match source.next().await {
            Some(chunk) => head.extend_from_slice(&chunk.map_err(|e| read_error(blob, e))?),
            None => return put_single(blob, head.freeze(), options, &transfer).await,
        }
    }
    let blocks = rechunk(head, source, block_size(&transfer));
    stage_and_commit(blob, blocks, options, &transfer).await
}

async fn put_single(
    blob: &BlobClient,
    data: Bytes,
    options: &UploadOptions,
    transfer: &TransferOptions,
) -> BlobResult<BlobProperties> {
    if options.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
        return Err(cancelled("upload", &blob.resource()));
    }
    let size = data.len();
    let properties = blob.put_blob(data, options, transfer.validate_content_md5).await?;
    info!(blob = %blob.handle(), size, "uploaded in a single request");
    Ok(properties)
}

fn block_size(transfer: &TransferOptions) -> usize {
    usize::try_from(transfer.block_size).unwrap_or(usize::MAX)
}

fn read_error(blob: &BlobClient, err: io::Error) -> BlobError {
    BlobError::transfer(blob.resource(), format!("reading upload source: {err}"), None)
}

/// Regroups arbitrary source chunks into blocks of exactly `block_size`
/// bytes; only the last block may be shorter.
fn rechunk<S>(
    buffer: BytesMut,
    source: S,
    block_size: usize,
) -> impl Stream<Item = io::Result<Bytes>> + Send
where
    S: Stream<Item = io::Result<Bytes>> + Send + Unpin,
{
    stream::try_unfold(
        (buffer, source, false),
        move |(mut buffer, mut source, mut exhausted)| async move {
            while !exhausted && buffer.len() < block_size {
                match source.next().await {
                    Some(chunk) => buffer.extend_from_slice(&chunk?),
                    None => exhausted = true,
                }
            }
            if buffer.is_empty() {
                return Ok(None);
            }
            let block = buffer.split_to(buffer.len().min(block_size)).freeze();
            Ok(Some((block, (buffer, source, exhausted))))
        },
    )
}

/// Stages every block with bounded parallelism, then commits the ids in
/// source order. Nothing is committed unless every block was staged.
async fn stage_and_commit<S>(
    blob: &BlobClient,
    blocks: S,
    options: &UploadOptions,
    transfer: &TransferOptions,
) -> BlobResult<BlobProperties>
where
    S: Stream<Item = io::Result<Bytes>> + Send,
{
    let resource = blob.resource();
    let upload_tag = Uuid::new_v4().simple().to_string();
    let cancel = options.cancel.clone().unwrap_or_default();
    let mut blocks = pin!(blocks);
    let mut tasks: JoinSet<StageOutcome> = JoinSet::new();
    let mut ids: Vec<BlockId> = Vec::new();
    let mut first_failure: Option<(usize, BlobError)> = None;
    let mut exhausted = false;
    let mut total: u64 = 0;

    loop {
        while !exhausted
            && tasks.len() < transfer.max_concurrency
            && !(transfer.fail_fast && first_failure.is_some())
        {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(abandon(&mut tasks, transfer.cancel_policy, &resource).await);
                }
                next = blocks.next() => next,
            };
            let data = match next {
                Some(Ok(data)) => data,
                Some(Err(e)) => {
                    tasks.abort_all();
                    return Err(read_error(blob, e));
                }
                None => {
                    exhausted = true;
                    break;
                }
            };
            let index = ids.len();
            if index >= MAX_BLOCK_COUNT {
                tasks.abort_all();
                return Err(BlobError::InvalidInput(format!(
                    "upload needs more than {MAX_BLOCK_COUNT} blocks; raise the block size"
                )));
            }
            let id = BlockId::for_index(&upload_tag, index);
            total += data.len() as u64;
            spawn_stage(&mut tasks, blob, &id, data, options, transfer, &cancel, index)?;
            ids.push(id);
        }

        if tasks.is_empty() {
            break;
        }

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(abandon(&mut tasks, transfer.cancel_policy, &resource).await);
            }
            joined = tasks.join_next() => joined,
        };
        let Some(joined) = joined else { break };
        let (index, result) = match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                tasks.abort_all();
                return Err(BlobError::transfer(&resource, format!("block task failed: {e}"), None));
            }
        };
        if let Err(err) = result {
            if matches!(err, BlobError::Cancelled { .. }) {
                return Err(abandon(&mut tasks, transfer.cancel_policy, &resource).await);
            }
            warn!(blob = %blob.handle(), block = index, error = %err, "block failed");
            if first_failure.is_none() {
                first_failure = Some((index, err));
            }
            if transfer.fail_fast {
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
                break;
            }
        }
    }

    if let Some((index, err)) = first_failure {
        return Err(BlobError::transfer(
            &resource,
            format!("block {index} of {} could not be staged", ids.len()),
            Some(err),
        ));
    }
    if cancel.is_cancelled() {
        return Err(cancelled("upload", &resource));
    }

    debug!(blob = %blob.handle(), blocks = ids.len(), "committing block list");
    let properties = blob.commit_block_list(&ids, total, options).await?;
    info!(blob = %blob.handle(), blocks = ids.len(), size = total, "uploaded in blocks");
    Ok(properties)
}

#[allow(clippy::too_many_arguments)]
fn spawn_stage(
    tasks: &mut JoinSet<StageOutcome>,
    blob: &BlobClient,
    id: &BlockId,
    data: Bytes,
    options: &UploadOptions,
    transfer: &TransferOptions,
    cancel: &CancellationToken,
    index: usize,
) -> BlobResult<()> {
    let mut request = blob.stage_block_request(id, data, transfer.validate_content_md5)?;
    if let Some(ref lease_id) = options.conditions.lease_id {
        request.set_header("x-ms-lease-id", lease_id)?;
    }
    let blob = blob.clone();
    let cancel = cancel.clone();
    tasks.spawn(async move {
        let result = blob
            .pipeline()
            .send_cancellable("stage_block", request, Some(&cancel))
            .await
            .map(|_| ());
        (index, result)
    });
    Ok(())
}

/// Applies the cancel policy to the blocks still in flight.
async fn abandon(
    tasks: &mut JoinSet<StageOutcome>,
    policy: CancelPolicy,
    resource: &str,
) -> BlobError {
    match policy {
        CancelPolicy::Abandon => tasks.abort_all(),
        CancelPolicy::Drain => {}
    }
    while tasks.join_next().await.is_some() {}
    debug!(resource, ?policy, "upload cancelled before commit");
    cancelled("upload", resource)
}
