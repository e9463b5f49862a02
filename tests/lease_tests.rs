//! Blob and container lease tests.

mod common;

use azblob_rs::models::{LeaseState, LeaseStatus, MetadataMap};
use azblob_rs::{AccessConditions, BlobError, ErrorCode, LeasePeriod, UploadOptions};
use common::TestAccount;

const OTHER_ID: &str = "22222222-2222-2222-2222-222222222222";

#[tokio::test]
async fn test_second_acquire_conflicts_until_release() {
    let account = TestAccount::new();
    let container = account.container("leases").await;
    let blob = container.blob_client("locked.txt");
    blob.upload("v1".into(), &UploadOptions::default()).await.unwrap();

    let first = blob.lease_client(None);
    let second = blob.lease_client(Some(OTHER_ID.to_string()));

    let lease = first.acquire(LeasePeriod::Infinite).await.unwrap();
    assert_eq!(lease.lease_id, first.lease_id());
    assert_eq!(lease.expires_at, None);

    let err = second.acquire(LeasePeriod::Fixed(30)).await.unwrap_err();
    assert!(
        matches!(err, BlobError::LeaseConflict { code: ErrorCode::LeaseAlreadyPresent, .. }),
        "{err:?}"
    );

    first.release().await.unwrap();
    assert!(first.lease().is_none());

    let lease = second.acquire(LeasePeriod::Fixed(30)).await.unwrap();
    assert_eq!(lease.lease_id, OTHER_ID);
    assert!(lease.expires_at.is_some());

    let props = blob.get_properties(&AccessConditions::default()).await.unwrap();
    assert_eq!(props.lease_state, LeaseState::Leased);
    assert_eq!(props.lease_status, LeaseStatus::Locked);
}

#[tokio::test]
async fn test_writes_need_the_lease_id() {
    let account = TestAccount::new();
    let container = account.container("guarded").await;
    let blob = container.blob_client("doc.txt");
    blob.upload("v1".into(), &UploadOptions::default()).await.unwrap();

    let leases = blob.lease_client(None);
    leases.acquire(LeasePeriod::Infinite).await.unwrap();

    let mut metadata = MetadataMap::new();
    metadata.insert("owner", "alice").unwrap();

    let err = blob
        .set_metadata(&metadata, &AccessConditions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::LeaseConflict { code: ErrorCode::LeaseIdMissing, .. }));

    let err = blob
        .set_metadata(&metadata, &AccessConditions::default().with_lease(OTHER_ID))
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::LeaseLost { .. }), "{err:?}");

    let err = blob
        .upload("v2".into(), &UploadOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), Some("LeaseIdMissing"));

    let held = AccessConditions::default().with_lease(leases.lease_id());
    blob.set_metadata(&metadata, &held).await.unwrap();
    blob.upload("v2".into(), &UploadOptions::default().with_conditions(held.clone()))
        .await
        .unwrap();
    assert_eq!(blob.get_metadata().await.unwrap().value.get("owner"), None);

    // Reads never need the lease.
    let text = blob.download_text(&Default::default()).await.unwrap();
    assert_eq!(text, "v2");
}

#[tokio::test]
async fn test_block_upload_under_lease() {
    let account = TestAccount::new();
    let container = account.container("leasedblocks").await;
    let blob = container.blob_client("big.bin");
    blob.upload("seed".into(), &UploadOptions::default()).await.unwrap();

    let leases = blob.lease_client(None);
    leases.acquire(LeasePeriod::Fixed(60)).await.unwrap();

    let data = common::payload(5 * 512, 21);
    let options = UploadOptions::default()
        .with_transfer(common::small_transfers(512, 3))
        .with_conditions(AccessConditions::default().with_lease(leases.lease_id()));
    blob.upload(data.clone(), &options).await.unwrap();
    assert_eq!(blob.download_bytes(&Default::default()).await.unwrap(), data);
}

#[tokio::test]
async fn test_change_renew_and_break() {
    let account = TestAccount::new();
    let container = account.container("lifecycle").await;
    let blob = container.blob_client("item");
    blob.upload("x".into(), &UploadOptions::default()).await.unwrap();

    let leases = blob.lease_client(None);
    leases.acquire(LeasePeriod::Fixed(15)).await.unwrap();

    let new_id = leases.change(OTHER_ID).await.unwrap();
    assert_eq!(new_id, OTHER_ID);
    assert_eq!(leases.lease_id(), OTHER_ID);
    assert_eq!(leases.lease().unwrap().lease_id, OTHER_ID);

    let renewed = leases.renew().await.unwrap();
    assert_eq!(renewed.period, LeasePeriod::Fixed(15));

    let err = leases.change("not-a-uuid").await.unwrap_err();
    assert!(matches!(err, BlobError::InvalidInput(_)));

    // A fixed lease is never held longer than its remaining time.
    let remaining = blob.lease_client(None).break_lease(Some(60)).await.unwrap();
    assert!(remaining <= 15, "remaining {remaining}");

    let props = blob.get_properties(&AccessConditions::default()).await.unwrap();
    assert_eq!(props.lease_state, LeaseState::Breaking);

    let err = blob.lease_client(None).acquire(LeasePeriod::Infinite).await.unwrap_err();
    assert!(matches!(
        err,
        BlobError::LeaseConflict { code: ErrorCode::LeaseIsBreakingAndCannotBeAcquired, .. }
    ));
}

#[tokio::test]
async fn test_immediate_break_frees_the_blob() {
    let account = TestAccount::new();
    let container = account.container("breaking").await;
    let blob = container.blob_client("item");
    blob.upload("x".into(), &UploadOptions::default()).await.unwrap();

    let holder = blob.lease_client(None);
    holder.acquire(LeasePeriod::Infinite).await.unwrap();

    let breaker = blob.lease_client(None);
    assert_eq!(breaker.break_lease(Some(0)).await.unwrap(), 0);
    let props = blob.get_properties(&AccessConditions::default()).await.unwrap();
    assert_eq!(props.lease_state, LeaseState::Broken);

    // Breaking a broken lease is a no-op.
    assert_eq!(breaker.break_lease(None).await.unwrap(), 0);

    let err = holder.renew().await.unwrap_err();
    assert!(matches!(err, BlobError::LeaseLost { .. }), "{err:?}");

    blob.set_metadata(&MetadataMap::new(), &AccessConditions::default())
        .await
        .unwrap();
    breaker.acquire(LeasePeriod::Fixed(20)).await.unwrap();
}

#[tokio::test]
async fn test_lease_arguments_are_checked_locally() {
    let account = TestAccount::new();
    let container = account.container("local").await;
    let leases = container.blob_client("missing").lease_client(None);

    let err = leases.acquire(LeasePeriod::Fixed(5)).await.unwrap_err();
    assert!(matches!(err, BlobError::InvalidInput(_)));
    let err = leases.acquire(LeasePeriod::Fixed(61)).await.unwrap_err();
    assert!(matches!(err, BlobError::InvalidInput(_)));
    let err = leases.break_lease(Some(61)).await.unwrap_err();
    assert!(matches!(err, BlobError::InvalidInput(_)));

    let err = leases.acquire(LeasePeriod::Fixed(15)).await.unwrap_err();
    assert!(matches!(err, BlobError::NotFound { .. }));
}

#[tokio::test]
async fn test_container_lease_guards_delete() {
    let account = TestAccount::new();
    let container = account.container("leased-container").await;
    let leases = container.lease_client(None);
    leases.acquire(LeasePeriod::Infinite).await.unwrap();

    let props = container.get_properties().await.unwrap();
    assert_eq!(props.lease_state, LeaseState::Leased);

    let err = container.delete(&AccessConditions::default()).await.unwrap_err();
    assert!(matches!(err, BlobError::LeaseConflict { code: ErrorCode::LeaseIdMissing, .. }));

    let other = container.lease_client(Some(OTHER_ID.to_string()));
    let err = other.acquire(LeasePeriod::Infinite).await.unwrap_err();
    assert!(matches!(err, BlobError::LeaseConflict { .. }));

    container
        .delete(&AccessConditions::default().with_lease(leases.lease_id()))
        .await
        .unwrap();
    assert!(!container.exists().await.unwrap());
}
