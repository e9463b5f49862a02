//! Metadata, tags, HTTP properties, tag queries and blob lifecycle.

mod common;

use std::sync::Arc;

use azblob_rs::models::{BlobHttpHeaders, MetadataMap, TagMap, TaggedBlobItem};
use azblob_rs::{
    AccessConditions, BlobError, BlobServiceClient, ClientConfig, DownloadOptions, TagQuery,
    UploadOptions,
};
use common::TestAccount;

fn tags(pairs: &[(&str, &str)]) -> TagMap {
    TagMap::try_from_pairs(pairs.iter().copied()).unwrap()
}

#[tokio::test]
async fn test_set_metadata_replaces_and_is_idempotent() {
    let account = TestAccount::new();
    let container = account.container("meta").await;
    let blob = container.blob_client("doc.txt");
    let mut initial = MetadataMap::new();
    initial.insert("stale", "yes").unwrap();
    blob.upload("body".into(), &UploadOptions::default().with_metadata(initial))
        .await
        .unwrap();

    let mut metadata = MetadataMap::new();
    metadata.insert("Project", "apollo").unwrap();
    metadata.insert("stage", "draft").unwrap();

    let first = blob.set_metadata(&metadata, &AccessConditions::default()).await.unwrap();
    let second = blob.set_metadata(&metadata, &AccessConditions::default()).await.unwrap();
    assert_ne!(first, second, "every write produces a new etag");

    let read = blob.get_metadata().await.unwrap();
    assert_eq!(read.value, metadata);
    assert_eq!(read.value.get("project"), Some("apollo"));
    assert_eq!(read.value.get("stale"), None);
    assert_eq!(read.etag, second);

    // Metadata writes leave the content alone.
    assert_eq!(blob.download_text(&DownloadOptions::default()).await.unwrap(), "body");
}

#[tokio::test]
async fn test_etag_guards_concurrent_writers() {
    let account = TestAccount::new();
    let container = account.container("optimistic").await;
    let blob = container.blob_client("counter");
    blob.upload("0".into(), &UploadOptions::default()).await.unwrap();

    let seen = blob.get_metadata().await.unwrap();

    let mut winner = seen.value.clone();
    winner.insert("count", "1").unwrap();
    blob.set_metadata(&winner, &AccessConditions::if_match(&seen.etag))
        .await
        .unwrap();

    let mut loser = seen.value.clone();
    loser.insert("count", "2").unwrap();
    let err = blob
        .set_metadata(&loser, &AccessConditions::if_match(&seen.etag))
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::PreconditionFailed { .. }), "{err:?}");
    assert!(!err.is_retryable());

    let current = blob.get_metadata().await.unwrap();
    assert_eq!(current.value.get("count"), Some("1"));

    let err = blob
        .get_properties(&AccessConditions::if_match(&seen.etag))
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::PreconditionFailed { .. }));

    let create_only = UploadOptions::default().with_conditions(AccessConditions::if_not_exists());
    let err = blob.upload("9".into(), &create_only).await.unwrap_err();
    assert!(matches!(err, BlobError::AlreadyExists { .. }), "{err:?}");
    container
        .blob_client("fresh")
        .upload("1".into(), &create_only)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_container_writes_honour_etag_conditions() {
    let account = TestAccount::new();
    let container = account.container("guarded-container").await;
    let seen = container.get_properties().await.unwrap().etag;

    let mut first = MetadataMap::new();
    first.insert("stage", "one").unwrap();
    let current = container
        .set_metadata(&first, &AccessConditions::if_match(&seen))
        .await
        .unwrap();
    assert_ne!(current, seen);

    let mut second = MetadataMap::new();
    second.insert("stage", "two").unwrap();
    let err = container
        .set_metadata(&second, &AccessConditions::if_match(&seen))
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::PreconditionFailed { .. }), "{err:?}");
    let props = container.get_properties().await.unwrap();
    assert_eq!(props.metadata.get("stage"), Some("one"));

    let err = container
        .delete(&AccessConditions::if_match(&seen))
        .await
        .unwrap_err();
    assert!(matches!(err, BlobError::PreconditionFailed { .. }), "{err:?}");
    assert!(container.exists().await.unwrap());

    let not_current = AccessConditions {
        if_none_match: Some(current.clone()),
        ..AccessConditions::default()
    };
    let err = container.delete(&not_current).await.unwrap_err();
    assert!(matches!(err, BlobError::PreconditionFailed { .. }), "{err:?}");

    container
        .delete(&AccessConditions::if_match(&current))
        .await
        .unwrap();
    assert!(!container.exists().await.unwrap());
}

#[test]
fn test_metadata_keys_are_validated_locally() {
    let mut metadata = MetadataMap::new();
    assert!(metadata.insert("1bad", "x").is_err());
    assert!(metadata.insert("has-dash", "x").is_err());
    assert!(metadata.insert("_ok_1", "x").is_ok());
}

#[tokio::test]
async fn test_tags_round_trip_without_touching_etag() {
    let account = TestAccount::new();
    let container = account.container("tags").await;
    let blob = container.blob_client("photo.png");
    let props = blob.upload("png".into(), &UploadOptions::default()).await.unwrap();

    let empty = blob.get_tags().await.unwrap();
    assert!(empty.value.is_empty());
    assert_eq!(empty.etag, props.etag);

    let wanted = tags(&[("Content", "image"), ("Date", "2022-03-04")]);
    blob.set_tags(&wanted, &AccessConditions::default()).await.unwrap();
    let read = blob.get_tags().await.unwrap();
    assert_eq!(read.value, wanted);
    assert_eq!(read.etag, props.etag);

    let replaced = tags(&[("Content", "video")]);
    blob.set_tags(&replaced, &AccessConditions::default()).await.unwrap();
    assert_eq!(blob.get_tags().await.unwrap().value, replaced);

    let after = blob.get_properties(&AccessConditions::default()).await.unwrap();
    assert_eq!(after.tag_count, Some(1));

    blob.clear_tags(&AccessConditions::default()).await.unwrap();
    assert!(blob.get_tags().await.unwrap().value.is_empty());
}

#[tokio::test]
async fn test_tags_survive_overwrite_unless_replaced() {
    let account = TestAccount::new();
    let container = account.container("sticky").await;
    let blob = container.blob_client("doc");
    let initial = tags(&[("team", "red")]);
    blob.upload("v1".into(), &UploadOptions::default().with_tags(initial.clone()))
        .await
        .unwrap();

    blob.upload("v2".into(), &UploadOptions::default()).await.unwrap();
    assert_eq!(blob.get_tags().await.unwrap().value, initial);

    let next = tags(&[("team", "blue")]);
    blob.upload("v3".into(), &UploadOptions::default().with_tags(next.clone()))
        .await
        .unwrap();
    assert_eq!(blob.get_tags().await.unwrap().value, next);
}

#[test]
fn test_invalid_tags_are_rejected_before_sending() {
    assert!(TagMap::try_from_pairs([("bad*key", "v")]).is_err());
    assert!(TagMap::try_from_pairs([("k", "x".repeat(257))]).is_err());
    let too_many: Vec<(String, String)> =
        (0..11).map(|i| (format!("k{i}"), "v".to_string())).collect();
    assert!(TagMap::try_from_pairs(too_many).is_err());
}

#[tokio::test]
async fn test_set_properties_replaces_the_header_set() {
    let account = TestAccount::new();
    let container = account.container("headers").await;
    let blob = container.blob_client("page.html");
    let headers = BlobHttpHeaders::default()
        .with_content_type("text/html")
        .with_content_language("en")
        .with_cache_control("max-age=60");
    blob.upload(
        "<p>hi</p>".into(),
        &UploadOptions::default().with_http_headers(headers),
    )
    .await
    .unwrap();

    let props = blob.get_properties(&AccessConditions::default()).await.unwrap();
    assert_eq!(props.content_type.as_deref(), Some("text/html"));
    assert_eq!(props.content_language.as_deref(), Some("en"));

    let etag = blob
        .set_properties(
            &BlobHttpHeaders::default().with_content_type("text/plain"),
            &AccessConditions::if_match(&props.etag),
        )
        .await
        .unwrap();
    let props = blob.get_properties(&AccessConditions::default()).await.unwrap();
    assert_eq!(props.etag, etag);
    assert_eq!(props.content_type.as_deref(), Some("text/plain"));
    assert_eq!(props.content_language, None, "unset fields are cleared");
    assert_eq!(props.cache_control, None);
    assert_eq!(props.content_length, 9);
}

#[tokio::test]
async fn test_find_blobs_by_tags() {
    let account = TestAccount::new();
    let photos = account.container("photos").await;
    let docs = account.container("docs").await;

    let fixtures = [
        (&photos, "cat.png", tags(&[("Content", "image"), ("Date", "2022-05-01")])),
        (&photos, "old.png", tags(&[("Content", "image"), ("Date", "2021-12-31")])),
        (&photos, "clip.mp4", tags(&[("Content", "video"), ("Date", "2022-06-01")])),
        (&docs, "scan.png", tags(&[("Content", "image"), ("Date", "2023-01-01")])),
        (&docs, "plain.txt", TagMap::new()),
    ];
    for (container, name, blob_tags) in &fixtures {
        container
            .blob_client(*name)
            .upload("x".into(), &UploadOptions::default().with_tags(blob_tags.clone()))
            .await
            .unwrap();
    }

    let query = TagQuery::parse(r#""Content" = 'image' AND "Date" >= '2022-01-01'"#).unwrap();
    let found: Vec<TaggedBlobItem> = account
        .client
        .find_blobs_by_tags(&query)
        .collect_all()
        .await
        .unwrap();
    let mut hits: Vec<(String, String)> =
        found.iter().map(|b| (b.container.clone(), b.name.clone())).collect();
    hits.sort();
    assert_eq!(
        hits,
        vec![
            ("docs".to_string(), "scan.png".to_string()),
            ("photos".to_string(), "cat.png".to_string()),
        ]
    );
    let cat = found.iter().find(|b| b.name == "cat.png").unwrap();
    assert_eq!(cat.tags.get("Date"), Some("2022-05-01"));

    let scoped = photos.find_blobs_by_tags(&query).collect_all().await.unwrap();
    assert_eq!(scoped.len(), 1);
    assert_eq!(scoped[0].name, "cat.png");

    let in_docs = TagQuery::parse(r#"@container = 'docs' AND "Content" = 'image'"#).unwrap();
    let found = account.client.find_blobs_by_tags(&in_docs).collect_all().await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].container, "docs");
}

#[tokio::test]
async fn test_tag_query_pages() {
    let account = TestAccount::new();
    let container = account.container("many").await;
    for i in 0..7 {
        container
            .blob_client(format!("b{i}"))
            .upload(
                "x".into(),
                &UploadOptions::default().with_tags(tags(&[("kind", "log")])),
            )
            .await
            .unwrap();
    }
    let client = BlobServiceClient::with_config(
        Arc::new(account.service.clone()),
        None,
        ClientConfig::default().with_page_size(3),
    );
    let query = TagQuery::parse(r#""kind" = 'log'"#).unwrap();
    let mut pager = client.find_blobs_by_tags(&query);
    let mut sizes = Vec::new();
    while let Some(page) = pager.next_page().await.unwrap() {
        sizes.push(page.entries.len());
    }
    assert_eq!(sizes, vec![3, 3, 1]);
}

#[tokio::test]
async fn test_tag_query_syntax_errors() {
    for bad in [
        "",
        r#""a" = 'x' AND"#,
        r#""a" == 'x'"#,
        r#""a" = x"#,
        r#"@container > 'c'"#,
        r#""a" = 'x' OR "b" = 'y'"#,
    ] {
        let err = TagQuery::parse(bad).unwrap_err();
        assert!(matches!(err, BlobError::QuerySyntax { .. }), "{bad:?} gave {err:?}");
    }
}

#[tokio::test]
async fn test_soft_delete_and_undelete() {
    let account = TestAccount::new();
    let container = account.container("trash").await;
    let blob = container.blob_client("report.csv");
    blob.upload("a,b".into(), &UploadOptions::default()).await.unwrap();
    assert!(blob.exists().await.unwrap());

    blob.delete(&AccessConditions::default()).await.unwrap();
    assert!(!blob.exists().await.unwrap());
    let err = blob.download_bytes(&DownloadOptions::default()).await.unwrap_err();
    assert!(matches!(err, BlobError::NotFound { .. }), "{err:?}");
    let err = blob.delete(&AccessConditions::default()).await.unwrap_err();
    assert!(matches!(err, BlobError::NotFound { .. }));

    blob.undelete().await.unwrap();
    assert!(blob.exists().await.unwrap());
    assert_eq!(blob.download_text(&DownloadOptions::default()).await.unwrap(), "a,b");

    let missing = container.blob_client("never-existed");
    assert!(!missing.exists().await.unwrap());
    assert!(matches!(missing.undelete().await, Err(BlobError::NotFound { .. })));
}

#[tokio::test]
async fn test_restore_version_makes_a_new_current_version() {
    let account = TestAccount::new();
    let container = account.container("versions").await;
    let blob = container.blob_client("config.json");

    let v1 = blob.upload("{\"v\":1}".into(), &UploadOptions::default()).await.unwrap();
    let v2 = blob.upload("{\"v\":2}".into(), &UploadOptions::default()).await.unwrap();
    let v1_id = v1.version_id.clone().unwrap();
    let v2_id = v2.version_id.clone().unwrap();
    assert_ne!(v1_id, v2_id);

    let old = blob.with_version(&v1_id);
    assert_eq!(old.download_text(&DownloadOptions::default()).await.unwrap(), "{\"v\":1}");

    let restored = blob.restore_version(&v1_id).await.unwrap();
    let v3_id = restored.version_id.clone().unwrap();
    assert_ne!(v3_id, v1_id);
    assert_ne!(v3_id, v2_id);
    assert_eq!(blob.download_text(&DownloadOptions::default()).await.unwrap(), "{\"v\":1}");

    // The version it replaced is still readable.
    let previous = blob.with_version(&v2_id);
    assert_eq!(
        previous.download_text(&DownloadOptions::default()).await.unwrap(),
        "{\"v\":2}"
    );

    previous.delete(&AccessConditions::default()).await.unwrap();
    assert!(!previous.exists().await.unwrap());
    assert!(blob.exists().await.unwrap());

    let err = blob.restore_version("2000-01-01T00:00:00.0000000Z").await.unwrap_err();
    assert!(matches!(err, BlobError::NotFound { .. }), "{err:?}");
}

#[tokio::test]
async fn test_restore_version_with_absolute_copy_source() {
    let account = TestAccount::new();
    account.container("absolute").await;
    let endpoint = account.service.endpoint().unwrap();
    let client = BlobServiceClient::with_config(
        Arc::new(account.service.clone()),
        None,
        ClientConfig::default().with_account_url(endpoint),
    );
    let blob = client.container_client("absolute").blob_client("dir/a b.txt");

    let v1 = blob.upload("first".into(), &UploadOptions::default()).await.unwrap();
    blob.upload("second".into(), &UploadOptions::default()).await.unwrap();
    blob.restore_version(v1.version_id.as_deref().unwrap()).await.unwrap();
    assert_eq!(blob.download_text(&DownloadOptions::default()).await.unwrap(), "first");
}
