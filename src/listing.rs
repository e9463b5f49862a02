//! Lazy, restartable paged listings.
//!
//! A [`Pager`] drives any [`PageSource`] one request at a time. The
//! continuation token it holds is the only state needed to resume, so a
//! listing can be checkpointed between pages and picked up elsewhere.
//! Results are gap- and duplicate-free only while the listed names do not
//! change; concurrent writers may be missed or seen twice.

use async_trait::async_trait;
use futures::stream::{self, Stream, TryStreamExt};
use http::Method;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::ListBlobsOptions;
use crate::error::{BlobError, BlobResult};
use crate::models::{
    BlobListEntry, ContainerItem, ListingCheckpoint, ListingPage, TaggedBlobItem,
};
use crate::pipeline::Pipeline;
use crate::query::TagQuery;
use crate::transport::TransportRequest;
use crate::xml::deserialize;

/// One kind of listing request.
#[async_trait]
pub trait PageSource: Send + Sync {
    type Item: Send;

    /// Path the listing is addressed to, for errors and logs.
    fn resource(&self) -> String;

    async fn fetch_page(
        &self,
        marker: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> BlobResult<ListingPage<Self::Item>>;
}

/// Cursor over the pages of one listing.
pub struct Pager<S> {
    source: S,
    marker: Option<String>,
    done: bool,
    cancel: Option<CancellationToken>,
}

impl<S: PageSource> Pager<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            marker: None,
            done: false,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Starts from a continuation token returned by an earlier page.
    pub fn starting_at(mut self, marker: Option<String>) -> Self {
        self.marker = marker.filter(|m| !m.is_empty());
        self
    }

    /// Token that resumes the listing after the last page returned.
    pub fn continuation_token(&self) -> Option<&str> {
        self.marker.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Fetches the next page; `None` once the terminal page was returned.
    pub async fn next_page(&mut self) -> BlobResult<Option<ListingPage<S::Item>>> {
        if self.done {
            return Ok(None);
        }
        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(BlobError::Cancelled {
                operation: "list",
                resource: self.source.resource(),
            });
        }

        let sent = self.marker.clone();
        let page = self
            .source
            .fetch_page(sent.as_deref(), self.cancel.as_ref())
            .await?;
        if page.continuation_token.is_some() && page.continuation_token == sent {
            return Err(BlobError::malformed(
                "list",
                self.source.resource(),
                "continuation token did not advance",
            ));
        }
        debug!(
            resource = %self.source.resource(),
            entries = page.entries.len(),
            last = page.is_last(),
            "listing page fetched"
        );
        self.marker = page.continuation_token.clone();
        self.done = page.is_last();
        Ok(Some(page))
    }

    /// Every remaining page, fetched as the stream is polled.
    pub fn into_pages(self) -> impl Stream<Item = BlobResult<ListingPage<S::Item>>> {
        stream::try_unfold(self, |mut pager| async move {
            Ok(pager.next_page().await?.map(|page| (page, pager)))
        })
    }

    /// Flattens the listing into single entries. Suspends only when the
    /// buffered page is used up.
    pub fn into_stream(self) -> impl Stream<Item = BlobResult<S::Item>> {
        self.into_pages()
            .map_ok(|page| stream::iter(page.entries.into_iter().map(Ok)))
            .try_flatten()
    }

    pub async fn collect_all(self) -> BlobResult<Vec<S::Item>> {
        self.into_stream().try_collect().await
    }
}

impl Pager<BlobListing> {
    /// Serializable position of this listing; `None` once it is exhausted.
    pub fn checkpoint(&self) -> Option<ListingCheckpoint> {
        if self.done {
            return None;
        }
        let options = &self.source.options;
        Some(ListingCheckpoint {
            container: self.source.container.clone(),
            prefix: options.prefix.clone(),
            delimiter: options.delimiter.clone(),
            depth: options.depth,
            page_size: options.page_size.unwrap_or(self.source.pipeline.config().page_size),
            include: options.include,
            marker: self.marker.clone(),
        })
    }
}

fn set_list_params(
    request: &mut TransportRequest,
    prefix: Option<&str>,
    marker: Option<&str>,
    page_size: u32,
) {
    if let Some(prefix) = prefix.filter(|p| !p.is_empty()) {
        request.query.push(("prefix".into(), prefix.into()));
    }
    if let Some(marker) = marker {
        request.query.push(("marker".into(), marker.into()));
    }
    request.query.push(("maxresults".into(), page_size.to_string()));
}

/// Blobs of one container, flat or grouped by a delimiter.
pub struct BlobListing {
    pipeline: Arc<Pipeline>,
    container: String,
    options: ListBlobsOptions,
}

impl BlobListing {
    pub(crate) fn new(
        pipeline: Arc<Pipeline>,
        container: String,
        options: ListBlobsOptions,
    ) -> Self {
        Self {
            pipeline,
            container,
            options,
        }
    }
}

#[async_trait]
impl PageSource for BlobListing {
    type Item = BlobListEntry;

    fn resource(&self) -> String {
        format!("/{}", self.container)
    }

    async fn fetch_page(
        &self,
        marker: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> BlobResult<ListingPage<BlobListEntry>> {
        let mut request = TransportRequest::new(Method::GET, self.resource())
            .with_query("restype", "container")
            .with_query("comp", "list");
        let page_size = self.options.page_size.unwrap_or(self.pipeline.config().page_size);
        set_list_params(&mut request, self.options.prefix.as_deref(), marker, page_size);
        if let Some(ref delimiter) = self.options.delimiter {
            request = request.with_query("delimiter", delimiter.clone());
        }
        if let Some(include) = self.options.include.as_query() {
            request = request.with_query("include", include);
        }

        let (_, body) = self.pipeline.send_collect("list_blobs", request, cancel).await?;
        let (mut entries, next) = deserialize::parse_blob_list(
            &String::from_utf8_lossy(&body),
            self.options.delimiter.as_deref(),
            self.options.depth,
        )
        .map_err(|e| BlobError::malformed("list_blobs", self.resource(), e))?;
        for entry in &mut entries {
            if let BlobListEntry::Prefix(prefix) = entry {
                prefix.page_size = Some(page_size);
            }
        }
        Ok(ListingPage {
            entries,
            continuation_token: next.filter(|m| !m.is_empty()),
        })
    }
}

/// Containers of the account.
pub struct ContainerListing {
    pipeline: Arc<Pipeline>,
    prefix: Option<String>,
    page_size: u32,
    include_metadata: bool,
}

impl ContainerListing {
    pub(crate) fn new(
        pipeline: Arc<Pipeline>,
        prefix: Option<String>,
        page_size: u32,
        include_metadata: bool,
    ) -> Self {
        Self {
            pipeline,
            prefix,
            page_size,
            include_metadata,
        }
    }
}

#[async_trait]
impl PageSource for ContainerListing {
    type Item = ContainerItem;

    fn resource(&self) -> String {
        "/".to_string()
    }

    async fn fetch_page(
        &self,
        marker: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> BlobResult<ListingPage<ContainerItem>> {
        let mut request = TransportRequest::new(Method::GET, "/").with_query("comp", "list");
        set_list_params(&mut request, self.prefix.as_deref(), marker, self.page_size);
        if self.include_metadata {
            request = request.with_query("include", "metadata");
        }
        let (_, body) = self.pipeline.send_collect("list_containers", request, cancel).await?;
        let (entries, next) = deserialize::parse_container_list(&String::from_utf8_lossy(&body))
            .map_err(|e| BlobError::malformed("list_containers", "/", e))?;
        Ok(ListingPage {
            entries,
            continuation_token: next.filter(|m| !m.is_empty()),
        })
    }
}

/// Blobs whose tags satisfy a query, account-wide or in one container.
pub struct TagFilterListing {
    pipeline: Arc<Pipeline>,
    container: Option<String>,
    query: TagQuery,
    page_size: u32,
}

impl TagFilterListing {
    pub(crate) fn new(
        pipeline: Arc<Pipeline>,
        container: Option<String>,
        query: TagQuery,
        page_size: u32,
    ) -> Self {
        Self {
            pipeline,
            container,
            query,
            page_size,
        }
    }
}

#[async_trait]
impl PageSource for TagFilterListing {
    type Item = TaggedBlobItem;

    fn resource(&self) -> String {
        match &self.container {
            Some(container) => format!("/{container}"),
            None => "/".to_string(),
        }
    }

    async fn fetch_page(
        &self,
        marker: Option<&str>,
        cancel: Option<&CancellationToken>,
    ) -> BlobResult<ListingPage<TaggedBlobItem>> {
        let mut request = TransportRequest::new(Method::GET, self.resource());
        if self.container.is_some() {
            request = request.with_query("restype", "container");
        }
        request = request
            .with_query("comp", "blobs")
            .with_query("where", self.query.as_str());
        set_list_params(&mut request, None, marker, self.page_size);

        let (_, body) = self.pipeline.send_collect("find_blobs_by_tags", request, cancel).await?;
        let (entries, next) = deserialize::parse_filter_blobs(&String::from_utf8_lossy(&body))
            .map_err(|e| BlobError::malformed("find_blobs_by_tags", self.resource(), e))?;
        Ok(ListingPage {
            entries,
            continuation_token: next.filter(|m| !m.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use parking_lot::Mutex;

    /// Serves fixed pages keyed by marker.
    struct Scripted {
        pages: Vec<(Option<&'static str>, Vec<u32>, Option<&'static str>)>,
        seen: Arc<Mutex<Vec<Option<String>>>>,
    }

    #[async_trait]
    impl PageSource for Scripted {
        type Item = u32;

        fn resource(&self) -> String {
            "/scripted".into()
        }

        async fn fetch_page(
            &self,
            marker: Option<&str>,
            _cancel: Option<&CancellationToken>,
        ) -> BlobResult<ListingPage<u32>> {
            self.seen.lock().push(marker.map(String::from));
            let (_, entries, next) = self
                .pages
                .iter()
                .find(|(m, _, _)| *m == marker)
                .cloned()
                .ok_or_else(|| BlobError::InvalidInput(format!("no page at {marker:?}")))?;
            Ok(ListingPage {
                entries,
                continuation_token: next.map(String::from),
            })
        }
    }

    fn scripted() -> Scripted {
        Scripted {
            pages: vec![
                (None, vec![1, 2], Some("m1")),
                (Some("m1"), vec![], Some("m2")),
                (Some("m2"), vec![3], None),
            ],
            seen: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[tokio::test]
    async fn flattens_pages_including_empty_ones() {
        let all = Pager::new(scripted()).collect_all().await.unwrap();
        assert_eq!(all, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn fetches_lazily() {
        let source = scripted();
        let seen = source.seen.clone();
        let mut stream = Box::pin(Pager::new(source).into_stream());
        assert!(seen.lock().is_empty());

        assert_eq!(stream.next().await.unwrap().unwrap(), 1);
        assert_eq!(*seen.lock(), vec![None]);
        assert_eq!(stream.next().await.unwrap().unwrap(), 2);
        assert_eq!(seen.lock().len(), 1);

        // The empty second page is skipped on the way to the third.
        assert_eq!(stream.next().await.unwrap().unwrap(), 3);
        assert_eq!(
            *seen.lock(),
            vec![None, Some("m1".to_string()), Some("m2".to_string())]
        );
        assert!(stream.next().await.is_none());
        assert_eq!(seen.lock().len(), 3);

        let mut pager = Pager::new(scripted());
        pager.next_page().await.unwrap();
        assert_eq!(pager.source.seen.lock().len(), 1);
        assert_eq!(pager.continuation_token(), Some("m1"));
    }

    #[tokio::test]
    async fn resumes_from_token() {
        let mut pager = Pager::new(scripted()).starting_at(Some("m2".into()));
        let page = pager.next_page().await.unwrap().unwrap();
        assert_eq!(page.entries, vec![3]);
        assert!(pager.is_done());
        assert!(pager.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancelled_pager_stops() {
        let token = CancellationToken::new();
        token.cancel();
        let mut pager = Pager::new(scripted()).with_cancellation(token);
        assert!(matches!(pager.next_page().await, Err(BlobError::Cancelled { .. })));
    }

    #[tokio::test]
    async fn stalled_token_is_an_error() {
        let source = Scripted {
            pages: vec![(None, vec![1], Some("m")), (Some("m"), vec![2], Some("m"))],
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let result = Pager::new(source).collect_all().await;
        assert!(matches!(result, Err(BlobError::MalformedResponse { .. })));
    }
}
