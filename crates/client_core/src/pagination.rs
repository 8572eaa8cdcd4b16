use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use shared::domain::{ChannelId, ChannelKind};
use tracing::{debug, warn};

use crate::{api::ChatApi, error::SyncError, model::Message};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResult {
    pub page: u32,
    pub messages: Vec<Message>,
    pub has_more: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageState {
    pub channel_id: ChannelId,
    pub next_page: u32,
    pub has_more: bool,
    pub loaded_pages: BTreeSet<u32>,
}

type PageFuture = Shared<BoxFuture<'static, Result<PageResult, SyncError>>>;

struct CursorInner {
    state: PageState,
    in_flight: Option<PageFuture>,
}

/// Backward history loader for one channel.
///
/// Concurrent `load_next` calls share a single request. A page is recorded
/// as loaded only once its fetch succeeded.
pub struct PaginationCursor {
    api: Arc<dyn ChatApi>,
    kind: ChannelKind,
    page_size: u32,
    inner: Arc<Mutex<CursorInner>>,
}

fn lock(inner: &Mutex<CursorInner>) -> MutexGuard<'_, CursorInner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

impl PaginationCursor {
    pub fn new(
        api: Arc<dyn ChatApi>,
        channel_id: ChannelId,
        kind: ChannelKind,
        page_size: u32,
    ) -> Self {
        Self {
            api,
            kind,
            page_size: page_size.max(1),
            inner: Arc::new(Mutex::new(CursorInner {
                state: PageState {
                    channel_id,
                    next_page: 1,
                    has_more: true,
                    loaded_pages: BTreeSet::new(),
                },
                in_flight: None,
            })),
        }
    }

    pub fn state(&self) -> PageState {
        lock(&self.inner).state.clone()
    }

    pub fn has_more(&self) -> bool {
        lock(&self.inner).state.has_more
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Fetches the next older page. Once history is exhausted this returns
    /// an empty result without touching the network.
    pub async fn load_next(&self) -> Result<PageResult, SyncError> {
        let request = {
            let mut inner = lock(&self.inner);
            match &inner.in_flight {
                Some(request) => request.clone(),
                None => {
                    if !inner.state.has_more {
                        return Ok(PageResult {
                            page: inner.state.next_page,
                            messages: Vec::new(),
                            has_more: false,
                        });
                    }
                    let request = self
                        .fetch(inner.state.channel_id.clone(), inner.state.next_page)
                        .boxed()
                        .shared();
                    inner.in_flight = Some(request.clone());
                    request
                }
            }
        };
        request.await
    }

    fn fetch(
        &self,
        channel_id: ChannelId,
        page: u32,
    ) -> impl std::future::Future<Output = Result<PageResult, SyncError>> + Send + 'static {
        let api = Arc::clone(&self.api);
        let inner = Arc::clone(&self.inner);
        let kind = self.kind;
        let page_size = self.page_size;

        async move {
            let fetched = api.history(&channel_id, kind, page, page_size).await;
            let mut guard = lock(&inner);
            guard.in_flight = None;
            let raw = fetched?;

            let has_more = raw.len() >= page_size as usize;
            let messages: Vec<Message> = raw
                .into_iter()
                .filter(|payload| {
                    let ok = payload.is_well_formed();
                    if !ok {
                        warn!(channel_id = %channel_id, page, "pagination: dropping malformed message");
                    }
                    ok
                })
                .map(Message::from)
                .collect();

            guard.state.loaded_pages.insert(page);
            guard.state.next_page = page + 1;
            guard.state.has_more = has_more;
            debug!(
                channel_id = %channel_id,
                page,
                count = messages.len(),
                has_more,
                "pagination: page loaded"
            );
            Ok(PageResult {
                page,
                messages,
                has_more,
            })
        }
    }
}

#[cfg(test)]
#[path = "tests/pagination_tests.rs"]
mod tests;
