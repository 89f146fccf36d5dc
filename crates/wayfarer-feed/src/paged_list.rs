use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::pager::{Cursor, PaginatedCollection};

/// A single page returned by a [`PageSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// The cursor to request the following page with.
    pub end_cursor: Option<Cursor>,
    pub has_next_page: bool,
}

/// A backend query serving a list page by page.
pub trait PageSource: Send + Sync {
    type Item: Clone + Send + Sync;
    type Error;

    /// Queries up to `limit` items following `cursor`, or the first page without a cursor.
    fn query(
        &self,
        cursor: Option<Cursor>,
        limit: usize,
    ) -> impl Future<Output = Result<Page<Self::Item>, Self::Error>> + Send;
}

/// The outcome of loading a page into a [`PagedList`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageLoad {
    /// The page was applied, adding `added` items.
    Applied { added: usize },
    /// The list was refreshed while the page was loading, and the page was discarded.
    Stale,
    /// The source has no more pages, nothing was queried.
    Exhausted,
}

#[derive(Debug)]
struct ListState<T> {
    generation: u64,
    collection: Arc<PaginatedCollection<T>>,
}

/// Drives a [`PaginatedCollection`] against a [`PageSource`].
///
/// Next-page loads are serialized, so each page is applied to the collection its cursor was
/// read from. A [`refresh`](Self::refresh) starts a new generation of the list, and pages
/// loaded for an older generation are discarded instead of being appended to the refreshed
/// list.
pub struct PagedList<S: PageSource> {
    source: S,
    limit: usize,
    state: Mutex<ListState<S::Item>>,
    loading: tokio::sync::Mutex<()>,
}

impl<S: PageSource> PagedList<S> {
    pub fn new(source: S, limit: usize) -> Self {
        let state = ListState {
            generation: 0,
            collection: Arc::new(PaginatedCollection::fresh(limit)),
        };
        Self {
            source,
            limit,
            state: Mutex::new(state),
            loading: tokio::sync::Mutex::new(()),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// A snapshot of the items loaded so far.
    pub fn collection(&self) -> Arc<PaginatedCollection<S::Item>> {
        Arc::clone(&self.state.lock().unwrap().collection)
    }

    /// The number of refreshes so far.
    pub fn generation(&self) -> u64 {
        self.state.lock().unwrap().generation
    }

    /// Replaces the list with the first page of the source.
    ///
    /// Next-page loads which are in flight when this is called, or which start before the
    /// refresh lands, become stale. Of two concurrent refreshes, the one called last wins.
    pub async fn refresh(&self) -> Result<PageLoad, S::Error> {
        let generation = {
            let mut state = self.state.lock().unwrap();
            state.generation += 1;
            state.generation
        };
        tracing::debug!(generation, "Refreshing paged list");

        let page = self.source.query(None, self.limit).await?;

        let mut state = self.state.lock().unwrap();
        if state.generation != generation {
            tracing::debug!(generation, "Discarding superseded refresh");
            return Ok(PageLoad::Stale);
        }
        let added = page.items.len();
        state.collection = Arc::new(PaginatedCollection::fresh(self.limit).into_next(
            page.items,
            page.end_cursor,
            page.has_next_page,
        ));
        Ok(PageLoad::Applied { added })
    }

    /// Appends the next page of the source.
    ///
    /// Concurrent calls are queued and applied one after another.
    pub async fn load_next(&self) -> Result<PageLoad, S::Error> {
        let _loading = self.loading.lock().await;

        let (generation, previous) = {
            let state = self.state.lock().unwrap();
            (state.generation, Arc::clone(&state.collection))
        };
        if !previous.has_next() {
            return Ok(PageLoad::Exhausted);
        }

        let cursor = previous.cursor().cloned();
        tracing::trace!(generation, cursor = ?cursor, "Loading next page");
        let page = self.source.query(cursor, previous.limit()).await?;

        // A refresh may have landed since, even one started before this load read the state.
        let mut state = self.state.lock().unwrap();
        if state.generation != generation || !Arc::ptr_eq(&state.collection, &previous) {
            tracing::debug!(generation, "Discarding page of a refreshed list");
            return Ok(PageLoad::Stale);
        }
        let added = page.items.len();
        state.collection = Arc::new(previous.next(page.items, page.end_cursor, page.has_next_page));
        Ok(PageLoad::Applied { added })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Semaphore;

    use super::*;

    /// Serves `total` numbered items, labelled with the number of first-page queries so far.
    /// Gated sources hold every query until a permit is released.
    struct NumberSource {
        total: usize,
        queries: Mutex<Vec<(Option<Cursor>, usize)>>,
        refreshes: AtomicUsize,
        gate: Option<Semaphore>,
    }

    impl NumberSource {
        fn new(total: usize) -> Self {
            Self {
                total,
                queries: Mutex::new(Vec::new()),
                refreshes: AtomicUsize::new(0),
                gate: None,
            }
        }

        fn gated(total: usize) -> Self {
            Self {
                gate: Some(Semaphore::new(0)),
                ..Self::new(total)
            }
        }

        fn release(&self) {
            if let Some(gate) = &self.gate {
                gate.add_permits(1);
            }
        }
    }

    impl PageSource for NumberSource {
        type Item = String;
        type Error = String;

        async fn query(&self, cursor: Option<Cursor>, limit: usize) -> Result<Page<String>, String> {
            self.queries.lock().unwrap().push((cursor.clone(), limit));
            if let Some(gate) = &self.gate {
                gate.acquire().await.map_err(|e| e.to_string())?.forget();
            }

            let generation = match cursor {
                None => self.refreshes.fetch_add(1, Ordering::SeqCst) + 1,
                Some(_) => self.refreshes.load(Ordering::SeqCst),
            };
            let start = match cursor {
                None => 0,
                Some(cursor) => cursor.as_str().parse::<usize>().map_err(|e| e.to_string())?,
            };
            let end = (start + limit).min(self.total);
            let items = (start..end).map(|i| format!("g{generation}-{i}")).collect();
            let has_next_page = end < self.total;

            Ok(Page {
                items,
                end_cursor: has_next_page.then(|| Cursor::new(end.to_string())),
                has_next_page,
            })
        }
    }

    #[tokio::test]
    async fn test_ten_plus_five() {
        let list = PagedList::new(NumberSource::new(15), 10);

        assert_eq!(list.load_next().await, Ok(PageLoad::Applied { added: 10 }));
        let collection = list.collection();
        assert_eq!(collection.count(), 10);
        assert_eq!(collection.cursor(), Some(&Cursor::new("10")));
        assert!(collection.has_next());

        assert_eq!(list.load_next().await, Ok(PageLoad::Applied { added: 5 }));
        let collection = list.collection();
        assert_eq!(collection.count(), 15);
        assert!(!collection.has_next());
        assert_eq!(collection.cursor(), None);

        assert_eq!(list.load_next().await, Ok(PageLoad::Exhausted));
        assert_eq!(
            *list.source().queries.lock().unwrap(),
            [(None, 10), (Some(Cursor::new("10")), 10)]
        );
    }

    #[tokio::test]
    async fn test_refresh_replaces_list() {
        let list = PagedList::new(NumberSource::new(4), 2);
        list.load_next().await.unwrap();
        list.load_next().await.unwrap();
        assert_eq!(list.collection().count(), 4);

        assert_eq!(list.refresh().await, Ok(PageLoad::Applied { added: 2 }));
        let collection = list.collection();
        assert_eq!(collection.items(), ["g2-0", "g2-1"]);
        assert_eq!(collection.cursor(), Some(&Cursor::new("2")));
        assert_eq!(list.generation(), 1);
    }

    #[tokio::test]
    async fn test_stale_page_is_discarded() {
        wayfarer_test::setup();
        let list = PagedList::new(NumberSource::gated(20), 5);
        list.source().release();
        list.load_next().await.unwrap();
        assert_eq!(list.collection().count(), 5);

        // a next-page load is in flight when the list is refreshed
        let next = list.load_next();
        let refresh = async {
            // wait for the next-page query to be issued before refreshing
            while list.source().queries.lock().unwrap().len() < 2 {
                tokio::task::yield_now().await;
            }
            let refresh = list.refresh();
            futures::pin_mut!(refresh);
            // issue the refresh query, then let the stale page arrive first
            let _ = futures::poll!(&mut refresh);
            list.source().release();
            tokio::task::yield_now().await;
            list.source().release();
            refresh.await
        };

        let (next, refresh) = futures::join!(next, refresh);
        assert_eq!(next, Ok(PageLoad::Stale));
        assert_eq!(refresh, Ok(PageLoad::Applied { added: 5 }));

        let collection = list.collection();
        assert_eq!(collection.count(), 5);
        assert!(collection.items().iter().all(|item| item.starts_with("g2-")));
    }

    #[tokio::test]
    async fn test_load_started_during_refresh_is_discarded() {
        wayfarer_test::setup();
        let list = PagedList::new(NumberSource::gated(20), 5);
        list.source().release();
        list.load_next().await.unwrap();

        // the refresh has bumped the generation, but its page did not arrive yet
        let refresh = list.refresh();
        futures::pin_mut!(refresh);
        assert!(futures::poll!(&mut refresh).is_pending());

        // this load reads the new generation together with the old list
        let next = list.load_next();
        futures::pin_mut!(next);
        assert!(futures::poll!(&mut next).is_pending());
        assert_eq!(list.source().queries.lock().unwrap().len(), 3);

        list.source().release();
        assert_eq!(refresh.await, Ok(PageLoad::Applied { added: 5 }));

        list.source().release();
        assert_eq!(next.await, Ok(PageLoad::Stale));

        let collection = list.collection();
        assert_eq!(collection.count(), 5);
        assert!(collection.items().iter().all(|item| item.starts_with("g2-")));
        assert_eq!(collection.cursor(), Some(&Cursor::new("5")));
    }

    #[tokio::test]
    async fn test_next_loads_are_serialized() {
        let list = PagedList::new(NumberSource::new(9), 3);

        let (a, b, c) = futures::join!(list.load_next(), list.load_next(), list.load_next());
        assert_eq!(a, Ok(PageLoad::Applied { added: 3 }));
        assert_eq!(b, Ok(PageLoad::Applied { added: 3 }));
        assert_eq!(c, Ok(PageLoad::Applied { added: 3 }));

        let items: Vec<_> = list.collection().items().to_vec();
        let expected: Vec<_> = (0..9).map(|i| format!("g1-{i}")).collect();
        assert_eq!(items, expected);
    }

    #[tokio::test]
    async fn test_errors_leave_list_untouched() {
        let list = PagedList::new(NumberSource::new(10), 5);
        list.load_next().await.unwrap();

        // corrupt the cursor the source will be asked for
        {
            let mut state = list.state.lock().unwrap();
            let broken = state
                .collection
                .next(Vec::new(), Some(Cursor::new("not a number")), true);
            state.collection = Arc::new(broken);
        }
        assert!(list.load_next().await.is_err());
        assert_eq!(list.collection().count(), 5);
    }
}
