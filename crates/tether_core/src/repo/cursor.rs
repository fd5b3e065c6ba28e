//! Lazy, restartable keyset paging over repository queries.

use crate::repo::RepoResult;
use rusqlite::types::Value as SqlValue;
use std::collections::VecDeque;

pub(crate) const DEFAULT_PAGE_SIZE: u32 = 64;

/// Position of a row in a paged listing: its sort value and its `seq`.
///
/// The next page starts strictly after the last key read, so rows updated
/// or removed from the result set between pages never shift later rows out.
#[derive(Debug, Clone, PartialEq)]
pub struct PageKey {
    /// Sort column value; `Null` when the listing is in `seq` order.
    pub sort: SqlValue,
    pub seq: i64,
}

impl PageKey {
    /// Key for listings ordered by `seq` alone.
    pub fn seq(seq: i64) -> Self {
        Self {
            sort: SqlValue::Null,
            seq,
        }
    }
}

type PageFetch<'a, T> =
    Box<dyn FnMut(Option<&PageKey>, u32) -> RepoResult<Vec<(PageKey, T)>> + 'a>;

/// Iterator that pulls rows one page at a time.
///
/// Each page is a fresh query, so results reflect store state at the time the
/// page is read; [`PageCursor::restart`] re-reads from the beginning. The
/// sequence ends after a short page, after `limit` items, or after the first
/// error.
pub struct PageCursor<'a, T> {
    fetch: PageFetch<'a, T>,
    page_size: u32,
    limit: Option<u32>,
    after: Option<PageKey>,
    yielded: u32,
    buffer: VecDeque<T>,
    exhausted: bool,
}

impl<'a, T> PageCursor<'a, T> {
    /// Builds a cursor from `fetch(after, page_size)`.
    pub fn new(
        page_size: u32,
        limit: Option<u32>,
        fetch: impl FnMut(Option<&PageKey>, u32) -> RepoResult<Vec<(PageKey, T)>> + 'a,
    ) -> Self {
        Self {
            fetch: Box::new(fetch),
            page_size: page_size.max(1),
            limit,
            after: None,
            yielded: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    /// Rewinds the cursor; the next item re-queries the store.
    pub fn restart(&mut self) {
        self.after = None;
        self.yielded = 0;
        self.buffer.clear();
        self.exhausted = false;
    }

    fn fill(&mut self) -> RepoResult<()> {
        let page_size = match self.limit {
            Some(limit) => self.page_size.min(limit.saturating_sub(self.yielded)),
            None => self.page_size,
        };
        if page_size == 0 {
            self.exhausted = true;
            return Ok(());
        }

        let page = (self.fetch)(self.after.as_ref(), page_size)?;
        if (page.len() as u32) < page_size {
            self.exhausted = true;
        }
        if let Some((key, _)) = page.last() {
            self.after = Some(key.clone());
        }
        self.buffer.extend(page.into_iter().map(|(_, item)| item));
        Ok(())
    }
}

impl<T> Iterator for PageCursor<'_, T> {
    type Item = RepoResult<T>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.limit.is_some_and(|limit| self.yielded >= limit) {
            return None;
        }
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(err) = self.fill() {
                self.exhausted = true;
                return Some(Err(err));
            }
        }
        let item = self.buffer.pop_front()?;
        self.yielded += 1;
        Some(Ok(item))
    }
}
