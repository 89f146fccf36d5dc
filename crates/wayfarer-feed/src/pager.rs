use std::fmt;

use serde::{Deserialize, Serialize};

/// An opaque continuation token of a paginated source.
///
/// The token is never interpreted, only handed back to the source to request the next page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Cursor {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

/// The items of a cursor-paginated list loaded so far.
///
/// This is a value type: [`next`](Self::next) returns a new collection with the page
/// appended, and the collection a load started from stays untouched. A refresh starts over
/// from [`fresh`](Self::fresh) instead of modifying the current collection.
///
/// Items are not deduplicated. If the source returns an item twice, for example because it
/// was inserted while paging, it is contained twice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaginatedCollection<T> {
    items: Vec<T>,
    cursor: Option<Cursor>,
    has_next: bool,
    limit: usize,
}

impl<T> PaginatedCollection<T> {
    /// An empty collection, requesting pages of `limit` items.
    ///
    /// It has no cursor and claims that more items are available.
    pub fn fresh(limit: usize) -> Self {
        Self {
            items: Vec::new(),
            cursor: None,
            has_next: true,
            limit,
        }
    }

    /// Returns a collection with `new_items` appended, and `cursor` and `has_next` replaced.
    pub fn next<I>(&self, new_items: I, cursor: Option<Cursor>, has_next: bool) -> Self
    where
        T: Clone,
        I: IntoIterator<Item = T>,
    {
        self.clone().into_next(new_items, cursor, has_next)
    }

    /// Like [`next`](Self::next), but reuses the items of `self`.
    pub fn into_next<I>(mut self, new_items: I, cursor: Option<Cursor>, has_next: bool) -> Self
    where
        I: IntoIterator<Item = T>,
    {
        self.items.extend(new_items);
        self.cursor = cursor;
        self.has_next = has_next;
        self
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }

    /// The cursor to request the next page with.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    /// Whether the source reported more items after the last page.
    pub fn has_next(&self) -> bool {
        self.has_next
    }

    /// The page size.
    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn count(&self) -> usize {
        self.items.len()
    }
}
