//! List data for the feed and itinerary screens.
//!
//! - [`PaginatedCollection`] accumulates the pages of a cursor-paginated list, and
//!   [`PagedList`] drives one against a [`PageSource`].
//! - [`group_by_day`] and [`group_indexed_stops`] bucket dated items into calendar days for
//!   section headers and the itinerary table of contents.

mod grouping;
mod paged_list;
mod pager;
mod stops;

pub use grouping::{DateGroup, Dated, group_by_day};
pub use paged_list::{Page, PageLoad, PageSource, PagedList};
pub use pager::{Cursor, PaginatedCollection};
pub use stops::{IndexedStop, StopIndex, StopIndexGroup, group_indexed_stops};
