use chrono::TimeZone;
use serde::Serialize;

use crate::grouping::{DateGroup, Dated, group_by_day};

/// A stop of a route which can be bookmarked into the itinerary index.
pub trait IndexedStop: Dated {
    /// Whether the stop is included in the index.
    fn is_indexed(&self) -> bool;
}

impl<T: IndexedStop + ?Sized> IndexedStop for &T {
    fn is_indexed(&self) -> bool {
        (**self).is_indexed()
    }
}

/// A day of the itinerary index.
pub type StopIndexGroup<T> = DateGroup<T>;

/// The day-by-day table of contents over the indexed stops of a route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StopIndex<T> {
    groups: Vec<StopIndexGroup<T>>,
    /// Position of the last indexed stop as `(group, asset)`.
    #[serde(skip)]
    last: Option<(usize, usize)>,
}

impl<T> StopIndex<T> {
    pub fn groups(&self) -> &[StopIndexGroup<T>] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// The indexed stop that comes last in the input order.
    pub fn last(&self) -> Option<&T> {
        let (group, asset) = self.last?;
        self.groups.get(group)?.assets.get(asset)
    }

    /// Whether `stop` is the last indexed stop, after which no connector follows.
    pub fn is_last(&self, stop: &T) -> bool
    where
        T: PartialEq,
    {
        self.last() == Some(stop)
    }

    pub fn into_groups(self) -> Vec<StopIndexGroup<T>> {
        self.groups
    }
}

/// Groups the indexed stops among `routes` by calendar day in `tz`.
///
/// Stops which are not indexed are skipped, otherwise this works like [`group_by_day`]. The
/// last indexed stop in input order is tracked, which is not necessarily the last stop of the
/// last group if `routes` is not sorted.
pub fn group_indexed_stops<I, Tz>(routes: I, tz: &Tz) -> StopIndex<I::Item>
where
    I: IntoIterator,
    I::Item: IndexedStop,
    Tz: TimeZone,
{
    let indexed: Vec<_> = routes.into_iter().filter(|stop| stop.is_indexed()).collect();
    let last_date = indexed.last().map(|stop| stop.day_in(tz));

    let groups = group_by_day(indexed, tz);
    let last = last_date.and_then(|date| {
        let group = groups.iter().position(|group| group.date == date)?;
        Some((group, groups[group].assets.len() - 1))
    });

    StopIndex { groups, last }
}
