use std::borrow::Borrow;
use std::collections::{HashMap, HashSet};
use std::hash::{BuildHasher, Hash};

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::Serialize;

/// An item placed at a single point in time.
pub trait Dated {
    fn timestamp(&self) -> DateTime<Utc>;

    /// The calendar day of the item in the reference time zone `tz`.
    fn day_in<Tz: TimeZone>(&self, tz: &Tz) -> NaiveDate {
        self.timestamp().with_timezone(tz).date_naive()
    }
}

impl<T: Dated + ?Sized> Dated for &T {
    fn timestamp(&self) -> DateTime<Utc> {
        (**self).timestamp()
    }
}

impl Dated for DateTime<Utc> {
    fn timestamp(&self) -> DateTime<Utc> {
        *self
    }
}

/// Items sharing a calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateGroup<T> {
    pub date: NaiveDate,
    /// The items in their input order.
    pub assets: Vec<T>,
}

impl<T> DateGroup<T> {
    pub fn len(&self) -> usize {
        self.assets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assets.is_empty()
    }

    /// Whether every item of this group is contained in `selection`.
    ///
    /// This is vacuously true for a group without items.
    pub fn is_all_selected<Q, S>(&self, selection: &HashSet<Q, S>) -> bool
    where
        T: Borrow<Q>,
        Q: Hash + Eq,
        S: BuildHasher,
    {
        self.assets
            .iter()
            .all(|asset| selection.contains(asset.borrow()))
    }

    /// Like [`is_all_selected`](Self::is_all_selected), for selections which are not a set of
    /// the items themselves, e.g. a set of identifiers.
    pub fn is_all_selected_by(&self, mut is_selected: impl FnMut(&T) -> bool) -> bool {
        self.assets.iter().all(|asset| is_selected(asset))
    }
}

/// Partitions `items` into calendar days in the reference time zone `tz`.
///
/// Groups are returned in the order their day is first seen in `items`, which is calendar
/// order only if `items` is sorted by timestamp. Within a group, items keep their input order.
pub fn group_by_day<I, Tz>(items: I, tz: &Tz) -> Vec<DateGroup<I::Item>>
where
    I: IntoIterator,
    I::Item: Dated,
    Tz: TimeZone,
{
    let mut groups: Vec<DateGroup<I::Item>> = Vec::new();
    let mut positions = HashMap::new();

    for item in items {
        let date = item.day_in(tz);
        let position = *positions.entry(date).or_insert_with(|| {
            groups.push(DateGroup {
                date,
                assets: Vec::new(),
            });
            groups.len() - 1
        });
        groups[position].assets.push(item);
    }

    groups
}
