//! Combining a cached snapshot with a freshly fetched one.

use std::collections::{HashMap, HashSet};

use crate::config::MergeStrategy;
use crate::models::Record;

/// Merge `cached` and `fresh` according to `strategy`.
///
/// The result is ordered by creation time; records created at the same
/// instant keep the order they were merged in.
#[must_use]
pub fn merge_records<T: Record>(cached: Vec<T>, fresh: Vec<T>, strategy: MergeStrategy) -> Vec<T> {
    let mut merged = match strategy {
        MergeStrategy::ServerAuthority => fresh,
        MergeStrategy::LastWriteWins => {
            let mut merged = fresh;
            let positions: HashMap<String, usize> = merged
                .iter()
                .enumerate()
                .map(|(i, r)| (r.id().to_string(), i))
                .collect();
            for local in cached {
                match positions.get(local.id()) {
                    None => merged.push(local),
                    Some(&i) if local.updated_at() > merged[i].updated_at() => merged[i] = local,
                    Some(_) => {},
                }
            }
            merged
        },
        MergeStrategy::LocalFirst => {
            let local_ids: HashSet<String> = cached.iter().map(|r| r.id().to_string()).collect();
            let mut merged = cached;
            merged.extend(fresh.into_iter().filter(|r| !local_ids.contains(r.id())));
            merged
        },
    };
    merged.sort_by_key(Record::created_at);
    merged
}
