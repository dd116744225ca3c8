//! Entity grouping and within-group concurrency.
//!
//! Filenames shaped `NN-rest` (decimal digits, literal hyphen) share the
//! group key `NN`; contiguous runs of the same key in a sorted listing
//! execute concurrently, one scoped thread per entity. Everything else runs
//! one entity at a time.

use std::thread;

use anyhow::{Result, anyhow};

/// A contiguous run of entities sharing one group key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityGroup {
    pub names: Vec<String>,
    pub key: Option<String>,
}

impl EntityGroup {
    /// Concurrency applies only to keyed groups of two or more entities.
    pub fn concurrent(&self) -> bool {
        self.key.is_some() && self.names.len() > 1
    }
}

/// Group key for a filename: the integer value of a `NN-` prefix.
///
/// Leading zeros are insignificant (`01-a` and `1-b` share key `1`), so the
/// digits are normalized rather than parsed, which also keeps arbitrarily
/// long prefixes exact.
pub fn group_key(name: &str) -> Option<String> {
    let (digits, _rest) = name.split_once('-')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let normalized = digits.trim_start_matches('0');
    Some(if normalized.is_empty() {
        "0".to_string()
    } else {
        normalized.to_string()
    })
}

/// Partition an ordered listing into contiguous same-key runs.
///
/// Unkeyed filenames never share a group, even with each other.
pub fn group_entities(names: &[String]) -> Vec<EntityGroup> {
    let mut groups: Vec<EntityGroup> = Vec::new();
    let mut pending: Vec<String> = Vec::new();
    let mut pending_key: Option<String> = None;

    for name in names {
        let key = group_key(name);
        if pending.is_empty() {
            pending.push(name.clone());
            pending_key = key;
            continue;
        }
        if key.is_some() && key == pending_key {
            pending.push(name.clone());
            continue;
        }
        groups.push(EntityGroup {
            names: std::mem::take(&mut pending),
            key: pending_key.take(),
        });
        pending.push(name.clone());
        pending_key = key;
    }

    if !pending.is_empty() {
        groups.push(EntityGroup {
            names: pending,
            key: pending_key,
        });
    }
    groups
}

/// Run `action` across one group.
///
/// Concurrent groups get one scoped thread per entity; the call returns only
/// after every action finished, with results in entity start order. One
/// entity's error does not cancel its siblings, but the first error (in
/// start order) is surfaced once all have finished.
pub fn run_group<T, F>(group: &EntityGroup, action: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(&str) -> Result<T> + Sync,
{
    if !group.concurrent() {
        return group.names.iter().map(|name| action(name)).collect();
    }

    thread::scope(|scope| {
        let action = &action;
        let handles: Vec<_> = group
            .names
            .iter()
            .map(|name| scope.spawn(move || action(name)))
            .collect();

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.join() {
                Ok(result) => results.push(result),
                Err(_) => results.push(Err(anyhow!("entity worker thread panicked"))),
            }
        }
        results.into_iter().collect()
    })
}
