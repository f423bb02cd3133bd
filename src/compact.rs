//! Duplicate-row repair shared by the store backends.
//!
//! The Postgres backend expresses the same ranking in SQL; the in-memory
//! backend uses [`retain_latest`] directly.

use std::collections::HashMap;
use std::hash::Hash;

/// A table whose uniqueness key may have drifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DedupTarget {
    pub table: &'static str,
    pub constraint: &'static str,
    pub key_columns: &'static [&'static str],
}

pub const DEDUP_TARGETS: &[DedupTarget] = &[
    DedupTarget {
        table: "job_snapshots",
        constraint: "job_snapshots_job_observed_key",
        key_columns: &["job_id", "observed_at"],
    },
    DedupTarget {
        table: "pole_snapshots",
        constraint: "pole_snapshots_job_pole_observed_key",
        key_columns: &["job_id", "pole_id", "observed_at"],
    },
    DedupTarget {
        table: "status_change_log",
        constraint: "status_change_log_entity_field_changed_key",
        key_columns: &["entity_type", "entity_id", "field_name", "changed_at"],
    },
    DedupTarget {
        table: "user_daily_summary",
        constraint: "user_daily_summary_user_date_role_key",
        key_columns: &["user_id", "summary_date", "role"],
    },
    DedupTarget {
        table: "burndown_metrics",
        constraint: "burndown_metrics_utility_date_key",
        key_columns: &["utility", "metric_date"],
    },
];

/// Keeps the row with the highest insertion id per key, preserving input order.
///
/// Returns how many rows were dropped. Rows that are already unique are left
/// exactly as they were.
pub fn retain_latest<T, K, FK, FI>(rows: &mut Vec<T>, key_of: FK, id_of: FI) -> u64
where
    K: Eq + Hash,
    FK: Fn(&T) -> K,
    FI: Fn(&T) -> i64,
{
    let mut winners: HashMap<K, i64> = HashMap::new();
    for row in rows.iter() {
        let id = id_of(row);
        winners
            .entry(key_of(row))
            .and_modify(|best| *best = (*best).max(id))
            .or_insert(id);
    }

    let before = rows.len();
    rows.retain(|row| winners.get(&key_of(row)) == Some(&id_of(row)));
    (before - rows.len()) as u64
}

/// Number of duplicate groups and surplus rows for a key.
pub fn duplicate_groups<T, K, FK>(rows: &[T], key_of: FK) -> (i64, i64)
where
    K: Eq + Hash,
    FK: Fn(&T) -> K,
{
    let mut counts: HashMap<K, i64> = HashMap::new();
    for row in rows {
        *counts.entry(key_of(row)).or_insert(0) += 1;
    }
    counts
        .values()
        .filter(|count| **count > 1)
        .fold((0, 0), |(groups, surplus), count| (groups + 1, surplus + count - 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq)]
    struct Row {
        id: i64,
        job: &'static str,
        at: u32,
    }

    fn row(id: i64, job: &'static str, at: u32) -> Row {
        Row { id, job, at }
    }

    #[test]
    fn highest_insertion_id_wins() {
        let mut rows = vec![row(5, "J", 1), row(9, "J", 1), row(7, "K", 1)];
        let removed = retain_latest(&mut rows, |r| (r.job, r.at), |r| r.id);

        assert_eq!(removed, 1);
        assert_eq!(rows, vec![row(9, "J", 1), row(7, "K", 1)]);
    }

    #[test]
    fn repeat_runs_change_nothing() {
        let mut rows = vec![row(1, "J", 1), row(2, "J", 2), row(3, "J", 2)];
        assert_eq!(retain_latest(&mut rows, |r| (r.job, r.at), |r| r.id), 1);
        let snapshot = rows.clone();
        assert_eq!(retain_latest(&mut rows, |r| (r.job, r.at), |r| r.id), 0);
        assert_eq!(rows, snapshot);
    }

    #[test]
    fn duplicate_groups_counts_surplus() {
        let rows = vec![row(1, "J", 1), row(2, "J", 1), row(3, "J", 1), row(4, "K", 1)];
        assert_eq!(duplicate_groups(&rows, |r| (r.job, r.at)), (1, 2));
        assert_eq!(duplicate_groups(&rows[3..], |r| (r.job, r.at)), (0, 0));
    }

    #[test]
    fn every_target_names_a_constraint_and_key() {
        for target in DEDUP_TARGETS {
            assert!(target.constraint.starts_with(target.table));
            assert!(!target.key_columns.is_empty());
        }
    }
}
