use std::collections::BTreeSet;

use rusqlite::Connection;
use serde::Serialize;

use crate::storage::{local, repository};

/// Links to add and remove so a task's assignees equal a target set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AssigneeDiff {
    pub added: Vec<i64>,
    pub removed: Vec<i64>,
}

impl AssigneeDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Set difference in both directions. Members present in both are left out,
/// so their existing links are never rewritten.
pub fn diff(current: &[i64], target: &[i64]) -> AssigneeDiff {
    let current: BTreeSet<i64> = current.iter().copied().collect();
    let target: BTreeSet<i64> = target.iter().copied().collect();
    AssigneeDiff {
        added: target.difference(&current).copied().collect(),
        removed: current.difference(&target).copied().collect(),
    }
}

/// Bring the task's assignee links in line with the snapshot's remote
/// assignees. Remote ids with no member mapping are skipped.
pub fn sync_task_assignees(
    conn: &Connection,
    task_id: i64,
    remote_ids: &[String],
) -> Result<AssigneeDiff, rusqlite::Error> {
    let target = repository::mapped_member_ids(conn, remote_ids)?;
    let current = local::list_task_assignees(conn, task_id)?;
    let changes = diff(&current, &target);
    for member_id in &changes.removed {
        local::remove_task_assignee(conn, task_id, *member_id)?;
    }
    for member_id in &changes.added {
        local::add_task_assignee(conn, task_id, *member_id)?;
    }
    if !changes.is_empty() {
        log::debug!(
            "Task {task_id}: +{:?} -{:?} assignees",
            changes.added,
            changes.removed
        );
    }
    Ok(changes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diff_leaves_common_members_alone() {
        let d = diff(&[1, 2], &[2, 3]);
        assert_eq!(d.added, vec![3]);
        assert_eq!(d.removed, vec![1]);
    }

    #[test]
    fn test_diff_handles_duplicates_and_empty_sets() {
        assert!(diff(&[4, 4], &[4]).is_empty());
        assert_eq!(diff(&[], &[5, 5]).added, vec![5]);
        assert_eq!(diff(&[6], &[]).removed, vec![6]);
    }
}
