//! Commit history walking with shallow/depth semantics.

use crate::Result;
use haven_storage::{CommitInfo, ObjectId, ObjectType, Vault};
use std::collections::HashSet;

/// One step of a history walk.
#[derive(Debug, Clone)]
pub enum LogEntry {
    /// A successfully read commit.
    Commit(CommitInfo),
    /// A commit that failed to read; terminates the walk but preserves the
    /// history collected so far.
    Unreadable {
        /// The commit that could not be read.
        oid: ObjectId,
        /// Why the read failed.
        reason: String,
    },
}

impl LogEntry {
    /// The commit id of this entry.
    pub fn oid(&self) -> ObjectId {
        match self {
            Self::Commit(info) => info.id,
            Self::Unreadable { oid, .. } => *oid,
        }
    }
}

/// Result of a history walk.
#[derive(Debug, Default)]
pub struct LogResult {
    /// Ancestor commits in walk order.
    pub entries: Vec<LogEntry>,
    /// Commits that became history boundaries because a depth or time
    /// bound was reached.
    pub shallows: HashSet<ObjectId>,
    /// Formerly-shallow commits this walk reached with room to spare.
    /// Always disjoint from `shallows`.
    pub unshallows: HashSet<ObjectId>,
}

fn read_commit(vault: &Vault, oid: ObjectId) -> Result<CommitInfo> {
    let object = vault.objects.read_typed(&oid, ObjectType::Commit)?;
    Ok(CommitInfo::parse(oid, &object.data)?)
}

/// Walks the ancestor closure of `refname`.
///
/// `depth` bounds the number of commits returned; `since` stops the walk at
/// the first commit whose committer timestamp is at or before the bound.
/// Tips are kept sorted by committer timestamp between pops so the most
/// recent reachable tip is processed next; parents already queued are not
/// requeued, which keeps shared ancestors single.
pub fn log(
    vault: &Vault,
    refname: &str,
    depth: Option<usize>,
    since: Option<i64>,
) -> Result<LogResult> {
    let existing_shallow = vault.objects.read_shallow_set()?;
    let start = vault.refs.resolve_oid(refname)?;

    let mut result = LogResult::default();
    let mut tips: Vec<CommitInfo> = match read_commit(vault, start) {
        Ok(commit) => vec![commit],
        Err(e) => {
            result.entries.push(LogEntry::Unreadable {
                oid: start,
                reason: e.to_string(),
            });
            return Ok(result);
        }
    };

    while let Some(commit) = tips.pop() {
        let oid = commit.id;
        let timestamp = commit.committer.timestamp;
        let parents = commit.parents.clone();
        result.entries.push(LogEntry::Commit(commit));

        let since_reached = since.is_some_and(|bound| timestamp <= bound);
        let depth_reached = depth.is_some_and(|bound| result.entries.len() >= bound);
        if since_reached || depth_reached {
            // A boundary only exists if there was more history to elide.
            if !parents.is_empty() && !existing_shallow.contains(&oid) {
                result.shallows.insert(oid);
            }
            break;
        }

        if existing_shallow.contains(&oid) {
            // A previously-shallow commit reached with room to spare: its
            // parents are absent locally, so record the transition and
            // continue with the remaining tips.
            result.unshallows.insert(oid);
            continue;
        }

        for parent in parents {
            if tips.iter().any(|tip| tip.id == parent) {
                continue;
            }
            match read_commit(vault, parent) {
                Ok(info) => tips.push(info),
                Err(e) => {
                    result.entries.push(LogEntry::Unreadable {
                        oid: parent,
                        reason: e.to_string(),
                    });
                    return Ok(result);
                }
            }
        }
        tips.sort_by_key(|tip| tip.committer.timestamp);
    }

    debug_assert!(result.shallows.is_disjoint(&result.unshallows));
    Ok(result)
}
