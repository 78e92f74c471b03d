//! Goal parent-link validation.
//!
//! A goal may reference a parent goal, forming a tree. Nothing guarantees
//! acyclicity by construction, so the link is checked on every write with a
//! bounded-depth walk up the parent chain; cycles and over-deep chains are
//! rejected rather than silently broken.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, StoreError};

/// Maximum parent-chain depth followed before the walk gives up.
pub const MAX_GOAL_DEPTH: usize = 64;

/// Validate a goal's parent reference before persisting it.
///
/// `record_id` is the goal being written (`None` on first submit, when no
/// chain can reach it yet). The parent must exist, be a live goal, and its
/// ancestor chain must not lead back to `record_id`.
pub fn check_parent(
    conn: &Connection,
    record_id: Option<&str>,
    parent: Option<&str>,
) -> Result<()> {
    let Some(parent_id) = parent else {
        return Ok(());
    };

    if record_id == Some(parent_id) {
        return Err(StoreError::validation(
            "parent_goal",
            "a goal cannot be its own parent",
        ));
    }

    let mut current = parent_id.to_string();
    for _ in 0..MAX_GOAL_DEPTH {
        let row: Option<(String, Option<String>, Option<String>)> = conn
            .query_row(
                "SELECT domain, deleted_at, json_extract(payload, '$.goal.parent_goal') \
                 FROM records WHERE id = ?1",
                params![current],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (domain, deleted_at, next_parent) = match row {
            Some(r) => r,
            None => {
                return Err(StoreError::validation(
                    "parent_goal",
                    format!("parent goal not found: {current}"),
                ))
            }
        };
        if domain != "goal" {
            return Err(StoreError::validation(
                "parent_goal",
                format!("parent must be a goal, got {domain}: {current}"),
            ));
        }
        if deleted_at.is_some() {
            return Err(StoreError::validation(
                "parent_goal",
                format!("parent goal is deleted: {current}"),
            ));
        }

        match next_parent {
            Some(next) => {
                if record_id == Some(next.as_str()) {
                    return Err(StoreError::validation(
                        "parent_goal",
                        "parent chain forms a cycle",
                    ));
                }
                current = next;
            }
            None => return Ok(()),
        }
    }

    Err(StoreError::validation(
        "parent_goal",
        format!("parent chain deeper than {MAX_GOAL_DEPTH}"),
    ))
}
