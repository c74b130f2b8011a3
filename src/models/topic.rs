// src/models/topic.rs

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Represents the 'topics' table in the database.
/// Immutable for the duration of an attempt; edits go through content management,
/// which must invalidate cached pools afterwards.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Topic {
    pub id: i64,

    /// Display name.
    pub name: String,

    pub duration_minutes: i32,

    /// Pass threshold in percent. A value <= 0 can never be satisfied.
    pub pass_score: i32,

    /// Target pool size. `None` serves every active question.
    pub question_count: Option<i32>,
}

impl Topic {
    /// Pool size configured on the topic, if any. Non-positive counts are treated as unset.
    pub fn configured_pool_size(&self) -> Option<usize> {
        self.question_count
            .filter(|count| *count > 0)
            .map(|count| count as usize)
    }
}
