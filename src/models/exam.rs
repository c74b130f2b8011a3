// src/models/exam.rs

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use validator::Validate;

use crate::models::question::PublicQuestion;

/// Lifecycle of an attempt. `NONE` in the state machine is simply the absence of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExamStatus {
    InProgress,
    Submitted,
    Reviewed,
}

impl ExamStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExamStatus::InProgress => "IN_PROGRESS",
            ExamStatus::Submitted => "SUBMITTED",
            ExamStatus::Reviewed => "REVIEWED",
        }
    }

    /// Submitted and reviewed attempts are both finished; only these can be retaken.
    pub fn is_finished(&self) -> bool {
        !matches!(self, ExamStatus::InProgress)
    }
}

impl fmt::Display for ExamStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExamStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(ExamStatus::InProgress),
            "SUBMITTED" => Ok(ExamStatus::Submitted),
            "REVIEWED" => Ok(ExamStatus::Reviewed),
            other => Err(format!("unknown exam status '{}'", other)),
        }
    }
}

/// One attempt record. At most one row exists per (student_id, topic_id);
/// retakes reset it in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exam {
    pub id: i64,
    pub student_id: i64,
    pub topic_id: i64,
    pub status: ExamStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// 0..=100, `None` until submitted.
    pub score: Option<i32>,
    pub attempts_count: i32,
}

/// Raw 'exams' row as read by sqlx; `status` is stored as TEXT.
#[derive(Debug, FromRow)]
pub struct ExamRow {
    pub id: i64,
    pub student_id: i64,
    pub topic_id: i64,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub score: Option<i32>,
    pub attempts_count: i32,
}

impl TryFrom<ExamRow> for Exam {
    type Error = String;

    fn try_from(row: ExamRow) -> Result<Self, Self::Error> {
        Ok(Exam {
            id: row.id,
            student_id: row.student_id,
            topic_id: row.topic_id,
            status: row.status.parse()?,
            start_time: row.start_time,
            end_time: row.end_time,
            score: row.score,
            attempts_count: row.attempts_count,
        })
    }
}

/// Result of starting or resuming an attempt.
/// The questions are in the pool's order and never include correctness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptResponse {
    pub exam_id: i64,
    pub topic_id: i64,
    pub status: ExamStatus,
    pub attempts_count: i32,
    pub started_at: DateTime<Utc>,
    pub duration_minutes: i32,
    pub questions: Vec<PublicQuestion>,
}

impl AttemptResponse {
    pub fn question_ids(&self) -> Vec<i64> {
        self.questions.iter().map(|q| q.id).collect()
    }
}

/// DTO for submitting an attempt.
#[derive(Debug, Deserialize, Validate)]
pub struct SubmitExamRequest {
    #[validate(range(min = 1))]
    pub topic_id: i64,

    /// Key: Question ID. Value: the answer IDs the student selected (may be empty).
    #[validate(length(max = 500))]
    pub answers: HashMap<i64, HashSet<i64>>,
}

/// Outcome of scoring a submitted attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResult {
    pub exam_id: i64,
    pub score: i32,
    pub passed: bool,
    pub correct_count: usize,
    pub total_questions: usize,
}
