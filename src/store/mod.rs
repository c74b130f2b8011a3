//! Content Store: durable topics, questions, answers and exam rows.
//!
//! The engine only talks to storage through [`ContentStore`]. `PgStore` is the
//! production backend; `MemoryStore` keeps everything in process and is the
//! test double the unit and HTTP tests run against.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::models::{
    exam::Exam,
    question::{Answer, PublicQuestion},
    topic::Topic,
};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn get_topic(&self, topic_id: i64) -> Result<Option<Topic>, AppError>;

    /// Active question ids of a topic in ascending order.
    async fn active_question_ids(&self, topic_id: i64) -> Result<Vec<i64>, AppError>;

    /// Full content for `ids`, returned in the same order as `ids`.
    /// Only active answers are included and none carry correctness.
    async fn question_content(&self, ids: &[i64]) -> Result<Vec<PublicQuestion>, AppError>;

    /// Active answers (with correctness) of the given questions.
    async fn active_answers(&self, question_ids: &[i64]) -> Result<Vec<Answer>, AppError>;

    /// Atomic insert-if-absent of the (student, topic) row.
    /// Returns the row and whether this call created it.
    async fn get_or_create_exam(
        &self,
        student_id: i64,
        topic_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(Exam, bool), AppError>;

    async fn get_exam(&self, exam_id: i64) -> Result<Option<Exam>, AppError>;

    /// Retake: resets a finished row back to `IN_PROGRESS`.
    /// Returns `None` when the row is missing or already in progress.
    async fn reset_exam(
        &self,
        exam_id: i64,
        now: DateTime<Utc>,
        bump_attempts: bool,
    ) -> Result<Option<Exam>, AppError>;

    /// Submit: stores the score on an `IN_PROGRESS` row and marks it `SUBMITTED`.
    /// Returns `None` when the row is missing or not in progress.
    async fn finish_exam(
        &self,
        exam_id: i64,
        score: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<Exam>, AppError>;
}
