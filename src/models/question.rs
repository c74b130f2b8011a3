// src/models/question.rs

use serde::{Deserialize, Serialize};
use sqlx::prelude::FromRow;

/// Represents the 'questions' table in the database.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Question {
    pub id: i64,

    pub topic_id: i64,

    /// The text content of the question.
    pub content: String,

    /// Set at authoring time when more than one answer is marked correct.
    pub is_multiple_choice: bool,

    pub is_active: bool,
}

/// Represents the 'answers' table in the database.
/// Only read during scoring; never sent to students.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Answer {
    pub id: i64,
    pub question_id: i64,
    pub content: String,
    pub is_correct: bool,
    pub is_active: bool,
}

/// DTO for sending an answer option to the client (excludes `is_correct`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicAnswer {
    pub id: i64,
    pub content: String,
}

/// DTO for sending a question to the client.
/// This is also the unit stored in a cached question pool, so it must never
/// carry correctness information.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublicQuestion {
    pub id: i64,
    pub content: String,
    pub is_multiple_choice: bool,
    pub answers: Vec<PublicAnswer>,
}
