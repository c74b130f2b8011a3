// src/store/postgres.rs

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::ContentStore;
use crate::{
    error::AppError,
    models::{
        exam::{Exam, ExamRow},
        question::{Answer, PublicAnswer, PublicQuestion, Question},
        topic::Topic,
    },
};

const EXAM_COLUMNS: &str =
    "id, student_id, topic_id, status, start_time, end_time, score, attempts_count";

/// Helper struct for the upsert that also reports whether the row is new.
#[derive(sqlx::FromRow)]
struct UpsertedExam {
    #[sqlx(flatten)]
    row: ExamRow,
    created: bool,
}

/// `ContentStore` backed by Postgres.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn select_exam(&self, student_id: i64, topic_id: i64) -> Result<Option<Exam>, AppError> {
        let row = sqlx::query_as::<_, ExamRow>(&format!(
            "SELECT {EXAM_COLUMNS} FROM exams WHERE student_id = $1 AND topic_id = $2"
        ))
        .bind(student_id)
        .bind(topic_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                "Failed to fetch exam for student {} topic {}: {:?}",
                student_id,
                topic_id,
                e
            );
            AppError::InternalServerError(e.to_string())
        })?;

        row.map(into_exam).transpose()
    }
}

fn into_exam(row: ExamRow) -> Result<Exam, AppError> {
    Exam::try_from(row).map_err(AppError::InternalServerError)
}

/// Appends `(id, id, ...)` to an `IN` clause. Callers must not pass an empty slice.
fn push_id_list(builder: &mut QueryBuilder<'_, Postgres>, ids: &[i64]) {
    builder.push("(");
    let mut separated = builder.separated(",");
    for id in ids {
        separated.push_bind(*id);
    }
    separated.push_unseparated(")");
}

#[async_trait]
impl ContentStore for PgStore {
    async fn get_topic(&self, topic_id: i64) -> Result<Option<Topic>, AppError> {
        sqlx::query_as::<_, Topic>(
            r#"
            SELECT id, name, duration_minutes, pass_score, question_count
            FROM topics
            WHERE id = $1
            "#,
        )
        .bind(topic_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch topic {}: {:?}", topic_id, e);
            AppError::InternalServerError(e.to_string())
        })
    }

    async fn active_question_ids(&self, topic_id: i64) -> Result<Vec<i64>, AppError> {
        sqlx::query_scalar::<_, i64>(
            "SELECT id FROM questions WHERE topic_id = $1 AND is_active ORDER BY id",
        )
        .bind(topic_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch question ids for topic {}: {:?}", topic_id, e);
            AppError::InternalServerError(e.to_string())
        })
    }

    async fn question_content(&self, ids: &[i64]) -> Result<Vec<PublicQuestion>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query_builder = QueryBuilder::<Postgres>::new(
            "SELECT id, topic_id, content, is_multiple_choice, is_active FROM questions WHERE is_active AND id IN ",
        );
        push_id_list(&mut query_builder, ids);
        let questions: Vec<Question> = query_builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to fetch question content: {:?}", e);
                AppError::InternalServerError(e.to_string())
            })?;

        let mut query_builder = QueryBuilder::<Postgres>::new(
            "SELECT id, question_id, content, is_correct, is_active FROM answers WHERE is_active AND question_id IN ",
        );
        push_id_list(&mut query_builder, ids);
        query_builder.push(" ORDER BY id");
        let answers: Vec<Answer> = query_builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to fetch answer options: {:?}", e);
                AppError::InternalServerError(e.to_string())
            })?;

        let mut options: HashMap<i64, Vec<PublicAnswer>> = HashMap::new();
        for answer in answers {
            options
                .entry(answer.question_id)
                .or_default()
                .push(PublicAnswer {
                    id: answer.id,
                    content: answer.content,
                });
        }

        let mut by_id: HashMap<i64, Question> = questions.into_iter().map(|q| (q.id, q)).collect();

        // Preserve the caller's (shuffled) order.
        Ok(ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .map(|q| PublicQuestion {
                answers: options.remove(&q.id).unwrap_or_default(),
                id: q.id,
                content: q.content,
                is_multiple_choice: q.is_multiple_choice,
            })
            .collect())
    }

    async fn active_answers(&self, question_ids: &[i64]) -> Result<Vec<Answer>, AppError> {
        if question_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut query_builder = QueryBuilder::<Postgres>::new(
            "SELECT id, question_id, content, is_correct, is_active FROM answers WHERE is_active AND question_id IN ",
        );
        push_id_list(&mut query_builder, question_ids);

        query_builder
            .build_query_as()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Failed to fetch answer keys: {:?}", e);
                AppError::InternalServerError(e.to_string())
            })
    }

    async fn get_or_create_exam(
        &self,
        student_id: i64,
        topic_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(Exam, bool), AppError> {
        // Single statement: insert if absent, otherwise read the existing row.
        let upserted = sqlx::query_as::<_, UpsertedExam>(&format!(
            r#"
            WITH inserted AS (
                INSERT INTO exams (student_id, topic_id, status, start_time, attempts_count)
                VALUES ($1, $2, 'IN_PROGRESS', $3, 1)
                ON CONFLICT (student_id, topic_id) DO NOTHING
                RETURNING {EXAM_COLUMNS}
            )
            SELECT {EXAM_COLUMNS}, TRUE AS created FROM inserted
            UNION ALL
            SELECT {EXAM_COLUMNS}, FALSE AS created FROM exams
            WHERE student_id = $1 AND topic_id = $2
              AND NOT EXISTS (SELECT 1 FROM inserted)
            "#
        ))
        .bind(student_id)
        .bind(topic_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to upsert exam: {:?}", e);
            AppError::InternalServerError(e.to_string())
        })?;

        if let Some(upserted) = upserted {
            return Ok((into_exam(upserted.row)?, upserted.created));
        }

        // A concurrent insert committed after this statement's snapshot was taken.
        let exam = self
            .select_exam(student_id, topic_id)
            .await?
            .ok_or_else(|| {
                AppError::InternalServerError(format!(
                    "exam row for student {} topic {} vanished after upsert",
                    student_id, topic_id
                ))
            })?;
        Ok((exam, false))
    }

    async fn get_exam(&self, exam_id: i64) -> Result<Option<Exam>, AppError> {
        let row = sqlx::query_as::<_, ExamRow>(&format!(
            "SELECT {EXAM_COLUMNS} FROM exams WHERE id = $1"
        ))
        .bind(exam_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to fetch exam {}: {:?}", exam_id, e);
            AppError::InternalServerError(e.to_string())
        })?;

        row.map(into_exam).transpose()
    }

    async fn reset_exam(
        &self,
        exam_id: i64,
        now: DateTime<Utc>,
        bump_attempts: bool,
    ) -> Result<Option<Exam>, AppError> {
        let row = sqlx::query_as::<_, ExamRow>(&format!(
            r#"
            UPDATE exams SET
                status = 'IN_PROGRESS',
                start_time = $2,
                end_time = NULL,
                score = NULL,
                attempts_count = CASE WHEN $3 THEN attempts_count + 1 ELSE attempts_count END
            WHERE id = $1 AND status <> 'IN_PROGRESS'
            RETURNING {EXAM_COLUMNS}
            "#
        ))
        .bind(exam_id)
        .bind(now)
        .bind(bump_attempts)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to reset exam {}: {:?}", exam_id, e);
            AppError::InternalServerError(e.to_string())
        })?;

        row.map(into_exam).transpose()
    }

    async fn finish_exam(
        &self,
        exam_id: i64,
        score: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<Exam>, AppError> {
        let row = sqlx::query_as::<_, ExamRow>(&format!(
            r#"
            UPDATE exams SET
                status = 'SUBMITTED',
                score = $2,
                end_time = $3
            WHERE id = $1 AND status = 'IN_PROGRESS'
            RETURNING {EXAM_COLUMNS}
            "#
        ))
        .bind(exam_id)
        .bind(score)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!("Failed to submit exam {}: {:?}", exam_id, e);
            AppError::InternalServerError(e.to_string())
        })?;

        row.map(into_exam).transpose()
    }
}
