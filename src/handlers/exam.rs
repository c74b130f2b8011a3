// src/handlers/exam.rs

use std::sync::Arc;

use axum::{
    Extension, Json,
    extract::{Path, State},
    response::IntoResponse,
};
use validator::Validate;

use crate::{
    engine::ExamEngine, error::AppError, models::exam::SubmitExamRequest, utils::jwt::Claims,
};

/// Starts or resumes the caller's attempt at a topic.
///
/// * Creates the attempt on first request.
/// * Returns the same attempt and question order while it is in progress.
/// * Resets the attempt for a retake if the last one did not pass.
pub async fn start_attempt(
    State(engine): State<Arc<ExamEngine>>,
    Extension(claims): Extension<Claims>,
    Path(topic_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let student_id = claims.student_id()?;
    tracing::debug!(user_id = %claims.sub, student_id, topic_id, "Start attempt requested");

    let attempt = engine.start_or_resume_attempt(student_id, topic_id).await?;

    Ok(Json(attempt))
}

/// Submits the caller's answers and returns the score and verdict.
pub async fn submit_attempt(
    State(engine): State<Arc<ExamEngine>>,
    Extension(claims): Extension<Claims>,
    Path(exam_id): Path<i64>,
    Json(req): Json<SubmitExamRequest>,
) -> Result<impl IntoResponse, AppError> {
    req.validate()?;
    let student_id = claims.student_id()?;

    let result = engine
        .submit_attempt(exam_id, student_id, req.topic_id, &req.answers)
        .await?;

    Ok(Json(result))
}

/// Returns the caller's own attempt record.
pub async fn get_attempt(
    State(engine): State<Arc<ExamEngine>>,
    Extension(claims): Extension<Claims>,
    Path(exam_id): Path<i64>,
) -> Result<impl IntoResponse, AppError> {
    let student_id = claims.student_id()?;
    let exam = engine.get_attempt(exam_id, student_id).await?;

    Ok(Json(exam))
}
