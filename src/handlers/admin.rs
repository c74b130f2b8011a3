// src/handlers/admin.rs

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, State},
    http::StatusCode,
    response::IntoResponse,
};

use crate::{engine::ExamEngine, utils::jwt::Claims};

/// Drops every cached pool and the cached metadata of a topic.
/// Called by content management after editing, deleting or importing questions.
/// Admin only.
pub async fn invalidate_topic(
    State(engine): State<Arc<ExamEngine>>,
    Extension(claims): Extension<Claims>,
    Path(topic_id): Path<i64>,
) -> impl IntoResponse {
    tracing::info!(user_id = %claims.sub, topic_id, "Topic cache invalidation requested");
    engine.invalidate_topic_caches(topic_id).await;

    StatusCode::NO_CONTENT
}
