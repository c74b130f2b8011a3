//! Exam Session Engine.
//!
//! `ExamEngine` is the only entry point other parts of the service use:
//! starting or resuming an attempt, submitting it, and invalidating a topic's
//! cached pools after its content changed.

use std::sync::Arc;
use std::time::Duration;

use crate::{
    cache::PoolCache,
    config::{Config, DEFAULT_POOL_TTL_SECS, DEFAULT_TOPIC_TTL_SECS},
    error::AppError,
    models::exam::{AttemptResponse, Exam, SubmitResult},
    store::ContentStore,
};

pub mod pool;
pub mod scoring;
pub mod session;

pub use pool::{QuestionPool, QuestionPoolGenerator};
pub use scoring::{ScoringEngine, SubmittedAnswers};
pub use session::{ExamSessionManager, SessionOptions};

#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    pub pool_ttl: Duration,
    pub topic_ttl: Duration,
    pub session: SessionOptions,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            pool_ttl: Duration::from_secs(DEFAULT_POOL_TTL_SECS),
            topic_ttl: Duration::from_secs(DEFAULT_TOPIC_TTL_SECS),
            session: SessionOptions::default(),
        }
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            pool_ttl: config.pool_ttl,
            topic_ttl: config.topic_ttl,
            session: SessionOptions {
                track_attempts: config.track_attempts,
            },
        }
    }
}

pub struct ExamEngine {
    pools: Arc<QuestionPoolGenerator>,
    sessions: ExamSessionManager,
}

impl ExamEngine {
    pub fn new(
        store: Arc<dyn ContentStore>,
        cache: Arc<dyn PoolCache>,
        options: EngineOptions,
    ) -> Self {
        let pools = Arc::new(QuestionPoolGenerator::new(
            store.clone(),
            cache,
            options.pool_ttl,
            options.topic_ttl,
        ));
        let sessions = ExamSessionManager::new(store, pools.clone(), options.session);
        Self { pools, sessions }
    }

    /// Fails with `NotFound` for an unknown topic and `RetakeDenied` once the
    /// student has passed it.
    pub async fn start_or_resume_attempt(
        &self,
        student_id: i64,
        topic_id: i64,
    ) -> Result<AttemptResponse, AppError> {
        self.sessions.start_or_resume(student_id, topic_id).await
    }

    pub async fn submit_attempt(
        &self,
        exam_id: i64,
        student_id: i64,
        topic_id: i64,
        submitted: &SubmittedAnswers,
    ) -> Result<SubmitResult, AppError> {
        self.sessions
            .submit(exam_id, student_id, topic_id, submitted)
            .await
    }

    pub async fn get_attempt(&self, exam_id: i64, student_id: i64) -> Result<Exam, AppError> {
        self.sessions.get(exam_id, student_id).await
    }

    /// Hook for content management: call after any change to a topic or its
    /// questions/answers. Never fails; see `QuestionPoolGenerator::invalidate`.
    pub async fn invalidate_topic_caches(&self, topic_id: i64) {
        self.pools.invalidate(topic_id).await;
    }
}
