// src/engine/session.rs

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use tokio::sync::OwnedMutexGuard;

use super::{
    pool::QuestionPoolGenerator,
    scoring::{self, ScoringEngine, SubmittedAnswers},
};
use crate::{
    error::AppError,
    models::exam::{AttemptResponse, Exam, ExamStatus, SubmitResult},
    store::ContentStore,
};

/// Settings resolved once at startup.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// When false, retakes leave `attempts_count` untouched (older schemas
    /// without a maintained counter).
    pub track_attempts: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            track_attempts: true,
        }
    }
}

type PairKey = (i64, i64);

/// One async mutex per (student_id, topic_id). Idle entries are pruned whenever
/// a new lock is handed out, so the map only holds pairs that are in use.
#[derive(Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<PairKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl KeyedLocks {
    pub async fn acquire(&self, key: PairKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks.entry(key).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of pairs currently locked or waited on.
    pub fn active(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|lock| Arc::strong_count(lock) > 1)
            .count()
    }
}

/// State machine of an attempt per (student, topic):
/// `NONE -> IN_PROGRESS -> SUBMITTED [-> REVIEWED]`, with resume on
/// `IN_PROGRESS` and retake from a finished, non-passing attempt.
pub struct ExamSessionManager {
    store: Arc<dyn ContentStore>,
    pools: Arc<QuestionPoolGenerator>,
    scoring: ScoringEngine,
    locks: KeyedLocks,
    options: SessionOptions,
}

impl ExamSessionManager {
    pub fn new(
        store: Arc<dyn ContentStore>,
        pools: Arc<QuestionPoolGenerator>,
        options: SessionOptions,
    ) -> Self {
        Self {
            scoring: ScoringEngine::new(store.clone()),
            store,
            pools,
            locks: KeyedLocks::default(),
            options,
        }
    }

    /// Creates, resumes or retakes the student's attempt at a topic and returns
    /// it with the ordered question pool.
    pub async fn start_or_resume(
        &self,
        student_id: i64,
        topic_id: i64,
    ) -> Result<AttemptResponse, AppError> {
        let _guard = self.locks.acquire((student_id, topic_id)).await;

        let topic = self.pools.topic(topic_id).await?;
        let now = Utc::now();
        let (exam, created) = self
            .store
            .get_or_create_exam(student_id, topic_id, now)
            .await?;

        let exam = if created {
            tracing::info!(exam_id = exam.id, student_id, topic_id, "Exam attempt created");
            exam
        } else if exam.status == ExamStatus::InProgress {
            tracing::info!(exam_id = exam.id, student_id, topic_id, "Exam attempt resumed");
            exam
        } else {
            let prior = exam.score.unwrap_or(0);
            if scoring::passes(prior, topic.pass_score) {
                tracing::info!(
                    exam_id = exam.id,
                    student_id,
                    topic_id,
                    score = prior,
                    pass_score = topic.pass_score,
                    "Retake denied"
                );
                return Err(AppError::RetakeDenied(format!(
                    "Topic {} already passed with score {}",
                    topic_id, prior
                )));
            }
            self.retake(exam).await?
        };

        let pool = self
            .pools
            .get_pool(topic_id, topic.configured_pool_size())
            .await?;

        Ok(AttemptResponse {
            exam_id: exam.id,
            topic_id,
            status: exam.status,
            attempts_count: exam.attempts_count,
            started_at: exam.start_time,
            duration_minutes: topic.duration_minutes,
            questions: pool.questions,
        })
    }

    async fn retake(&self, exam: Exam) -> Result<Exam, AppError> {
        let reset = self
            .store
            .reset_exam(exam.id, Utc::now(), self.options.track_attempts)
            .await?;

        match reset {
            Some(reset) => {
                tracing::info!(
                    exam_id = reset.id,
                    student_id = reset.student_id,
                    topic_id = reset.topic_id,
                    attempts = reset.attempts_count,
                    "Exam retake started"
                );
                Ok(reset)
            }
            // Another process reset the row first; carry on with its attempt.
            None => self
                .store
                .get_exam(exam.id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("Exam {} not found", exam.id))),
        }
    }

    /// Scores an in-progress attempt and marks it submitted.
    pub async fn submit(
        &self,
        exam_id: i64,
        student_id: i64,
        topic_id: i64,
        submitted: &SubmittedAnswers,
    ) -> Result<SubmitResult, AppError> {
        let _guard = self.locks.acquire((student_id, topic_id)).await;

        let exam = self
            .store
            .get_exam(exam_id)
            .await?
            .filter(|e| e.student_id == student_id && e.topic_id == topic_id)
            .ok_or_else(|| AppError::NotFound(format!("Exam {} not found", exam_id)))?;

        if exam.status != ExamStatus::InProgress {
            return Err(AppError::Conflict(format!(
                "Exam {} is {}, not in progress",
                exam_id, exam.status
            )));
        }

        let outcome = self.scoring.score(topic_id, submitted).await?;

        self.store
            .finish_exam(exam_id, outcome.score, Utc::now())
            .await?
            .ok_or_else(|| AppError::Conflict(format!("Exam {} was already submitted", exam_id)))?;

        tracing::info!(
            exam_id,
            student_id,
            topic_id,
            score = outcome.score,
            passed = outcome.passed,
            "Exam submitted"
        );

        Ok(SubmitResult {
            exam_id,
            score: outcome.score,
            passed: outcome.passed,
            correct_count: outcome.correct_count,
            total_questions: outcome.total_questions,
        })
    }

    /// The student's own exam row.
    pub async fn get(&self, exam_id: i64, student_id: i64) -> Result<Exam, AppError> {
        self.store
            .get_exam(exam_id)
            .await?
            .filter(|e| e.student_id == student_id)
            .ok_or_else(|| AppError::NotFound(format!("Exam {} not found", exam_id)))
    }

    pub fn locks(&self) -> &KeyedLocks {
        &self.locks
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::cache::MemoryCache;
    use crate::store::MemoryStore;

    const STUDENT: i64 = 501;
    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    struct Fixture {
        store: Arc<MemoryStore>,
        manager: ExamSessionManager,
        topic_id: i64,
    }

    fn fixture(pass_score: i32, options: SessionOptions) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let topic_id = store.add_topic("Pattern matching", 45, pass_score, Some(5));
        for i in 0..10 {
            store.add_question(topic_id, &format!("Q{}", i), &[("yes", true), ("no", false)]);
        }
        let pools = Arc::new(QuestionPoolGenerator::new(
            store.clone(),
            Arc::new(MemoryCache::new()),
            DAY,
            DAY,
        ));
        let manager = ExamSessionManager::new(store.clone(), pools, options);
        Fixture {
            store,
            manager,
            topic_id,
        }
    }

    /// Answers the first `right` questions correctly and the rest wrongly.
    fn answers(store: &MemoryStore, question_ids: &[i64], right: usize) -> SubmittedAnswers {
        question_ids
            .iter()
            .enumerate()
            .map(|(i, q)| {
                let (correct, wrong) = store.answer_key(*q);
                let pick = if i < right { correct[0] } else { wrong[0] };
                (*q, HashSet::from([pick]))
            })
            .collect()
    }

    #[tokio::test]
    async fn test_first_start_creates_in_progress_row() {
        let f = fixture(70, SessionOptions::default());

        let attempt = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap();
        assert_eq!(attempt.status, ExamStatus::InProgress);
        assert_eq!(attempt.attempts_count, 1);
        assert_eq!(attempt.duration_minutes, 45);
        assert_eq!(attempt.questions.len(), 5);

        let rows = f.store.exams_for(STUDENT, f.topic_id);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].score, None);
        assert_eq!(rows[0].end_time, None);
    }

    #[tokio::test]
    async fn test_resume_is_idempotent() {
        let f = fixture(70, SessionOptions::default());

        let first = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap();
        let second = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap();

        assert_eq!(first.exam_id, second.exam_id);
        assert_eq!(first.question_ids(), second.question_ids());
        assert_eq!(first.started_at, second.started_at);
        assert_eq!(second.attempts_count, 1);
    }

    #[tokio::test]
    async fn test_failed_attempt_can_be_retaken_in_place() {
        let f = fixture(70, SessionOptions::default());
        let attempt = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap();
        f.store
            .set_exam_outcome(attempt.exam_id, ExamStatus::Submitted, Some(50));

        let retake = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap();
        assert_eq!(retake.exam_id, attempt.exam_id);
        assert_eq!(retake.status, ExamStatus::InProgress);
        assert_eq!(retake.attempts_count, 2);

        let rows = f.store.exams_for(STUDENT, f.topic_id);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].score, None);
        assert_eq!(rows[0].end_time, None);
    }

    #[tokio::test]
    async fn test_passed_attempt_blocks_retake_without_mutation() {
        let f = fixture(70, SessionOptions::default());
        let attempt = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap();
        f.store
            .set_exam_outcome(attempt.exam_id, ExamStatus::Submitted, Some(80));
        let before = f.store.exams_for(STUDENT, f.topic_id);

        let err = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap_err();
        assert!(matches!(err, AppError::RetakeDenied(_)));
        assert_eq!(f.store.exams_for(STUDENT, f.topic_id), before);
    }

    #[tokio::test]
    async fn test_reviewed_attempt_follows_the_same_gate() {
        let f = fixture(70, SessionOptions::default());
        let attempt = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap();
        f.store
            .set_exam_outcome(attempt.exam_id, ExamStatus::Reviewed, Some(40));

        let retake = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap();
        assert_eq!(retake.status, ExamStatus::InProgress);
    }

    #[tokio::test]
    async fn test_unsatisfiable_threshold_always_allows_retake() {
        let f = fixture(0, SessionOptions::default());
        let attempt = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap();
        f.store
            .set_exam_outcome(attempt.exam_id, ExamStatus::Submitted, Some(100));

        assert!(f.manager.start_or_resume(STUDENT, f.topic_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_attempt_counter_can_be_disabled() {
        let f = fixture(70, SessionOptions { track_attempts: false });
        let attempt = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap();
        f.store
            .set_exam_outcome(attempt.exam_id, ExamStatus::Submitted, Some(10));

        let retake = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap();
        assert_eq!(retake.attempts_count, 1);
    }

    #[tokio::test]
    async fn test_unknown_topic_is_not_found() {
        let f = fixture(70, SessionOptions::default());
        let err = f.manager.start_or_resume(STUDENT, 424242).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        assert!(f.store.exams().is_empty());
    }

    #[tokio::test]
    async fn test_submit_scores_and_finishes_attempt() {
        let f = fixture(70, SessionOptions::default());
        let attempt = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap();
        let submitted = answers(&f.store, &attempt.question_ids(), 4);

        let result = f
            .manager
            .submit(attempt.exam_id, STUDENT, f.topic_id, &submitted)
            .await
            .unwrap();
        assert_eq!(result.score, 80);
        assert!(result.passed);
        assert_eq!(result.correct_count, 4);
        assert_eq!(result.total_questions, 5);

        let row = f.manager.get(attempt.exam_id, STUDENT).await.unwrap();
        assert_eq!(row.status, ExamStatus::Submitted);
        assert_eq!(row.score, Some(80));
        assert!(row.end_time.is_some());
    }

    #[tokio::test]
    async fn test_full_cycle_keeps_one_row() {
        let f = fixture(70, SessionOptions::default());

        // Fail twice, then pass.
        for (round, right) in [2usize, 3, 5].into_iter().enumerate() {
            let attempt = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap();
            assert_eq!(attempt.attempts_count, round as i32 + 1);
            let submitted = answers(&f.store, &attempt.question_ids(), right);
            f.manager
                .submit(attempt.exam_id, STUDENT, f.topic_id, &submitted)
                .await
                .unwrap();
            assert_eq!(f.store.exams_for(STUDENT, f.topic_id).len(), 1);
        }

        let err = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap_err();
        assert!(matches!(err, AppError::RetakeDenied(_)));
        assert_eq!(f.store.exams_for(STUDENT, f.topic_id).len(), 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_foreign_or_mismatched_exam() {
        let f = fixture(70, SessionOptions::default());
        let attempt = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap();
        let submitted = SubmittedAnswers::new();

        let err = f
            .manager
            .submit(attempt.exam_id, STUDENT + 1, f.topic_id, &submitted)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let err = f
            .manager
            .submit(attempt.exam_id, STUDENT, f.topic_id + 1000, &submitted)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));

        let row = f.manager.get(attempt.exam_id, STUDENT).await.unwrap();
        assert_eq!(row.status, ExamStatus::InProgress);
    }

    #[tokio::test]
    async fn test_double_submit_conflicts() {
        let f = fixture(70, SessionOptions::default());
        let attempt = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap();
        let submitted = answers(&f.store, &attempt.question_ids(), 1);

        f.manager
            .submit(attempt.exam_id, STUDENT, f.topic_id, &submitted)
            .await
            .unwrap();
        let err = f
            .manager
            .submit(attempt.exam_id, STUDENT, f.topic_id, &submitted)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(
            f.manager.get(attempt.exam_id, STUDENT).await.unwrap().score,
            Some(20)
        );
    }

    #[tokio::test]
    async fn test_store_outage_propagates_as_server_error() {
        let f = fixture(70, SessionOptions::default());
        f.store.set_unavailable(true);

        let err = f.manager.start_or_resume(STUDENT, f.topic_id).await.unwrap_err();
        assert!(matches!(err, AppError::InternalServerError(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_share_one_row() {
        let f = Arc::new(fixture(70, SessionOptions::default()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let f = f.clone();
                tokio::spawn(async move { f.manager.start_or_resume(STUDENT, f.topic_id).await })
            })
            .collect();

        let mut exam_ids = HashSet::new();
        let mut orders = HashSet::new();
        for handle in handles {
            let attempt = handle.await.unwrap().unwrap();
            exam_ids.insert(attempt.exam_id);
            orders.insert(attempt.question_ids());
        }

        assert_eq!(exam_ids.len(), 1);
        assert_eq!(orders.len(), 1);
        assert_eq!(f.store.exams_for(STUDENT, f.topic_id).len(), 1);
        assert_eq!(f.manager.locks().active(), 0);
    }

    #[tokio::test]
    async fn test_different_students_get_separate_rows() {
        let f = fixture(70, SessionOptions::default());
        let a = f.manager.start_or_resume(1, f.topic_id).await.unwrap();
        let b = f.manager.start_or_resume(2, f.topic_id).await.unwrap();

        assert_ne!(a.exam_id, b.exam_id);
        assert_eq!(f.store.exams().len(), 2);
    }
}
