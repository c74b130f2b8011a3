//! In-process `ContentStore`.
//!
//! Holds all tables behind one mutex, which makes every operation (including the
//! exam upsert) atomic. This is a test double: besides the trait it exposes
//! seeding helpers and fault hooks (`set_unavailable`, `question_id_reads`,
//! `set_exam_outcome`). The service itself always runs on `PgStore`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::ContentStore;
use crate::{
    error::AppError,
    models::{
        exam::{Exam, ExamStatus},
        question::{Answer, PublicAnswer, PublicQuestion, Question},
        topic::Topic,
    },
};

#[derive(Default)]
struct Tables {
    topics: BTreeMap<i64, Topic>,
    questions: BTreeMap<i64, Question>,
    answers: BTreeMap<i64, Answer>,
    exams: BTreeMap<i64, Exam>,
    last_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    question_id_reads: AtomicU32,
    unavailable: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_available(&self) -> Result<(), AppError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(AppError::InternalServerError(
                "content store unavailable".to_string(),
            ));
        }
        Ok(())
    }

    /// Simulates an outage: every subsequent store call fails until cleared.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    /// How many times the active question ids of any topic were read.
    /// Each read corresponds to a pool cache miss.
    pub fn question_id_reads(&self) -> u32 {
        self.question_id_reads.load(Ordering::Relaxed)
    }

    pub fn add_topic(
        &self,
        name: &str,
        duration_minutes: i32,
        pass_score: i32,
        question_count: Option<i32>,
    ) -> i64 {
        let mut tables = self.tables();
        let id = tables.next_id();
        tables.topics.insert(
            id,
            Topic {
                id,
                name: name.to_string(),
                duration_minutes,
                pass_score,
                question_count,
            },
        );
        id
    }

    pub fn set_pass_score(&self, topic_id: i64, pass_score: i32) {
        if let Some(topic) = self.tables().topics.get_mut(&topic_id) {
            topic.pass_score = pass_score;
        }
    }

    /// Adds a question with its answer options `(content, is_correct)`.
    /// The multiple-choice flag is derived from the number of correct options.
    pub fn add_question(&self, topic_id: i64, content: &str, options: &[(&str, bool)]) -> i64 {
        let mut tables = self.tables();
        let question_id = tables.next_id();
        let correct = options.iter().filter(|(_, is_correct)| *is_correct).count();
        tables.questions.insert(
            question_id,
            Question {
                id: question_id,
                topic_id,
                content: content.to_string(),
                is_multiple_choice: correct > 1,
                is_active: true,
            },
        );
        for (text, is_correct) in options {
            let answer_id = tables.next_id();
            tables.answers.insert(
                answer_id,
                Answer {
                    id: answer_id,
                    question_id,
                    content: text.to_string(),
                    is_correct: *is_correct,
                    is_active: true,
                },
            );
        }
        question_id
    }

    pub fn deactivate_question(&self, question_id: i64) {
        if let Some(question) = self.tables().questions.get_mut(&question_id) {
            question.is_active = false;
        }
    }

    pub fn deactivate_answer(&self, answer_id: i64) {
        if let Some(answer) = self.tables().answers.get_mut(&answer_id) {
            answer.is_active = false;
        }
    }

    /// Answer ids of a question split into (correct, incorrect), active ones only.
    pub fn answer_key(&self, question_id: i64) -> (Vec<i64>, Vec<i64>) {
        self.tables()
            .answers
            .values()
            .filter(|a| a.question_id == question_id && a.is_active)
            .fold((Vec::new(), Vec::new()), |(mut right, mut wrong), a| {
                if a.is_correct {
                    right.push(a.id);
                } else {
                    wrong.push(a.id);
                }
                (right, wrong)
            })
    }

    pub fn exams(&self) -> Vec<Exam> {
        self.tables().exams.values().cloned().collect()
    }

    pub fn exams_for(&self, student_id: i64, topic_id: i64) -> Vec<Exam> {
        self.tables()
            .exams
            .values()
            .filter(|e| e.student_id == student_id && e.topic_id == topic_id)
            .cloned()
            .collect()
    }

    /// Overwrites the outcome of an exam, e.g. to mark it reviewed.
    pub fn set_exam_outcome(&self, exam_id: i64, status: ExamStatus, score: Option<i32>) {
        if let Some(exam) = self.tables().exams.get_mut(&exam_id) {
            exam.status = status;
            exam.score = score;
        }
    }
}

#[async_trait]
impl ContentStore for MemoryStore {
    async fn get_topic(&self, topic_id: i64) -> Result<Option<Topic>, AppError> {
        self.check_available()?;
        Ok(self.tables().topics.get(&topic_id).cloned())
    }

    async fn active_question_ids(&self, topic_id: i64) -> Result<Vec<i64>, AppError> {
        self.check_available()?;
        self.question_id_reads.fetch_add(1, Ordering::Relaxed);
        Ok(self
            .tables()
            .questions
            .values()
            .filter(|q| q.topic_id == topic_id && q.is_active)
            .map(|q| q.id)
            .collect())
    }

    async fn question_content(&self, ids: &[i64]) -> Result<Vec<PublicQuestion>, AppError> {
        self.check_available()?;
        let tables = self.tables();
        Ok(ids
            .iter()
            .filter_map(|id| tables.questions.get(id))
            .filter(|q| q.is_active)
            .map(|q| PublicQuestion {
                id: q.id,
                content: q.content.clone(),
                is_multiple_choice: q.is_multiple_choice,
                answers: tables
                    .answers
                    .values()
                    .filter(|a| a.question_id == q.id && a.is_active)
                    .map(|a| PublicAnswer {
                        id: a.id,
                        content: a.content.clone(),
                    })
                    .collect(),
            })
            .collect())
    }

    async fn active_answers(&self, question_ids: &[i64]) -> Result<Vec<Answer>, AppError> {
        self.check_available()?;
        Ok(self
            .tables()
            .answers
            .values()
            .filter(|a| a.is_active && question_ids.contains(&a.question_id))
            .cloned()
            .collect())
    }

    async fn get_or_create_exam(
        &self,
        student_id: i64,
        topic_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(Exam, bool), AppError> {
        self.check_available()?;
        let mut tables = self.tables();
        if let Some(existing) = tables
            .exams
            .values()
            .find(|e| e.student_id == student_id && e.topic_id == topic_id)
        {
            return Ok((existing.clone(), false));
        }

        let id = tables.next_id();
        let exam = Exam {
            id,
            student_id,
            topic_id,
            status: ExamStatus::InProgress,
            start_time: now,
            end_time: None,
            score: None,
            attempts_count: 1,
        };
        tables.exams.insert(id, exam.clone());
        Ok((exam, true))
    }

    async fn get_exam(&self, exam_id: i64) -> Result<Option<Exam>, AppError> {
        self.check_available()?;
        Ok(self.tables().exams.get(&exam_id).cloned())
    }

    async fn reset_exam(
        &self,
        exam_id: i64,
        now: DateTime<Utc>,
        bump_attempts: bool,
    ) -> Result<Option<Exam>, AppError> {
        self.check_available()?;
        let mut tables = self.tables();
        let Some(exam) = tables
            .exams
            .get_mut(&exam_id)
            .filter(|e| e.status.is_finished())
        else {
            return Ok(None);
        };

        exam.status = ExamStatus::InProgress;
        exam.start_time = now;
        exam.end_time = None;
        exam.score = None;
        if bump_attempts {
            exam.attempts_count += 1;
        }
        Ok(Some(exam.clone()))
    }

    async fn finish_exam(
        &self,
        exam_id: i64,
        score: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<Exam>, AppError> {
        self.check_available()?;
        let mut tables = self.tables();
        let Some(exam) = tables
            .exams
            .get_mut(&exam_id)
            .filter(|e| e.status == ExamStatus::InProgress)
        else {
            return Ok(None);
        };

        exam.status = ExamStatus::Submitted;
        exam.score = Some(score);
        exam.end_time = Some(now);
        Ok(Some(exam.clone()))
    }
}
