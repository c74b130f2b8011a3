// src/engine/scoring.rs

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::{error::AppError, store::ContentStore};

/// Selected answer ids per question id.
pub type SubmittedAnswers = HashMap<i64, HashSet<i64>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionKind {
    Single,
    Multiple,
}

/// Authoritative answer data for one question, always read fresh from the store.
#[derive(Debug, Clone)]
pub struct AnswerKey {
    pub kind: QuestionKind,
    pub correct: HashSet<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreOutcome {
    pub score: i32,
    pub passed: bool,
    pub correct_count: usize,
    pub total_questions: usize,
}

/// Score of a single question in `[0, 1]`.
///
/// Single choice: 1 only when exactly one option was picked and it is correct.
/// Multiple choice: `max(0, (C - W) / T)` with `C` correct picks, `W` wrong picks
/// and `T` correct options.
pub fn score_question(key: &AnswerKey, selected: &HashSet<i64>) -> f64 {
    match key.kind {
        QuestionKind::Single => match selected.iter().next() {
            Some(pick) if selected.len() == 1 && key.correct.contains(pick) => 1.0,
            _ => 0.0,
        },
        QuestionKind::Multiple => {
            let total = key.correct.len();
            if total == 0 {
                return 0.0;
            }
            let right = selected.intersection(&key.correct).count() as f64;
            let wrong = (selected.len() as f64) - right;
            ((right - wrong) / total as f64).max(0.0)
        }
    }
}

/// `round(sum / total * 100)`, or 0 for an empty topic.
pub fn aggregate_score(sum: f64, total_questions: usize) -> i32 {
    if total_questions == 0 {
        return 0;
    }
    let percent = (sum / total_questions as f64) * 100.0;
    percent.round().clamp(0.0, 100.0) as i32
}

/// A topic with a non-positive threshold can never be passed, and neither can a zero score.
pub fn passes(score: i32, pass_score: i32) -> bool {
    score > 0 && pass_score > 0 && score >= pass_score
}

/// Grades `submitted` against `keys`. Questions in `keys` that were not answered
/// count as 0; answers for questions missing from `keys` are ignored.
pub fn grade(
    keys: &HashMap<i64, AnswerKey>,
    submitted: &SubmittedAnswers,
    total_questions: usize,
    pass_score: i32,
) -> ScoreOutcome {
    let mut sum = 0.0;
    let mut correct_count = 0;

    for (question_id, key) in keys {
        let Some(selected) = submitted.get(question_id) else {
            continue;
        };
        let points = score_question(key, selected);
        if points >= 1.0 {
            correct_count += 1;
        }
        sum += points;
    }

    let score = aggregate_score(sum, total_questions);
    ScoreOutcome {
        score,
        passed: passes(score, pass_score),
        correct_count,
        total_questions,
    }
}

/// Scores submissions against the content store.
pub struct ScoringEngine {
    store: Arc<dyn ContentStore>,
}

impl ScoringEngine {
    pub fn new(store: Arc<dyn ContentStore>) -> Self {
        Self { store }
    }

    /// Scores `submitted` for `topic_id`.
    ///
    /// The denominator is the size of the pool the topic serves. Answers for
    /// questions outside the topic are ignored; answering more topic questions
    /// than a pool holds is rejected.
    pub async fn score(
        &self,
        topic_id: i64,
        submitted: &SubmittedAnswers,
    ) -> Result<ScoreOutcome, AppError> {
        let topic = self
            .store
            .get_topic(topic_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Topic {} not found", topic_id)))?;

        let topic_questions: HashSet<i64> = self
            .store
            .active_question_ids(topic_id)
            .await?
            .into_iter()
            .collect();

        let total_questions = match topic.configured_pool_size() {
            Some(size) => size.min(topic_questions.len()),
            None => topic_questions.len(),
        };

        let mut answered: Vec<i64> = submitted
            .keys()
            .copied()
            .filter(|id| topic_questions.contains(id))
            .collect();
        answered.sort_unstable();

        if answered.len() > total_questions {
            return Err(AppError::BadRequest(format!(
                "Answers submitted for {} questions but the exam has {}",
                answered.len(),
                total_questions
            )));
        }

        let keys = self.answer_keys(&answered).await?;
        Ok(grade(&keys, submitted, total_questions, topic.pass_score))
    }

    async fn answer_keys(&self, question_ids: &[i64]) -> Result<HashMap<i64, AnswerKey>, AppError> {
        let questions = self.store.question_content(question_ids).await?;
        let answers = self.store.active_answers(question_ids).await?;

        let mut keys: HashMap<i64, AnswerKey> = questions
            .into_iter()
            .map(|q| {
                let kind = if q.is_multiple_choice {
                    QuestionKind::Multiple
                } else {
                    QuestionKind::Single
                };
                (
                    q.id,
                    AnswerKey {
                        kind,
                        correct: HashSet::new(),
                    },
                )
            })
            .collect();

        for answer in answers.into_iter().filter(|a| a.is_correct) {
            if let Some(key) = keys.get_mut(&answer.question_id) {
                key.correct.insert(answer.id);
            }
        }

        Ok(keys)
    }
}
