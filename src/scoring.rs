//! Deterministic scoring: exact-match MCQ grading, the lexical-overlap
//! fallback for free-text answers, and attempt totals.

use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::models::{AnswerKind, GradeSource, GradedAnswer};

/// A free-text answer counts as correct at or above this 0-100 score.
pub const CORRECT_THRESHOLD: u32 = 80;

/// Score given by the fallback when there is no expected answer to compare against.
pub const NO_REFERENCE_SCORE: u32 = 50;

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\W+").expect("valid regex"));

pub fn grade_mcq(question_id: &str, answer: &str, correct_answer: &str, max_score: u32) -> GradedAnswer {
    let correct = answer == correct_answer;
    GradedAnswer {
        question_id: question_id.to_string(),
        answer: answer.to_string(),
        kind: AnswerKind::Mcq,
        score: if correct { max_score } else { 0 },
        max_score,
        correct,
        source: GradeSource::ExactMatch,
        explanation: Some(if correct {
            "Correct!".to_string()
        } else {
            format!("Correct answer: {}", correct_answer)
        }),
        feedback: None,
        ai_score: None,
        strictness: None,
        strengths: Vec::new(),
        improvements: Vec::new(),
        evaluated_at: None,
    }
}

/// Lowercased word tokens, split on runs of non-word characters.
pub fn tokenize(text: &str) -> HashSet<String> {
    NON_WORD
        .split(&text.to_lowercase())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Share of distinct expected tokens present in the answer, as 0-100.
pub fn fallback_score(expected: Option<&str>, answer: &str) -> u32 {
    let expected_tokens = tokenize(expected.unwrap_or(""));
    if expected_tokens.is_empty() {
        return NO_REFERENCE_SCORE;
    }

    let answer_tokens = tokenize(answer);
    let matched = expected_tokens.intersection(&answer_tokens).count();
    let ratio = (matched as f64 / expected_tokens.len() as f64).min(1.0);
    (ratio * 100.0).round() as u32
}

/// Convert a 0-10 grader score to 0-100.
pub fn ten_point_to_percent(score: f64) -> u32 {
    if !score.is_finite() {
        return 0;
    }
    (score.clamp(0.0, 10.0) * 10.0).round() as u32
}

pub fn clamp_percent(score: f64) -> u32 {
    if !score.is_finite() {
        return 0;
    }
    score.clamp(0.0, 100.0).round() as u32
}

pub fn scale_to_max(ai_score: u32, max_score: u32) -> u32 {
    ((ai_score.min(100) as f64 / 100.0) * max_score as f64).round() as u32
}

pub fn is_correct(ai_score: u32) -> bool {
    ai_score >= CORRECT_THRESHOLD
}

/// `(totalScore, maxScore)` over all graded answers.
pub fn attempt_totals(answers: &[GradedAnswer]) -> (u32, u32) {
    answers.iter().fold((0u32, 0u32), |(total, max), answer| {
        (
            total.saturating_add(answer.score),
            max.saturating_add(answer.max_score),
        )
    })
}
