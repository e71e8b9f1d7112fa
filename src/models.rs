use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const DEFAULT_MAX_SCORE: u32 = 10;
pub const MAX_QUESTION_SCORE: u32 = 1000;
pub const DEFAULT_STRICTNESS: &str = "normal";

fn default_strictness() -> String {
    DEFAULT_STRICTNESS.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Course {
    pub id: Uuid,
    pub title: String,
    pub slug: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub modules: Vec<Module>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Course {
    pub fn find_module(&self, module_id: &str) -> Option<&Module> {
        self.modules.iter().find(|m| m.id == module_id)
    }

    pub fn find_quiz(&self, module_id: &str, quiz_id: &str) -> Option<&Quiz> {
        self.find_module(module_id)
            .and_then(|m| m.quizzes.iter().find(|q| q.id == quiz_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default)]
    pub quizzes: Vec<Quiz>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Quiz {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub questions: Vec<Question>,
}

impl Quiz {
    pub fn question(&self, question_id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.id == question_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    pub id: String,
    pub question: String,
    #[serde(default)]
    pub order: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_score: Option<u32>,
    #[serde(flatten)]
    pub kind: QuestionKind,
}

impl Question {
    pub fn max_score_or(&self, default_max_score: u32) -> u32 {
        self.max_score.unwrap_or(default_max_score)
    }
}

/// Question variants, tagged by `type` on the wire (`mcq` / `free-text`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum QuestionKind {
    Mcq {
        #[serde(default)]
        options: Vec<String>,
        correct_answer: String,
    },
    FreeText {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expected: Option<String>,
        #[serde(default = "default_strictness")]
        strictness: String,
    },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AnswerKind {
    Mcq,
    FreeText,
}

/// How a grade was produced.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum GradeSource {
    ExactMatch,
    Ai,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerSubmission {
    pub question_id: String,
    #[serde(default)]
    pub answer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GradedAnswer {
    pub question_id: String,
    pub answer: String,
    pub kind: AnswerKind,
    pub score: u32,
    pub max_score: u32,
    pub correct: bool,
    pub source: GradeSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_score: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strictness: Option<String>,
    #[serde(default)]
    pub strengths: Vec<String>,
    #[serde(default)]
    pub improvements: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evaluated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizAttempt {
    pub id: Uuid,
    pub user_id: String,
    pub course_id: Uuid,
    pub module_id: String,
    pub quiz_id: String,
    pub answers: Vec<GradedAnswer>,
    pub total_score: u32,
    pub max_score: u32,
    pub submitted_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reevaluated_at: Option<DateTime<Utc>>,
}

/// A row of the `ai_evaluations` collection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GradingCacheEntry {
    pub key: String,
    pub quiz_id: String,
    pub question_id: String,
    pub user_id: String,
    pub strictness: String,
    pub input: String,
    pub result: GradedAnswer,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitQuizRequest {
    #[serde(default)]
    pub answers: Vec<AnswerSubmission>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AttemptResults {
    pub answers: Vec<GradedAnswer>,
    pub total_score: u32,
    pub max_score: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitQuizResponse {
    pub success: bool,
    pub attempt_id: Uuid,
    pub results: AttemptResults,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryEvaluationRequest {
    #[serde(default)]
    pub attempt_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryEvaluationResponse {
    pub success: bool,
    pub attempt_id: Uuid,
    pub regraded: usize,
    pub total_score: u32,
    pub max_score: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQuizRequest {
    pub title: String,
    #[serde(default)]
    pub questions: Vec<Question>,
}

/// A quiz as shown to a student: no answer keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuizView {
    pub id: String,
    pub title: String,
    pub questions: Vec<QuestionView>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct QuestionView {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AnswerKind,
    pub question: String,
    pub order: i32,
    pub max_score: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

impl QuizView {
    pub fn from_quiz(quiz: &Quiz, default_max_score: u32) -> Self {
        let mut questions: Vec<QuestionView> = quiz
            .questions
            .iter()
            .map(|q| {
                let (kind, options) = match &q.kind {
                    QuestionKind::Mcq { options, .. } => (AnswerKind::Mcq, Some(options.clone())),
                    QuestionKind::FreeText { .. } => (AnswerKind::FreeText, None),
                };
                QuestionView {
                    id: q.id.clone(),
                    kind,
                    question: q.question.clone(),
                    order: q.order,
                    max_score: q.max_score_or(default_max_score),
                    options,
                }
            })
            .collect();
        questions.sort_by_key(|q| q.order);

        Self {
            id: quiz.id.clone(),
            title: quiz.title.clone(),
            questions,
        }
    }
}
