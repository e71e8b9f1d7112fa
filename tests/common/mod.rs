#![allow(dead_code)]

use async_trait::async_trait;
use axum::http::{HeaderName, HeaderValue};
use axum_test::TestServer;
use chrono::Utc;
use lms_grader::{
    api::{create_router, AppState},
    CompletionClient, Course, Database, DatabaseGradingCache, GradingCache, GradingError,
    GradingService, LLMService, Module, Question, QuestionKind, Quiz, RateLimiter,
    RateLimiterSettings,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;

pub const EXPECTED_ANSWER: &str = "the cat sat on the mat";

/// What the scripted grader does on its next call.
pub enum Reply {
    Text(String),
    Fail,
    Hang,
}

pub fn reply_json(value: serde_json::Value) -> Reply {
    Reply::Text(value.to_string())
}

/// Completion client that replays a script; an exhausted script fails every call.
pub struct ScriptedClient {
    replies: Mutex<VecDeque<Reply>>,
    calls: AtomicUsize,
}

impl ScriptedClient {
    pub fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn complete(&self, _system: Option<&str>, _prompt: &str) -> Result<String, GradingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.replies.lock().unwrap().pop_front();
        match next {
            Some(Reply::Text(text)) => Ok(text),
            Some(Reply::Hang) => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Err(GradingError::EmptyResponse)
            }
            Some(Reply::Fail) | None => Err(GradingError::Provider(anyhow::anyhow!("scripted failure"))),
        }
    }

    fn provider_name(&self) -> &str {
        "Scripted"
    }

    fn model_name(&self) -> &str {
        "scripted-grader"
    }
}

pub fn mcq_question(id: &str, options: &[&str], correct: &str) -> Question {
    Question {
        id: id.to_string(),
        question: format!("Question {}", id),
        order: 1,
        max_score: None,
        kind: QuestionKind::Mcq {
            options: options.iter().map(|o| o.to_string()).collect(),
            correct_answer: correct.to_string(),
        },
    }
}

pub fn free_text_question(id: &str, expected: Option<&str>, max_score: Option<u32>) -> Question {
    Question {
        id: id.to_string(),
        question: "What happened on the mat?".to_string(),
        order: 2,
        max_score,
        kind: QuestionKind::FreeText {
            expected: expected.map(str::to_string),
            strictness: "normal".to_string(),
        },
    }
}

/// One module `m1` with a mixed quiz `quiz-1` (q1 MCQ, q2 free-text) and an
/// MCQ-only quiz `quiz-mcq`.
pub fn sample_course() -> Course {
    let now = Utc::now();
    Course {
        id: Uuid::new_v4(),
        title: "Reading Basics".to_string(),
        slug: format!("reading-basics-{}", Uuid::new_v4()),
        description: "Sample course".to_string(),
        modules: vec![Module {
            id: "m1".to_string(),
            title: "Module One".to_string(),
            order: 1,
            quizzes: vec![
                Quiz {
                    id: "quiz-1".to_string(),
                    title: "Mixed quiz".to_string(),
                    questions: vec![
                        mcq_question("q1", &["3", "4", "5"], "4"),
                        free_text_question("q2", Some(EXPECTED_ANSWER), Some(10)),
                    ],
                },
                Quiz {
                    id: "quiz-mcq".to_string(),
                    title: "MCQ only".to_string(),
                    questions: vec![
                        mcq_question("a", &["x", "y"], "x"),
                        mcq_question("b", &["x", "y"], "y"),
                    ],
                },
            ],
        }],
        created_at: now,
        updated_at: now,
    }
}

pub struct Harness {
    pub service: GradingService,
    pub db: Database,
    pub client: Arc<ScriptedClient>,
    pub course: Course,
}

pub async fn harness_with(
    replies: Vec<Reply>,
    settings: RateLimiterSettings,
    timeout: Duration,
) -> Harness {
    let db = Database::new("sqlite::memory:").await.unwrap();
    let course = sample_course();
    db.insert_course(&course).await.unwrap();

    let client = ScriptedClient::new(replies);
    let llm = LLMService::with_client(client.clone(), timeout);
    let cache: Arc<dyn GradingCache> = Arc::new(DatabaseGradingCache::new(db.clone()));
    let service = GradingService::new(db.clone(), llm, cache, RateLimiter::new(settings), 10);

    Harness {
        service,
        db,
        client,
        course,
    }
}

pub async fn harness(replies: Vec<Reply>) -> Harness {
    harness_with(replies, RateLimiterSettings::default(), Duration::from_secs(5)).await
}

pub fn test_server(harness: &Harness) -> TestServer {
    let state = AppState {
        grading_service: harness.service.clone(),
    };
    TestServer::new(create_router(state)).unwrap()
}

pub fn user_header() -> HeaderName {
    HeaderName::from_static("x-user-id")
}

pub fn role_header() -> HeaderName {
    HeaderName::from_static("x-user-role")
}

pub fn header_value(value: &str) -> HeaderValue {
    HeaderValue::from_str(value).unwrap()
}
