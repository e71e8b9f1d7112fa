use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::auth::CurrentUser;
use crate::database::Database;
use crate::errors::ApiError;
use crate::grading_cache::{CacheKey, GradingCache};
use crate::llm_service::{AiEvaluation, EvaluationItem, LLMService};
use crate::models::*;
use crate::rate_limiter::{RateLimitPolicy, RateLimiter};
use crate::scoring::{attempt_totals, fallback_score, grade_mcq, is_correct, scale_to_max};

// Import logging macros
use crate::{
    log_cache_event, log_rate_limit, log_service_start, log_service_success, log_service_warn,
    log_validation,
};

pub const SUBMIT_FALLBACK_FEEDBACK: &str = "Fallback evaluation due to AI error";
pub const RETRY_FALLBACK_FEEDBACK: &str = "Pending review";
pub const MAX_SUBMISSIONS_LIMIT: u32 = 200;

const SERVICE: &str = "grading_service";

#[derive(Clone)]
pub struct GradingService {
    db: Database,
    llm: LLMService,
    cache: Arc<dyn GradingCache>,
    rate_limiter: RateLimiter,
    default_max_score: u32,
}

impl GradingService {
    pub fn new(
        db: Database,
        llm: LLMService,
        cache: Arc<dyn GradingCache>,
        rate_limiter: RateLimiter,
        default_max_score: u32,
    ) -> Self {
        Self {
            db,
            llm,
            cache,
            rate_limiter,
            default_max_score,
        }
    }

    // Free-text grading

    /// Never fails: cache errors are treated as misses and grader failures
    /// fall back to the lexical overlap score.
    pub async fn grade_free_text(
        &self,
        quiz_id: &str,
        user_id: &str,
        question: &Question,
        expected: Option<&str>,
        strictness: &str,
        answer: &str,
    ) -> GradedAnswer {
        let key = CacheKey::compute(quiz_id, &question.id, user_id, answer, strictness);

        match self.cache.get(&key).await {
            Ok(Some(cached)) => {
                log_cache_event!(hit, key = key, question_id = question.id);
                return cached;
            }
            Ok(None) => {
                log_cache_event!(miss, key = key, question_id = question.id);
            }
            Err(e) => {
                log_cache_event!(error, key = key, error = e, "lookup failed, grading anyway");
            }
        }

        let max_score = question.max_score_or(self.default_max_score);

        let evaluation = if self.rate_limiter.try_consume(user_id) {
            self.call_grader(question, expected, strictness, answer).await
        } else {
            match self.rate_limiter.policy() {
                RateLimitPolicy::Advisory => {
                    log_rate_limit!(rejected, user_id = user_id, policy = RateLimitPolicy::Advisory, "grading anyway");
                    self.call_grader(question, expected, strictness, answer).await
                }
                RateLimitPolicy::Enforce => {
                    log_rate_limit!(rejected, user_id = user_id, policy = RateLimitPolicy::Enforce, "using fallback score");
                    None
                }
            }
        };

        let graded = match evaluation {
            Some(evaluation) => {
                free_text_grade(&question.id, answer, strictness, max_score, evaluation, GradeSource::Ai)
            }
            None => free_text_grade(
                &question.id,
                answer,
                strictness,
                max_score,
                fallback_evaluation(expected, answer, SUBMIT_FALLBACK_FEEDBACK),
                GradeSource::Fallback,
            ),
        };

        self.store_in_cache(key, quiz_id, user_id, strictness, answer, &graded)
            .await;
        graded
    }

    async fn call_grader(
        &self,
        question: &Question,
        expected: Option<&str>,
        strictness: &str,
        answer: &str,
    ) -> Option<AiEvaluation> {
        let item = EvaluationItem {
            id: question.id.clone(),
            question: question.question.clone(),
            expected: expected.map(str::to_string),
            answer: answer.to_string(),
            strictness: strictness.to_string(),
        };

        match self.llm.evaluate_answer(&item).await {
            Ok(evaluation) => Some(evaluation),
            Err(e) => {
                log_service_warn!(
                    SERVICE,
                    "grade_free_text",
                    format!("grader unavailable for question {}: {}", question.id, e)
                );
                None
            }
        }
    }

    async fn store_in_cache(
        &self,
        key: CacheKey,
        quiz_id: &str,
        user_id: &str,
        strictness: &str,
        answer: &str,
        graded: &GradedAnswer,
    ) {
        let entry = GradingCacheEntry {
            key: key.to_string(),
            quiz_id: quiz_id.to_string(),
            question_id: graded.question_id.clone(),
            user_id: user_id.to_string(),
            strictness: strictness.to_string(),
            input: answer.to_string(),
            result: graded.clone(),
            updated_at: Utc::now(),
        };

        if let Err(e) = self.cache.put(entry).await {
            log_cache_event!(error, key = key, error = e, "store failed");
        }
    }

    /// Grades each submitted answer in order, sequentially. Answers for
    /// questions the quiz does not contain are skipped.
    pub async fn grade_answers(
        &self,
        quiz: &Quiz,
        user_id: &str,
        answers: &[AnswerSubmission],
    ) -> Vec<GradedAnswer> {
        let mut graded = Vec::with_capacity(answers.len());

        for submission in answers {
            let Some(question) = quiz.question(&submission.question_id) else {
                debug!(
                    quiz_id = %quiz.id,
                    question_id = %submission.question_id,
                    "Skipping answer for unknown question"
                );
                continue;
            };

            let result = match &question.kind {
                QuestionKind::Mcq { correct_answer, .. } => grade_mcq(
                    &question.id,
                    &submission.answer,
                    correct_answer,
                    question.max_score_or(self.default_max_score),
                ),
                QuestionKind::FreeText {
                    expected,
                    strictness,
                } => {
                    self.grade_free_text(
                        &quiz.id,
                        user_id,
                        question,
                        expected.as_deref(),
                        strictness,
                        &submission.answer,
                    )
                    .await
                }
            };
            graded.push(result);
        }

        graded
    }

    // Attempts

    pub async fn submit_attempt(
        &self,
        user_id: &str,
        course_id: &str,
        module_id: &str,
        quiz_id: &str,
        answers: &[AnswerSubmission],
    ) -> Result<QuizAttempt, ApiError> {
        log_service_start!(SERVICE, "submit_attempt", answer_count = answers.len());
        let start = Instant::now();

        let course = self.load_course(course_id).await?;
        let quiz = course
            .find_module(module_id)
            .ok_or_else(|| ApiError::NotFound("Module not found".to_string()))?
            .quizzes
            .iter()
            .find(|q| q.id == quiz_id)
            .ok_or_else(|| ApiError::NotFound("Quiz not found".to_string()))?;

        let graded = self.grade_answers(quiz, user_id, answers).await;
        let (total_score, max_score) = attempt_totals(&graded);

        let attempt = QuizAttempt {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            course_id: course.id,
            module_id: module_id.to_string(),
            quiz_id: quiz.id.clone(),
            answers: graded,
            total_score,
            max_score,
            submitted_at: Utc::now(),
            reevaluated_at: None,
        };

        self.db.insert_attempt(&attempt).await?;

        log_service_success!(
            SERVICE,
            "submit_attempt",
            attempt_id = attempt.id,
            duration_ms = start.elapsed().as_millis() as u64
        );
        Ok(attempt)
    }

    /// Re-grades the free-text answers of a stored attempt with one batch call.
    pub async fn retry_attempt(&self, attempt_id: &str) -> Result<RetryEvaluationResponse, ApiError> {
        let attempt_id = attempt_id.trim();
        if attempt_id.is_empty() {
            return Err(ApiError::ValidationError("attemptId is required".to_string()));
        }
        let id = Uuid::parse_str(attempt_id)
            .map_err(|_| ApiError::NotFound("Attempt not found".to_string()))?;

        log_service_start!(SERVICE, "retry_attempt", attempt_id = id);
        let start = Instant::now();

        let mut attempt = self
            .db
            .get_attempt(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Attempt not found".to_string()))?;

        // A removed course or quiz leaves nothing to re-evaluate.
        let course = self.db.get_course(attempt.course_id).await?;
        let quiz = course
            .as_ref()
            .and_then(|course| course.find_quiz(&attempt.module_id, &attempt.quiz_id));
        if quiz.is_none() {
            debug!(attempt_id = %attempt.id, quiz_id = %attempt.quiz_id, "Quiz no longer exists");
        }

        // (answer index, question, expected, strictness) for free-text questions that still exist
        let targets: Vec<(usize, &Question, Option<&str>, &str)> = attempt
            .answers
            .iter()
            .enumerate()
            .filter_map(|(index, answer)| {
                let question = quiz?.question(&answer.question_id)?;
                match &question.kind {
                    QuestionKind::FreeText {
                        expected,
                        strictness,
                    } => Some((index, question, expected.as_deref(), strictness.as_str())),
                    QuestionKind::Mcq { .. } => None,
                }
            })
            .collect();

        if targets.is_empty() {
            log_service_success!(SERVICE, "retry_attempt", "no free-text answers to re-evaluate");
            return Ok(RetryEvaluationResponse {
                success: true,
                attempt_id: attempt.id,
                regraded: 0,
                total_score: attempt.total_score,
                max_score: attempt.max_score,
                message: Some("No free-text answers to re-evaluate".to_string()),
            });
        }

        let items: Vec<EvaluationItem> = targets
            .iter()
            .map(|(index, question, expected, strictness)| EvaluationItem {
                id: question.id.clone(),
                question: question.question.clone(),
                expected: expected.map(str::to_string),
                answer: attempt.answers[*index].answer.clone(),
                strictness: strictness.to_string(),
            })
            .collect();

        let (results, source): (HashMap<String, AiEvaluation>, GradeSource) =
            match self.llm.evaluate_batch(&items).await {
                Ok(results) => (results.into_iter().collect(), GradeSource::Ai),
                Err(e) => {
                    log_service_warn!(
                        SERVICE,
                        "retry_attempt",
                        format!("batch grading failed for attempt {}: {}", attempt.id, e)
                    );
                    let fallback: HashMap<String, AiEvaluation> = items
                        .iter()
                        .map(|item| {
                            (
                                item.id.clone(),
                                fallback_evaluation(
                                    item.expected.as_deref(),
                                    &item.answer,
                                    RETRY_FALLBACK_FEEDBACK,
                                ),
                            )
                        })
                        .collect();
                    (fallback, GradeSource::Fallback)
                }
            };

        let mut replacements = Vec::new();
        for (index, question, _, strictness) in &targets {
            let Some(evaluation) = results.get(&question.id) else {
                debug!(question_id = %question.id, "No grader result, keeping previous grade");
                continue;
            };
            let previous = &attempt.answers[*index];
            let graded = free_text_grade(
                &question.id,
                &previous.answer,
                strictness,
                question.max_score_or(self.default_max_score),
                evaluation.clone(),
                source,
            );
            replacements.push((*index, strictness.to_string(), graded));
        }

        let regraded = replacements.len();
        for (index, strictness, graded) in replacements {
            let key = CacheKey::compute(
                &attempt.quiz_id,
                &graded.question_id,
                &attempt.user_id,
                &graded.answer,
                &strictness,
            );
            self.store_in_cache(
                key,
                &attempt.quiz_id,
                &attempt.user_id,
                &strictness,
                &graded.answer,
                &graded,
            )
            .await;
            attempt.answers[index] = graded;
        }

        let (total_score, max_score) = attempt_totals(&attempt.answers);
        let reevaluated_at = Utc::now();
        let updated = self
            .db
            .update_attempt_grades(attempt.id, &attempt.answers, total_score, max_score, reevaluated_at)
            .await?;
        if !updated {
            return Err(ApiError::NotFound("Attempt not found".to_string()));
        }

        log_service_success!(
            SERVICE,
            "retry_attempt",
            attempt_id = attempt.id,
            duration_ms = start.elapsed().as_millis() as u64
        );

        Ok(RetryEvaluationResponse {
            success: true,
            attempt_id: attempt.id,
            regraded,
            total_score,
            max_score,
            message: None,
        })
    }

    pub async fn get_attempt(&self, attempt_id: &str, user: &CurrentUser) -> Result<QuizAttempt, ApiError> {
        let id = Uuid::parse_str(attempt_id.trim())
            .map_err(|_| ApiError::NotFound("Attempt not found".to_string()))?;

        let attempt = self
            .db
            .get_attempt(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Attempt not found".to_string()))?;

        if !user.can_view_attempt_of(&attempt.user_id) {
            return Err(ApiError::Forbidden(format!(
                "user {} cannot view attempt {}",
                user.user_id, attempt.id
            )));
        }

        Ok(attempt)
    }

    /// Most recent first; the limit is capped at 200.
    pub async fn list_submissions(&self, limit: Option<u32>) -> Result<Vec<QuizAttempt>, ApiError> {
        let limit = limit
            .unwrap_or(MAX_SUBMISSIONS_LIMIT)
            .clamp(1, MAX_SUBMISSIONS_LIMIT);
        Ok(self.db.list_recent_attempts(limit).await?)
    }

    // Quizzes

    pub async fn get_quiz_view(
        &self,
        course_id: &str,
        module_id: &str,
        quiz_id: &str,
    ) -> Result<QuizView, ApiError> {
        let course = self.load_course(course_id).await?;
        let module = course
            .find_module(module_id)
            .ok_or_else(|| ApiError::NotFound("Module not found".to_string()))?;
        let quiz = module
            .quizzes
            .iter()
            .find(|q| q.id == quiz_id)
            .ok_or_else(|| ApiError::NotFound("Quiz not found".to_string()))?;

        Ok(QuizView::from_quiz(quiz, self.default_max_score))
    }

    /// Appends a new quiz to a module of an existing course.
    pub async fn create_quiz(
        &self,
        course_id: &str,
        module_id: &str,
        request: CreateQuizRequest,
    ) -> Result<Quiz, ApiError> {
        let title = request.title.trim();
        if title.is_empty() {
            return Err(ApiError::ValidationError("Quiz title cannot be empty".to_string()));
        }
        if let Err(message) = validate_questions(&request.questions) {
            log_validation!(failure, "quiz", error = message.as_str());
            return Err(ApiError::ValidationError(message));
        }

        let course = self.load_course(course_id).await?;
        let mut modules = course.modules.clone();
        let module = modules
            .iter_mut()
            .find(|m| m.id == module_id)
            .ok_or_else(|| ApiError::NotFound("Module not found".to_string()))?;

        let quiz = Quiz {
            id: Uuid::new_v4().to_string(),
            title: title.to_string(),
            questions: request.questions,
        };
        module.quizzes.push(quiz.clone());

        if !self.db.update_course_modules(course.id, &modules).await? {
            return Err(ApiError::NotFound("Course not found".to_string()));
        }

        log_service_success!(SERVICE, "create_quiz", format!("quiz {} added to module {}", quiz.id, module_id));
        Ok(quiz)
    }

    async fn load_course(&self, course_id: &str) -> Result<Course, ApiError> {
        let id = Uuid::parse_str(course_id.trim())
            .map_err(|_| ApiError::NotFound("Course not found".to_string()))?;
        self.db
            .get_course(id)
            .await?
            .ok_or_else(|| ApiError::NotFound("Course not found".to_string()))
    }
}

/// Question ids and text must be present, ids unique within the quiz, and
/// every MCQ must offer at least two options including its correct answer.
pub fn validate_questions(questions: &[Question]) -> Result<(), String> {
    let mut seen = HashSet::new();

    for (position, question) in questions.iter().enumerate() {
        if question.id.trim().is_empty() {
            return Err(format!("Question {} is missing an id", position + 1));
        }
        if !seen.insert(question.id.as_str()) {
            return Err(format!("Duplicate question id '{}'", question.id));
        }
        if question.question.trim().is_empty() {
            return Err(format!("Question '{}' has no text", question.id));
        }
        if let Some(max_score) = question.max_score {
            if max_score > MAX_QUESTION_SCORE {
                return Err(format!(
                    "Question '{}' maxScore cannot exceed {}",
                    question.id, MAX_QUESTION_SCORE
                ));
            }
        }
        if let QuestionKind::Mcq {
            options,
            correct_answer,
        } = &question.kind
        {
            if options.len() < 2 {
                return Err(format!(
                    "Question '{}' needs at least two options",
                    question.id
                ));
            }
            if !options.contains(correct_answer) {
                return Err(format!(
                    "Question '{}' has a correctAnswer that is not one of its options",
                    question.id
                ));
            }
        }
    }

    Ok(())
}

fn fallback_evaluation(expected: Option<&str>, answer: &str, feedback: &str) -> AiEvaluation {
    AiEvaluation {
        ai_score: fallback_score(expected, answer),
        feedback: Some(feedback.to_string()),
        strengths: Vec::new(),
        improvements: Vec::new(),
    }
}

fn free_text_grade(
    question_id: &str,
    answer: &str,
    strictness: &str,
    max_score: u32,
    evaluation: AiEvaluation,
    source: GradeSource,
) -> GradedAnswer {
    GradedAnswer {
        question_id: question_id.to_string(),
        answer: answer.to_string(),
        kind: AnswerKind::FreeText,
        score: scale_to_max(evaluation.ai_score, max_score),
        max_score,
        correct: is_correct(evaluation.ai_score),
        source,
        explanation: None,
        feedback: evaluation.feedback,
        ai_score: Some(evaluation.ai_score),
        strictness: Some(strictness.to_string()),
        strengths: evaluation.strengths,
        improvements: evaluation.improvements,
        evaluated_at: Some(Utc::now()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mcq(id: &str, options: &[&str], correct: &str) -> Question {
        Question {
            id: id.to_string(),
            question: "Pick one".to_string(),
            order: 0,
            max_score: None,
            kind: QuestionKind::Mcq {
                options: options.iter().map(|o| o.to_string()).collect(),
                correct_answer: correct.to_string(),
            },
        }
    }

    #[test]
    fn test_validate_questions() {
        assert!(validate_questions(&[]).is_ok());
        assert!(validate_questions(&[mcq("q1", &["a", "b"], "a")]).is_ok());

        let err = validate_questions(&[mcq("q1", &["a"], "a")]).unwrap_err();
        assert!(err.contains("two options"));

        let err = validate_questions(&[mcq("q1", &["a", "b"], "c")]).unwrap_err();
        assert!(err.contains("correctAnswer"));

        let err = validate_questions(&[mcq("q1", &["a", "b"], "a"), mcq("q1", &["a", "b"], "b")])
            .unwrap_err();
        assert!(err.contains("Duplicate"));

        let err = validate_questions(&[mcq(" ", &["a", "b"], "a")]).unwrap_err();
        assert!(err.contains("missing an id"));

        let mut blank = mcq("q1", &["a", "b"], "a");
        blank.question = String::new();
        assert!(validate_questions(&[blank]).is_err());
    }

    #[test]
    fn test_validate_questions_bounds_max_score() {
        let mut question = mcq("q1", &["a", "b"], "a");
        question.max_score = Some(MAX_QUESTION_SCORE);
        assert!(validate_questions(&[question.clone()]).is_ok());

        question.max_score = Some(3_000_000_000);
        let err = validate_questions(&[question.clone()]).unwrap_err();
        assert!(err.contains("maxScore"));

        question.max_score = Some(0);
        assert!(validate_questions(&[question]).is_ok());
    }

    #[test]
    fn test_fallback_grade_scaling() {
        let evaluation = fallback_evaluation(
            Some("the cat sat on the mat"),
            "a cat sat on a mat",
            SUBMIT_FALLBACK_FEEDBACK,
        );
        let graded = free_text_grade("q1", "a cat sat on a mat", "normal", 10, evaluation, GradeSource::Fallback);
        assert_eq!(graded.ai_score, Some(80));
        assert_eq!(graded.score, 8);
        assert!(graded.correct);
        assert_eq!(graded.source, GradeSource::Fallback);
        assert_eq!(graded.feedback.as_deref(), Some(SUBMIT_FALLBACK_FEEDBACK));
        assert_eq!(graded.strictness.as_deref(), Some("normal"));
        assert!(graded.evaluated_at.is_some());
    }
}
