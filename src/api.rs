use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};

use crate::{
    auth::{AdminUser, CurrentUser},
    errors::{ApiError, ErrorContext},
    grading_service::GradingService,
    models::*,
};

// Import logging macros
use crate::{log_api_start, log_api_success, log_api_warn};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiResponse<()>>)>;

/// Unwraps a JSON body, answering malformed input with the standard error envelope.
fn json_body<T>(
    payload: Result<Json<T>, JsonRejection>,
    operation: &str,
) -> Result<T, (StatusCode, Json<ApiResponse<()>>)> {
    payload.map(|Json(body)| body).map_err(|rejection| {
        ApiError::ValidationError(rejection.body_text())
            .to_response_with_context(ErrorContext::new(operation, "request body"))
    })
}

#[derive(Clone)]
pub struct AppState {
    pub grading_service: GradingService,
}

#[derive(Debug, Deserialize)]
pub struct SubmissionsQuery {
    pub limit: Option<u32>,
}

#[derive(Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

// Quiz endpoints
pub async fn submit_quiz(
    State(state): State<AppState>,
    user: CurrentUser,
    Path((course_id, module_id, quiz_id)): Path<(String, String, String)>,
    payload: Result<Json<SubmitQuizRequest>, JsonRejection>,
) -> ApiResult<SubmitQuizResponse> {
    let request = json_body(payload, "submit_quiz")?;
    log_api_start!("submit_quiz", quiz_id = quiz_id, user_id = user.user_id);

    match state
        .grading_service
        .submit_attempt(&user.user_id, &course_id, &module_id, &quiz_id, &request.answers)
        .await
    {
        Ok(attempt) => {
            log_api_success!("submit_quiz", attempt_id = attempt.id, "attempt graded and stored");
            Ok(Json(SubmitQuizResponse {
                success: true,
                attempt_id: attempt.id,
                results: AttemptResults {
                    answers: attempt.answers,
                    total_score: attempt.total_score,
                    max_score: attempt.max_score,
                },
            }))
        }
        Err(e) => {
            let context = ErrorContext::new("submit_quiz", "quiz").with_id(&quiz_id);
            Err(e.to_response_with_context(context))
        }
    }
}

pub async fn get_quiz(
    State(state): State<AppState>,
    _user: CurrentUser,
    Path((course_id, module_id, quiz_id)): Path<(String, String, String)>,
) -> ApiResult<ApiResponse<QuizView>> {
    match state
        .grading_service
        .get_quiz_view(&course_id, &module_id, &quiz_id)
        .await
    {
        Ok(view) => Ok(Json(ApiResponse::success(view))),
        Err(e) => {
            let context = ErrorContext::new("get_quiz", "quiz").with_id(&quiz_id);
            Err(e.to_response_with_context(context))
        }
    }
}

pub async fn create_quiz(
    State(state): State<AppState>,
    _admin: AdminUser,
    Path((course_id, module_id)): Path<(String, String)>,
    payload: Result<Json<CreateQuizRequest>, JsonRejection>,
) -> ApiResult<ApiResponse<Quiz>> {
    let request = json_body(payload, "create_quiz")?;
    log_api_start!("create_quiz");

    match state
        .grading_service
        .create_quiz(&course_id, &module_id, request)
        .await
    {
        Ok(quiz) => {
            log_api_success!("create_quiz", format!("quiz {} created", quiz.id));
            Ok(Json(ApiResponse::success(quiz)))
        }
        Err(e) => {
            let context = ErrorContext::new("create_quiz", "module").with_id(&module_id);
            Err(e.to_response_with_context(context))
        }
    }
}

// Attempt endpoints
pub async fn get_attempt(
    State(state): State<AppState>,
    user: CurrentUser,
    Path(id): Path<String>,
) -> ApiResult<ApiResponse<QuizAttempt>> {
    log_api_start!("get_attempt", attempt_id = id);

    match state.grading_service.get_attempt(&id, &user).await {
        Ok(attempt) => {
            log_api_success!("get_attempt", attempt_id = attempt.id, "attempt retrieved");
            Ok(Json(ApiResponse::success(attempt)))
        }
        Err(e) => {
            if matches!(e, ApiError::NotFound(_)) {
                log_api_warn!("get_attempt", attempt_id = id, "attempt not found");
            }
            let context = ErrorContext::new("get_attempt", "attempt").with_id(&id);
            Err(e.to_response_with_context(context))
        }
    }
}

// Admin endpoints
pub async fn retry_evaluation(
    State(state): State<AppState>,
    _admin: AdminUser,
    payload: Result<Json<RetryEvaluationRequest>, JsonRejection>,
) -> ApiResult<RetryEvaluationResponse> {
    let request = json_body(payload, "retry_evaluation")?;
    let attempt_id = request.attempt_id.unwrap_or_default();
    log_api_start!("retry_evaluation", attempt_id = attempt_id);

    match state.grading_service.retry_attempt(&attempt_id).await {
        Ok(response) => {
            log_api_success!(
                "retry_evaluation",
                attempt_id = response.attempt_id,
                format!("{} answers re-evaluated", response.regraded)
            );
            Ok(Json(response))
        }
        Err(e) => {
            let context = ErrorContext::new("retry_evaluation", "attempt").with_id(&attempt_id);
            Err(e.to_response_with_context(context))
        }
    }
}

pub async fn list_submissions(
    State(state): State<AppState>,
    _admin: AdminUser,
    Query(params): Query<SubmissionsQuery>,
) -> ApiResult<ApiResponse<Vec<QuizAttempt>>> {
    log_api_start!("list_submissions");

    match state.grading_service.list_submissions(params.limit).await {
        Ok(attempts) => {
            log_api_success!("list_submissions", count = attempts.len(), "submissions listed");
            Ok(Json(ApiResponse::success(attempts)))
        }
        Err(e) => {
            let context = ErrorContext::new("list_submissions", "attempt");
            Err(e.to_response_with_context(context))
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Student routes
        .route(
            "/api/courses/:course_id/modules/:module_id/quizzes/:quiz_id",
            get(get_quiz),
        )
        .route(
            "/api/courses/:course_id/modules/:module_id/quizzes/:quiz_id/submit",
            post(submit_quiz),
        )
        .route("/api/attempts/:id", get(get_attempt))
        // Admin routes
        .route("/api/admin/evaluations/retry", post(retry_evaluation))
        .route("/api/admin/submissions", get(list_submissions))
        .route(
            "/api/admin/courses/:course_id/modules/:module_id/quizzes",
            post(create_quiz),
        )
        .with_state(state)
}
