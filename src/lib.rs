pub mod api;
pub mod auth;
pub mod config;
pub mod database;
pub mod errors;
pub mod grading_cache;
pub mod grading_service;
pub mod llm_providers;
pub mod llm_service;
pub mod logging;
pub mod models;
pub mod rate_limiter;
pub mod scoring;

pub use api::{create_router, ApiResponse, AppState};
pub use auth::{AdminUser, CurrentUser, Role};
pub use config::{CacheBackend, Config};
pub use database::Database;
pub use errors::*;
pub use grading_cache::{CacheKey, DatabaseGradingCache, GradingCache, InMemoryGradingCache};
pub use grading_service::GradingService;
pub use llm_providers::{CompletionClient, JsonResponseParser, LLMProvider, LLMProviderFactory, LLMProviderType};
pub use llm_service::LLMService;
pub use models::*;
pub use rate_limiter::{RateLimitPolicy, RateLimiter, RateLimiterSettings};
