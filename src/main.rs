use anyhow::Result;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use lms_grader::{
    api::{create_router, AppState},
    config::{CacheBackend, Config, LoggingConfig},
    database::Database,
    grading_cache::{DatabaseGradingCache, GradingCache, InMemoryGradingCache},
    grading_service::GradingService,
    llm_service::LLMService,
    log_system_event,
    rate_limiter::RateLimiter,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;

    // Initialize logging with console and file output
    let _guard = setup_logging(&config.logging)?;

    config.validate()?;
    log_system_event!(startup, component = "server", "Starting LMS grading service");

    let db = Database::new(&config.database.url).await?;
    info!("Database initialized successfully");

    let llm_service = LLMService::new_with_provider(
        config.llm.api_key.clone(),
        config.llm.base_url.clone(),
        config.llm.provider,
        config.llm.model.clone(),
        config.grading.ai_timeout(),
    );
    info!(
        provider = llm_service.provider_name(),
        model = llm_service.model_name(),
        timeout_secs = config.grading.ai_timeout_secs,
        "Initialized LLM service"
    );

    let cache: Arc<dyn GradingCache> = match config.grading.cache_backend {
        CacheBackend::Database => Arc::new(DatabaseGradingCache::new(db.clone())),
        CacheBackend::Memory => Arc::new(InMemoryGradingCache::new()),
    };

    let rate_limiter = RateLimiter::new(config.grading.rate_limiter_settings());

    let grading_service = GradingService::new(
        db,
        llm_service,
        cache,
        rate_limiter,
        config.grading.default_max_score,
    );

    let state = AppState { grading_service };

    let app = create_router(state).layer(ServiceBuilder::new().layer(CorsLayer::permissive()));

    let addr = config.server.address();
    log_system_event!(startup, component = "server", format!("listening on {}", addr));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn setup_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    use std::fs;
    use tracing_subscriber::fmt;

    let env_filter = EnvFilter::try_new(&config.level).unwrap_or_else(|_| EnvFilter::new("info"));

    let console_layer = config.console_enabled.then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true)
            .with_ansi(true)
            .boxed()
    });

    let mut guard = None;
    let file_layer = if config.file_enabled {
        fs::create_dir_all(&config.log_directory).unwrap_or_else(|e| {
            eprintln!("Warning: Could not create logs directory: {}", e);
        });

        // Daily rotation; no ANSI colors in files
        let file_appender = tracing_appender::rolling::daily(&config.log_directory, "lms-grader.log");
        let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
        guard = Some(file_guard);

        Some(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_ansi(false)
                .with_writer(non_blocking_file)
                .boxed(),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        log_directory = %config.log_directory,
        file_enabled = config.file_enabled,
        console_enabled = config.console_enabled,
        "Logging initialized"
    );

    Ok(guard)
}
