use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::time::Instant;
use uuid::Uuid;

use crate::models::*;

// Import logging macros
use crate::log_db_operation;

/// Document-style store: nested course content, attempt answers and cached
/// grades are kept as JSON text columns.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = if database_url.contains(":memory:") {
            // every pooled connection would otherwise open its own empty database
            SqlitePoolOptions::new()
                .max_connections(1)
                .connect(database_url)
                .await?
        } else {
            let url = if database_url.contains('?') {
                database_url.to_string()
            } else {
                format!("{}?mode=rwc", database_url)
            };
            SqlitePool::connect(&url).await?
        };

        let db = Database { pool };
        db.migrate().await?;
        log_db_operation!(info, "migrate", "database initialized");
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS courses (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                slug TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                modules TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS quiz_attempts (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                course_id TEXT NOT NULL,
                module_id TEXT NOT NULL,
                quiz_id TEXT NOT NULL,
                answers TEXT NOT NULL,
                total_score INTEGER NOT NULL,
                max_score INTEGER NOT NULL,
                submitted_at TEXT NOT NULL,
                reevaluated_at TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_quiz_attempts_submitted_at ON quiz_attempts (submitted_at DESC)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ai_evaluations (
                key TEXT PRIMARY KEY,
                quiz_id TEXT NOT NULL,
                question_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                strictness TEXT NOT NULL,
                input TEXT NOT NULL,
                result TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // Course operations
    pub async fn insert_course(&self, course: &Course) -> Result<()> {
        let modules_json = serde_json::to_string(&course.modules)?;

        sqlx::query(
            r#"
            INSERT INTO courses (id, title, slug, description, modules, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(course.id.to_string())
        .bind(&course.title)
        .bind(&course.slug)
        .bind(&course.description)
        .bind(modules_json)
        .bind(format_timestamp(&course.created_at))
        .bind(format_timestamp(&course.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_course(&self, id: Uuid) -> Result<Option<Course>> {
        let row = sqlx::query("SELECT * FROM courses WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row_to_course(&row)).transpose()
    }

    /// Returns false when the course does not exist.
    pub async fn update_course_modules(&self, id: Uuid, modules: &[Module]) -> Result<bool> {
        let modules_json = serde_json::to_string(modules)?;

        let result = sqlx::query("UPDATE courses SET modules = ?1, updated_at = ?2 WHERE id = ?3")
            .bind(modules_json)
            .bind(format_timestamp(&Utc::now()))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // Attempt operations
    pub async fn insert_attempt(&self, attempt: &QuizAttempt) -> Result<()> {
        let start = Instant::now();
        let answers_json = serde_json::to_string(&attempt.answers)?;

        sqlx::query(
            r#"
            INSERT INTO quiz_attempts (id, user_id, course_id, module_id, quiz_id, answers,
                                       total_score, max_score, submitted_at, reevaluated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(attempt.id.to_string())
        .bind(&attempt.user_id)
        .bind(attempt.course_id.to_string())
        .bind(&attempt.module_id)
        .bind(&attempt.quiz_id)
        .bind(answers_json)
        .bind(attempt.total_score as i64)
        .bind(attempt.max_score as i64)
        .bind(format_timestamp(&attempt.submitted_at))
        .bind(attempt.reevaluated_at.map(|d| format_timestamp(&d)))
        .execute(&self.pool)
        .await?;

        log_db_operation!(
            debug,
            "insert_attempt",
            id = attempt.id,
            duration_ms = start.elapsed().as_millis() as u64
        );
        Ok(())
    }

    pub async fn get_attempt(&self, id: Uuid) -> Result<Option<QuizAttempt>> {
        let row = sqlx::query("SELECT * FROM quiz_attempts WHERE id = ?1")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| row_to_attempt(&row)).transpose()
    }

    pub async fn list_recent_attempts(&self, limit: u32) -> Result<Vec<QuizAttempt>> {
        let start = Instant::now();
        let rows = sqlx::query("SELECT * FROM quiz_attempts ORDER BY submitted_at DESC LIMIT ?1")
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        let attempts = rows.iter().map(row_to_attempt).collect::<Result<Vec<_>>>()?;
        log_db_operation!(
            debug,
            "list_recent_attempts",
            count = attempts.len(),
            duration_ms = start.elapsed().as_millis() as u64
        );
        Ok(attempts)
    }

    /// Overwrites the graded answers and totals of an attempt after re-evaluation.
    pub async fn update_attempt_grades(
        &self,
        id: Uuid,
        answers: &[GradedAnswer],
        total_score: u32,
        max_score: u32,
        reevaluated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let answers_json = serde_json::to_string(answers)?;

        let result = sqlx::query(
            r#"
            UPDATE quiz_attempts
            SET answers = ?1, total_score = ?2, max_score = ?3, reevaluated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(answers_json)
        .bind(total_score as i64)
        .bind(max_score as i64)
        .bind(format_timestamp(&reevaluated_at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    // Grading cache operations
    pub async fn get_evaluation(&self, key: &str) -> Result<Option<GradedAnswer>> {
        let row = sqlx::query("SELECT result FROM ai_evaluations WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let result: String = row.get("result");
                Ok(Some(
                    serde_json::from_str(&result).context("corrupt cached grading result")?,
                ))
            }
            None => Ok(None),
        }
    }

    pub async fn upsert_evaluation(&self, entry: &GradingCacheEntry) -> Result<()> {
        let result_json = serde_json::to_string(&entry.result)?;

        sqlx::query(
            r#"
            INSERT INTO ai_evaluations (key, quiz_id, question_id, user_id, strictness, input, result, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            ON CONFLICT(key) DO UPDATE SET
                result = excluded.result,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&entry.key)
        .bind(&entry.quiz_id)
        .bind(&entry.question_id)
        .bind(&entry.user_id)
        .bind(&entry.strictness)
        .bind(&entry.input)
        .bind(result_json)
        .bind(format_timestamp(&entry.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn count_evaluations(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS count FROM ai_evaluations")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("count"))
    }
}

/// Fixed-width UTC timestamps so that text ordering matches time ordering.
fn format_timestamp(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn row_to_course(row: &SqliteRow) -> Result<Course> {
    Ok(Course {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        title: row.get("title"),
        slug: row.get("slug"),
        description: row.get("description"),
        modules: serde_json::from_str(&row.get::<String, _>("modules"))
            .context("corrupt course modules document")?,
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}

fn row_to_attempt(row: &SqliteRow) -> Result<QuizAttempt> {
    Ok(QuizAttempt {
        id: Uuid::parse_str(&row.get::<String, _>("id"))?,
        user_id: row.get("user_id"),
        course_id: Uuid::parse_str(&row.get::<String, _>("course_id"))?,
        module_id: row.get("module_id"),
        quiz_id: row.get("quiz_id"),
        answers: serde_json::from_str(&row.get::<String, _>("answers"))
            .context("corrupt attempt answers document")?,
        total_score: row.get::<i64, _>("total_score") as u32,
        max_score: row.get::<i64, _>("max_score") as u32,
        submitted_at: parse_timestamp(&row.get::<String, _>("submitted_at"))?,
        reevaluated_at: row
            .get::<Option<String>, _>("reevaluated_at")
            .map(|s| parse_timestamp(&s))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scoring::grade_mcq;

    fn sample_course() -> Course {
        let now = Utc::now();
        Course {
            id: Uuid::new_v4(),
            title: "Rust 101".to_string(),
            slug: "rust-101".to_string(),
            description: "Intro".to_string(),
            modules: vec![Module {
                id: "m1".to_string(),
                title: "Ownership".to_string(),
                order: 1,
                quizzes: vec![],
            }],
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn test_course_round_trip_and_module_update() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let mut course = sample_course();
        db.insert_course(&course).await.unwrap();

        let stored = db.get_course(course.id).await.unwrap().unwrap();
        assert_eq!(stored.slug, "rust-101");
        assert_eq!(stored.modules.len(), 1);

        course.modules[0].quizzes.push(Quiz {
            id: "quiz-1".to_string(),
            title: "Borrowing".to_string(),
            questions: vec![],
        });
        assert!(db.update_course_modules(course.id, &course.modules).await.unwrap());
        let stored = db.get_course(course.id).await.unwrap().unwrap();
        assert!(stored.find_quiz("m1", "quiz-1").is_some());

        assert!(!db.update_course_modules(Uuid::new_v4(), &course.modules).await.unwrap());
        assert!(db.get_course(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_slug_rejected() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        db.insert_course(&sample_course()).await.unwrap();
        assert!(db.insert_course(&sample_course()).await.is_err());
    }

    #[tokio::test]
    async fn test_attempt_insert_update_and_listing() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let base = Utc::now();

        let mut ids = Vec::new();
        for offset in 0..3 {
            let answers = vec![grade_mcq("q1", "a", "a", 10)];
            let attempt = QuizAttempt {
                id: Uuid::new_v4(),
                user_id: "student-1".to_string(),
                course_id: Uuid::new_v4(),
                module_id: "m1".to_string(),
                quiz_id: "quiz-1".to_string(),
                answers,
                total_score: 10,
                max_score: 10,
                submitted_at: base + chrono::Duration::seconds(offset),
                reevaluated_at: None,
            };
            db.insert_attempt(&attempt).await.unwrap();
            ids.push(attempt.id);
        }

        let recent = db.list_recent_attempts(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].id, ids[2]);
        assert_eq!(recent[1].id, ids[1]);

        let regraded = vec![grade_mcq("q1", "b", "a", 10)];
        let now = Utc::now();
        assert!(db.update_attempt_grades(ids[0], &regraded, 0, 10, now).await.unwrap());

        let stored = db.get_attempt(ids[0]).await.unwrap().unwrap();
        assert_eq!(stored.total_score, 0);
        assert_eq!(stored.answers[0].answer, "b");
        assert!(stored.reevaluated_at.is_some());
    }

    #[tokio::test]
    async fn test_evaluation_count() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        assert_eq!(db.count_evaluations().await.unwrap(), 0);

        let entry = GradingCacheEntry {
            key: "k1".to_string(),
            quiz_id: "quiz-1".to_string(),
            question_id: "q1".to_string(),
            user_id: "u1".to_string(),
            strictness: "normal".to_string(),
            input: "a".to_string(),
            result: grade_mcq("q1", "a", "a", 10),
            updated_at: Utc::now(),
        };
        db.upsert_evaluation(&entry).await.unwrap();
        db.upsert_evaluation(&entry).await.unwrap();
        assert_eq!(db.count_evaluations().await.unwrap(), 1);
    }
}
