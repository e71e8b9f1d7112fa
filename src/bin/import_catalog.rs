use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use lms_grader::database::Database;
use lms_grader::grading_service::validate_questions;
use lms_grader::models::{Course, Module};
use regex::Regex;
use serde::Deserialize;
use std::env;
use std::sync::LazyLock;
use uuid::Uuid;

static NON_SLUG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[^a-z0-9]+").expect("valid regex"));

/// A course as it appears in a catalog file. Ids and slugs are optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CatalogCourse {
    id: Option<Uuid>,
    title: String,
    slug: Option<String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    modules: Vec<Module>,
}

#[derive(Debug, Default)]
struct ImportStats {
    courses_in_file: usize,
    courses_valid: usize,
    courses_imported: usize,
    quizzes: usize,
    questions: usize,
    errors: Vec<String>,
}

impl ImportStats {
    fn print_summary(&self, dry_run: bool) {
        println!("\n=== Import Summary ===");
        println!("Courses in file: {}", self.courses_in_file);
        println!("Valid courses: {}", self.courses_valid);
        println!("Quizzes: {}", self.quizzes);
        println!("Questions: {}", self.questions);

        if dry_run {
            println!("Courses that WOULD BE imported: {}", self.courses_valid);
            println!("\n** DRY RUN MODE - No changes were made **");
        } else {
            println!("Courses imported: {}", self.courses_imported);
        }

        if !self.errors.is_empty() {
            println!("Errors encountered: {}", self.errors.len());
            for error in &self.errors {
                println!("  - {}", error);
            }
        }
    }
}

fn slugify(title: &str) -> String {
    NON_SLUG
        .replace_all(&title.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

/// Validates a catalog entry and turns it into a storable course.
fn build_course(entry: CatalogCourse) -> Result<Course, String> {
    let title = entry.title.trim();
    if title.is_empty() {
        return Err("course title cannot be empty".to_string());
    }

    let slug = entry
        .slug
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| slugify(title));
    if slug.is_empty() {
        return Err(format!("course '{}' has no usable slug", title));
    }

    for module in &entry.modules {
        if module.id.trim().is_empty() {
            return Err(format!("course '{}' has a module without an id", title));
        }
        for quiz in &module.quizzes {
            if quiz.id.trim().is_empty() {
                return Err(format!("module '{}' has a quiz without an id", module.id));
            }
            validate_questions(&quiz.questions)
                .map_err(|e| format!("quiz '{}' in module '{}': {}", quiz.id, module.id, e))?;
        }
    }

    let now = Utc::now();
    Ok(Course {
        id: entry.id.unwrap_or_else(Uuid::new_v4),
        title: title.to_string(),
        slug,
        description: entry.description,
        modules: entry.modules,
        created_at: now,
        updated_at: now,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args: Vec<String> = env::args().skip(1).collect();
    let dry_run = args.iter().any(|a| a == "--dry-run");
    let path = args
        .iter()
        .find(|a| !a.starts_with("--"))
        .ok_or_else(|| anyhow!("usage: import_catalog <catalog.json> [--dry-run]"))?;

    println!("=== Course Catalog Import ===");
    if dry_run {
        println!("** RUNNING IN DRY-RUN MODE **");
    }

    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path))?;
    let entries: Vec<CatalogCourse> =
        serde_json::from_str(&raw).with_context(|| format!("{} is not a course array", path))?;

    let mut stats = ImportStats {
        courses_in_file: entries.len(),
        ..Default::default()
    };

    let mut courses = Vec::new();
    for entry in entries {
        let label = entry.title.clone();
        match build_course(entry) {
            Ok(course) => {
                stats.quizzes += course.modules.iter().map(|m| m.quizzes.len()).sum::<usize>();
                stats.questions += course
                    .modules
                    .iter()
                    .flat_map(|m| &m.quizzes)
                    .map(|q| q.questions.len())
                    .sum::<usize>();
                println!("  ✓ {} ({}) - {} modules", course.title, course.slug, course.modules.len());
                courses.push(course);
            }
            Err(e) => {
                println!("  ✗ {}: {}", label, e);
                stats.errors.push(format!("{}: {}", label, e));
            }
        }
    }
    stats.courses_valid = courses.len();

    if dry_run {
        stats.print_summary(true);
        return Ok(());
    }

    let database_url =
        env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:lms_grader.db".to_string());
    println!("\nConnecting to database: {}", database_url);
    let db = Database::new(&database_url).await?;

    for course in &courses {
        if db.get_course(course.id).await?.is_some() {
            stats
                .errors
                .push(format!("{}: course {} already exists", course.title, course.id));
            continue;
        }
        match db.insert_course(course).await {
            Ok(()) => stats.courses_imported += 1,
            Err(e) => stats.errors.push(format!("{}: {}", course.title, e)),
        }
    }

    stats.print_summary(false);
    Ok(())
}
