//! Configuration types for lms-dl
//!
//! One TOML file per profile under the platform config directory holds
//! the session cookies, the platform endpoints, the pending edit plan,
//! and the namespace labels. Everything has a sensible default so a
//! missing file is not an error; `store` backs up the previous file
//! before rewriting it.

use crate::error::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Application name used for the config directory
const APP_NAME: &str = "lms-dl";

/// Main configuration for lms-dl
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session cookies for the structured API realm
    pub api_cookies: BTreeMap<String, String>,

    /// Session cookies for the web realm
    pub web_cookies: BTreeMap<String, String>,

    /// Cookie names a credential helper must produce, in exchange order
    pub credential_keys: Vec<String>,

    /// Platform endpoint URLs and extra API query arguments
    pub endpoints: Endpoints,

    /// Pending one-shot tree edits, applied before the first resolution
    pub edit: EditPlan,

    /// Names used for directories, files, and record keys in the
    /// virtual namespace
    pub labels: Labels,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_cookies: BTreeMap::new(),
            web_cookies: BTreeMap::new(),
            credential_keys: vec!["PHPSESSID".to_string(), "user".to_string()],
            endpoints: Endpoints::default(),
            edit: EditPlan::default(),
            labels: Labels::default(),
        }
    }
}

/// Platform endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Endpoints {
    /// Full URL of the structured JSON API endpoint
    pub api_url: String,

    /// Base URL of the web realm (pages and redirect probes)
    pub web_url: String,

    /// Base URL file downloads are joined against
    pub file_url: String,

    /// URL a Web-realm credential helper should verify its session on
    pub session_check_url: String,

    /// Extra query arguments appended to every API request
    pub api_args: BTreeMap<String, String>,
}

impl Default for Endpoints {
    fn default() -> Self {
        let mut api_args = BTreeMap::new();
        api_args.insert("api".to_string(), "1".to_string());
        Self {
            api_url: String::new(),
            web_url: String::new(),
            file_url: String::new(),
            session_check_url: String::new(),
            api_args,
        }
    }
}

/// A pending, one-shot list of tree edits
///
/// Consumed exactly once, immediately before the very first path
/// resolution the tree performs, then discarded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EditPlan {
    /// Courses to splice into the course subtree, keyed by semester and
    /// external id (for courses the platform does not list, e.g. ones
    /// the user is not enrolled in)
    pub add_courses: Vec<CourseAddition>,

    /// Absolute paths to remove from the tree
    pub delete_paths: Vec<String>,
}

impl EditPlan {
    /// Whether the plan contains no edits
    pub fn is_empty(&self) -> bool {
        self.add_courses.is_empty() && self.delete_paths.is_empty()
    }
}

/// One queued course addition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CourseAddition {
    /// The semester directory the course belongs under
    pub semester: String,
    /// The platform's external id for the course
    pub course_sn: String,
}

/// Names used throughout the virtual namespace
///
/// Kept in configuration so a deployment can relabel the tree (the
/// platform is bilingual) without touching code. The defaults are the
/// English set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[allow(missing_docs)]
pub struct Labels {
    // Reserved top-level categories
    pub dir_courses: String,
    pub dir_students: String,
    pub dir_teachers: String,
    pub link_current_semester: String,

    // Course metadata record
    pub file_course_metadata: String,
    pub attr_name: String,
    pub attr_class: String,
    pub attr_serial: String,
    pub attr_time: String,
    pub attr_language: String,
    pub value_language_native: String,
    pub value_language_english: String,
    pub attr_course_code: String,
    pub attr_place: String,
    pub attr_remark: String,
    pub attr_evaluation: String,
    pub attr_item: String,
    pub attr_percent: String,
    pub attr_notes: String,

    // Announcements
    pub dir_announcements: String,
    pub dir_attachments: String,
    pub attr_subject: String,
    pub attr_date: String,
    pub attr_url: String,
    pub attr_attachment: String,
    pub attr_content: String,

    // Lecture contents
    pub dir_contents: String,
    pub dir_content_files: String,
    pub attr_week: String,
    pub attr_files: String,

    // Discussion boards
    pub dir_boards: String,
    pub file_board_metadata: String,
    pub attr_caption: String,
    pub attr_parent_post: String,
    pub attr_posted: String,
    pub attr_author: String,
    pub attr_author_name: String,
    pub attr_replies: String,
    pub attr_last_reply: String,
    pub dir_thread_files: String,

    // Homeworks
    pub dir_homeworks: String,
    pub file_homework: String,
    pub attr_description: String,
    pub attr_related_file: String,
    pub attr_type: String,
    pub value_type_individual: String,
    pub value_type_group: String,
    pub attr_published: String,
    pub attr_deadline: String,
    pub value_deadline_none: String,
    pub attr_late_submission: String,
    pub value_yes: String,
    pub value_no: String,
    pub dir_homework_files: String,
    pub dir_homework_scores: String,
    pub attr_submitted_at: String,
    pub attr_submitted_file: String,
    pub attr_letter_grade: String,
    pub attr_score: String,
    pub attr_comment: String,

    // Grades
    pub dir_grades: String,
    pub file_grades_table: String,
    pub attr_main_serial: String,
    pub attr_sub_serial: String,
    pub attr_tier: String,
    pub value_tier_attendance: String,
    pub value_tier_main: String,
    pub value_tier_main_with_sub: String,
    pub value_tier_semester: String,
    pub value_tier_sub: String,
    pub attr_weight: String,
    pub attr_grading: String,
    pub value_grading_percent: String,
    pub value_grading_letter: String,
    pub value_grading_unknown: String,
    pub attr_grade: String,
    pub attr_show: String,
    pub value_show_hidden: String,
    pub value_show_personal: String,
    pub attr_changed: String,
}

impl Default for Labels {
    fn default() -> Self {
        let s = |value: &str| value.to_string();
        Self {
            dir_courses: s("courses"),
            dir_students: s("students"),
            dir_teachers: s("teachers"),
            link_current_semester: s("current"),

            file_course_metadata: s("course.json"),
            attr_name: s("name"),
            attr_class: s("class"),
            attr_serial: s("serial"),
            attr_time: s("time"),
            attr_language: s("language"),
            value_language_native: s("Chinese"),
            value_language_english: s("English"),
            attr_course_code: s("course code"),
            attr_place: s("place"),
            attr_remark: s("remark"),
            attr_evaluation: s("evaluation"),
            attr_item: s("item"),
            attr_percent: s("percent"),
            attr_notes: s("notes"),

            dir_announcements: s("announcements"),
            dir_attachments: s("attachments"),
            attr_subject: s("subject"),
            attr_date: s("date"),
            attr_url: s("url"),
            attr_attachment: s("attachment"),
            attr_content: s("content"),

            dir_contents: s("contents"),
            dir_content_files: s("files"),
            attr_week: s("week"),
            attr_files: s("files"),

            dir_boards: s("boards"),
            file_board_metadata: s("board.json"),
            attr_caption: s("caption"),
            attr_parent_post: s("parent"),
            attr_posted: s("posted"),
            attr_author: s("author"),
            attr_author_name: s("author name"),
            attr_replies: s("replies"),
            attr_last_reply: s("last reply"),
            dir_thread_files: s("files"),

            dir_homeworks: s("homeworks"),
            file_homework: s("homework.json"),
            attr_description: s("description"),
            attr_related_file: s("related file"),
            attr_type: s("type"),
            value_type_individual: s("individual"),
            value_type_group: s("group"),
            attr_published: s("published"),
            attr_deadline: s("deadline"),
            value_deadline_none: s("indefinite"),
            attr_late_submission: s("late submission"),
            value_yes: s("yes"),
            value_no: s("no"),
            dir_homework_files: s("files"),
            dir_homework_scores: s("scores"),
            attr_submitted_at: s("submitted at"),
            attr_submitted_file: s("submitted file"),
            attr_letter_grade: s("letter grade"),
            attr_score: s("score"),
            attr_comment: s("comment"),

            dir_grades: s("grades"),
            file_grades_table: s("grades.csv"),
            attr_main_serial: s("main serial"),
            attr_sub_serial: s("sub serial"),
            attr_tier: s("tier"),
            value_tier_attendance: s("attendance"),
            value_tier_main: s("main item"),
            value_tier_main_with_sub: s("main item with sub-items"),
            value_tier_semester: s("semester grade"),
            value_tier_sub: s("sub-item"),
            attr_weight: s("weight"),
            attr_grading: s("grading"),
            value_grading_percent: s("percentage"),
            value_grading_letter: s("letter"),
            value_grading_unknown: s("unknown"),
            attr_grade: s("grade"),
            attr_show: s("published"),
            value_show_hidden: s("hidden"),
            value_show_personal: s("personal"),
            attr_changed: s("changed"),
        }
    }
}

impl Config {
    /// The config file path for a profile
    pub fn config_path(profile: &str) -> Result<PathBuf> {
        let dirs = ProjectDirs::from("", "", APP_NAME)
            .ok_or_else(|| Error::config("could not determine the platform config directory"))?;
        Ok(dirs.config_dir().join(format!("{profile}.toml")))
    }

    /// Load a profile's configuration; a missing file yields defaults
    pub fn load(profile: &str) -> Result<Config> {
        Self::load_path(&Self::config_path(profile)?)
    }

    /// Load configuration from an explicit file path
    pub fn load_path(path: &Path) -> Result<Config> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no configuration file, using defaults");
            return Ok(Config::default());
        }
        tracing::info!(path = %path.display(), "loading configuration");
        let text = fs::read_to_string(path)?;
        toml::from_str(&text).map_err(|e| Error::Config {
            message: format!("could not parse {}: {e}", path.display()),
            key: None,
        })
    }

    /// Store a profile's configuration, backing up the previous file
    pub fn store(&self, profile: &str) -> Result<()> {
        self.store_path(&Config::config_path(profile)?)
    }

    /// Store configuration to an explicit file path
    pub fn store_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        if path.exists() {
            let backup = path.with_extension("toml.bak");
            fs::copy(path, &backup)?;
            tracing::debug!(backup = %backup.display(), "previous configuration backed up");
        }
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::config(format!("could not serialize configuration: {e}")))?;
        fs::write(path, text)?;
        tracing::info!(path = %path.display(), "configuration stored");
        Ok(())
    }
}
