use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::models::Language;

pub const DEMO_KEY: &str = "DEMO_KEY";

#[derive(Debug, Clone)]
pub struct Config {
    /// `None` selects demo mode.
    pub api_key: Option<String>,
    pub api_base: String,
    pub analysis_model: String,
    pub render_model: String,
    pub advisor_model: String,
    pub render_aspect_ratio: String,
    pub default_language: Language,
    pub http_timeout: Duration,
    pub port: u16,
    /// Request body cap for the upload route; the image arrives base64 encoded inside JSON.
    pub max_upload_bytes: usize,
    /// TrueType font for localized copy in PDF briefs.
    pub pdf_font_path: Option<PathBuf>,
    pub advisor_idle_timeout: Duration,
    pub advisor_max_sessions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            analysis_model: "gemini-3-flash-preview".to_string(),
            render_model: "gemini-2.5-flash-image".to_string(),
            advisor_model: "gemini-3-pro-preview".to_string(),
            render_aspect_ratio: "3:4".to_string(),
            default_language: Language::default(),
            http_timeout: Duration::from_secs(300),
            port: 8080,
            max_upload_bytes: 25 * 1024 * 1024,
            pdf_font_path: None,
            advisor_idle_timeout: Duration::from_secs(60 * 60),
            advisor_max_sessions: 256,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        let text = |key: &str, default: String| lookup(key).filter(|v| !v.trim().is_empty()).unwrap_or(default);

        let api_key = lookup("GEMINI_API_KEY")
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty() && k != DEMO_KEY);

        let default_language = match lookup("DEFAULT_LANGUAGE") {
            Some(raw) => raw.parse().unwrap_or_else(|e| {
                warn!("⚠️ DEFAULT_LANGUAGE: {}, using {}", e, defaults.default_language);
                defaults.default_language
            }),
            None => defaults.default_language,
        };

        let http_timeout = parse_or(&lookup, "HTTP_TIMEOUT_SECS", defaults.http_timeout.as_secs());
        let port = parse_or(&lookup, "PORT", defaults.port);
        let max_upload_bytes = parse_or(&lookup, "MAX_UPLOAD_BYTES", defaults.max_upload_bytes);
        let advisor_idle_minutes =
            parse_or(&lookup, "ADVISOR_IDLE_MINUTES", defaults.advisor_idle_timeout.as_secs() / 60);
        let advisor_max_sessions = parse_or(&lookup, "ADVISOR_MAX_SESSIONS", defaults.advisor_max_sessions);

        Self {
            api_key,
            api_base: text("GEMINI_API_BASE", defaults.api_base).trim_end_matches('/').to_string(),
            analysis_model: text("ANALYSIS_MODEL", defaults.analysis_model),
            render_model: text("RENDER_MODEL", defaults.render_model),
            advisor_model: text("ADVISOR_MODEL", defaults.advisor_model),
            render_aspect_ratio: text("RENDER_ASPECT_RATIO", defaults.render_aspect_ratio),
            default_language,
            http_timeout: Duration::from_secs(http_timeout),
            port,
            max_upload_bytes,
            pdf_font_path: lookup("PDF_FONT_PATH").filter(|v| !v.trim().is_empty()).map(PathBuf::from),
            advisor_idle_timeout: Duration::from_secs(advisor_idle_minutes * 60),
            advisor_max_sessions: advisor_max_sessions.max(1),
        }
    }

    pub fn demo_mode(&self) -> bool {
        self.api_key.is_none()
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: std::str::FromStr + std::fmt::Display + Copy,
{
    match lookup(key) {
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("⚠️ {}={:?} is not valid, using {}", key, raw, default);
            default
        }),
        None => default,
    }
}
