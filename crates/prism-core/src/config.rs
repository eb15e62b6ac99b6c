use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::warn;

/// Default instructional prompt sent to the vision model. Short plain
/// sentences keep the period-split segmentation honest.
const DEFAULT_PROMPT: &str = "Describe this image in detail. \
    Use short, plain sentences separated by periods. \
    Mention the subjects, the setting, the colors, and the mood.";

const DEFAULT_DETAIL: &str = "low";
const DEFAULT_THRESHOLD: f64 = 0.1;
const DEFAULT_VISION_MODEL: &str = "gpt-4o-mini";
const DEFAULT_CLASSIFIER_MODEL: &str = "distilbert-base-uncased-finetuned-sst-2-english";
const DEFAULT_ID_LENGTH: usize = 8;

#[derive(Debug, Clone)]
pub struct Config {
    pub vision_api_url: String,
    /// System-held credential substituted for allow-listed tokens.
    pub vision_api_key: String,
    pub classifier_api_url: String,
    pub classifier_api_key: String,

    pub database_url: String,
    pub redis_url: String,

    /// Root directory of the blob store.
    pub storage_dir: String,
    /// Base URL of this system's own storage domain. Source URLs
    /// already under it bypass the dedup cache entirely.
    pub public_base_url: String,

    /// Origins permitted by the CORS layer.
    pub allowed_origins: Vec<String>,
    /// Caller tokens that are transparently swapped for the
    /// system-held vision API key.
    pub shared_access_tokens: Vec<String>,

    pub http_port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            vision_api_url: std::env::var("VISION_API_URL")
                .unwrap_or_else(|_| "https://api.openai.com/v1".to_string()),
            vision_api_key: std::env::var("VISION_API_KEY")
                .context("VISION_API_KEY must be set")?,
            classifier_api_url: std::env::var("CLASSIFIER_API_URL")
                .unwrap_or_else(|_| "https://api-inference.huggingface.co".to_string()),
            classifier_api_key: std::env::var("CLASSIFIER_API_KEY")
                .context("CLASSIFIER_API_KEY must be set")?,

            database_url: std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),

            storage_dir: std::env::var("STORAGE_DIR")
                .unwrap_or_else(|_| "/data/images".to_string()),
            public_base_url: std::env::var("PUBLIC_BASE_URL")
                .context("PUBLIC_BASE_URL must be set")?
                .trim_end_matches('/')
                .to_string(),

            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .map(|s| split_csv(&s))
                .unwrap_or_default(),
            shared_access_tokens: std::env::var("SHARED_ACCESS_TOKENS")
                .map(|s| split_csv(&s))
                .unwrap_or_default(),

            http_port: std::env::var("HTTP_PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .context("HTTP_PORT must be a valid port number")?,
        })
    }

    /// Resolve the caller-supplied credential to the key used for the
    /// vision call. Tokens on the shared allow-list are swapped for the
    /// system-held key; anything else is forwarded as-is.
    pub fn resolve_api_key(&self, token: &str) -> String {
        if self.shared_access_tokens.iter().any(|t| t == token) {
            self.vision_api_key.clone()
        } else {
            token.to_string()
        }
    }
}

fn split_csv(s: &str) -> Vec<String> {
    s.split(',')
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Runtime tunables read by name from the key-value configuration
/// store. Every value falls back to a compiled default when its key is
/// absent or unreadable, so a fresh deployment works with no store
/// entries at all.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Instructional prompt for the vision model.
    pub prompt: String,
    /// Detail level requested from the vision model.
    pub detail: String,
    /// Base decision boundary for the good/bad sentiment split.
    pub threshold: f64,
    pub vision_model: String,
    pub classifier_model: String,
    /// Length of generated request identifiers.
    pub id_length: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            prompt: DEFAULT_PROMPT.to_string(),
            detail: DEFAULT_DETAIL.to_string(),
            threshold: DEFAULT_THRESHOLD,
            vision_model: DEFAULT_VISION_MODEL.to_string(),
            classifier_model: DEFAULT_CLASSIFIER_MODEL.to_string(),
            id_length: DEFAULT_ID_LENGTH,
        }
    }
}

impl Settings {
    /// Load the current settings. Reads happen per submission so values
    /// can change without a restart.
    pub async fn load(conn: &mut MultiplexedConnection) -> Self {
        let defaults = Settings::default();

        Settings {
            prompt: get_setting(conn, "prompt").await.unwrap_or(defaults.prompt),
            detail: get_setting(conn, "detail").await.unwrap_or(defaults.detail),
            threshold: get_setting(conn, "threshold")
                .await
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.threshold),
            vision_model: get_setting(conn, "vision_model")
                .await
                .unwrap_or(defaults.vision_model),
            classifier_model: get_setting(conn, "classifier_model")
                .await
                .unwrap_or(defaults.classifier_model),
            id_length: get_setting(conn, "id_length")
                .await
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.id_length),
        }
    }
}

async fn get_setting(conn: &mut MultiplexedConnection, name: &str) -> Option<String> {
    match conn.get::<_, Option<String>>(format!("config:{}", name)).await {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to read setting {}: {}", name, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            vision_api_url: "https://api.openai.com/v1".into(),
            vision_api_key: "sk-system".into(),
            classifier_api_url: "https://api-inference.huggingface.co".into(),
            classifier_api_key: "hf-system".into(),
            database_url: "postgres://localhost/prism".into(),
            redis_url: "redis://127.0.0.1:6379".into(),
            storage_dir: "/tmp/prism".into(),
            public_base_url: "https://images.example.com".into(),
            allowed_origins: vec![],
            shared_access_tokens: vec!["shared-alpha".into(), "shared-beta".into()],
            http_port: 3000,
        }
    }

    #[test]
    fn test_shared_token_is_substituted() {
        let config = test_config();
        assert_eq!(config.resolve_api_key("shared-alpha"), "sk-system");
        assert_eq!(config.resolve_api_key("shared-beta"), "sk-system");
    }

    #[test]
    fn test_other_tokens_pass_through() {
        let config = test_config();
        assert_eq!(config.resolve_api_key("sk-caller-own"), "sk-caller-own");
    }

    #[test]
    fn test_split_csv() {
        assert_eq!(
            split_csv("https://a.example, https://b.example ,"),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
        assert!(split_csv("").is_empty());
    }

    #[test]
    fn test_settings_defaults() {
        let settings = Settings::default();
        assert!((settings.threshold - 0.1).abs() < f64::EPSILON);
        assert_eq!(settings.id_length, 8);
        assert!(!settings.prompt.is_empty());
    }
}
