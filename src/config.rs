use envconfig::Envconfig;
use serde::{Deserialize, Serialize};

#[derive(Envconfig, Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[envconfig(from = "DATABASE_URL", default = "postgresql://localhost/peek_server")]
    pub database_url: String,

    #[envconfig(from = "PEEK_SERVER_PORT", default = "8080")]
    pub server_port: u16,

    /// Upper bound a client may request for a post's view budget.
    #[envconfig(from = "PEEK_MAX_VIEW_LIMIT", default = "100")]
    pub max_view_limit: i32,

    #[envconfig(from = "PEEK_MAX_CONTENT_LENGTH", default = "10000")]
    pub max_content_length: usize,

    #[envconfig(from = "PEEK_MAX_ANNOTATION_LENGTH", default = "250")]
    pub max_annotation_length: usize,

    #[envconfig(from = "PEEK_MAX_FILE_SIZE", default = "10485760")] // 10MB
    pub max_file_size: u64,

    #[envconfig(from = "PEEK_UPLOAD_DIR", default = "./uploads")]
    pub upload_dir: String,

    #[envconfig(from = "PEEK_UPLOAD_BASE_URL", default = "/uploads")]
    pub upload_base_url: String,

    #[envconfig(from = "PEEK_SLUG_LENGTH", default = "8")]
    pub slug_length: usize,

    #[envconfig(from = "PEEK_PING_INTERVAL_SECONDS", default = "30")]
    pub ping_interval_seconds: u64,

    #[envconfig(from = "RUST_LOG", default = "info")]
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Result<Self, envconfig::Error> {
        Self::init_from_env()
    }
}
