use std::env;
use std::path::PathBuf;

pub const DEFAULT_MODEL_ID: &str = "TinyLlama/TinyLlama-1.1B-Chat-v1.0";
const DEFAULT_ADDR: &str = "0.0.0.0:3000";

/// Environment-backed server configuration, read once at startup.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Address the HTTP listener binds to (`TINYCHAT_ADDR`).
    pub addr: String,
    /// Hugging Face repo id to pull the model from (`TINYCHAT_MODEL_ID`).
    pub model_id: String,
    /// Local snapshot directory; when set, the Hub is never contacted
    /// (`TINYCHAT_MODEL_DIR`).
    pub model_dir: Option<PathBuf>,
    /// Optional chat template override (`CHAT_TEMPLATE_PATH`).
    pub chat_template: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            addr: env::var("TINYCHAT_ADDR").unwrap_or_else(|_| DEFAULT_ADDR.into()),
            model_id: env::var("TINYCHAT_MODEL_ID").unwrap_or_else(|_| DEFAULT_MODEL_ID.into()),
            model_dir: env::var_os("TINYCHAT_MODEL_DIR").map(PathBuf::from),
            chat_template: env::var_os("CHAT_TEMPLATE_PATH").map(PathBuf::from),
        }
    }
}
