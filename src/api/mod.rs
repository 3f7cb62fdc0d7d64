use std::sync::Arc;

use axum::{routing::post, Router};

use crate::conversation::PromptTemplate;
use crate::inference::{Generate, GenerationParams};

pub mod handlers;
pub mod types;

/// Everything a request needs, constructed once in `main` and cloned per
/// request. The model handle and template are shared read-only.
#[derive(Clone)]
pub struct AppState {
    pub infer: Arc<dyn Generate>,
    pub template: Arc<PromptTemplate>,
    pub params: GenerationParams,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/chat", post(handlers::chat))
}
