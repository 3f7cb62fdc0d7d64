use std::sync::Arc;

use tokio::net::TcpListener;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod conversation;
mod inference;

use api::AppState;
use config::ServerConfig;
use conversation::PromptTemplate;
use inference::{Generate, GenerationParams, TinyLlamaService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    println!("🚀 Starting TinyLlama chat server...");

    // -----------------------------
    // Shared state / Dependencies
    // -----------------------------
    let cfg = ServerConfig::from_env();

    let template = Arc::new(PromptTemplate::load(cfg.chat_template.as_deref())?);
    let infer: Arc<dyn Generate> = Arc::new(TinyLlamaService::load(&cfg)?);

    let state = AppState {
        infer,
        template,
        params: GenerationParams::default(),
    };

    // -----------------------------
    // Router
    // -----------------------------
    // Dev CORS: every origin/method/header, credentials allowed. tower-http
    // rejects the wildcard + credentials combination, hence the mirror
    // variants. Tighten before exposing this anywhere real.
    let app = api::router()
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::mirror_request())
                .allow_methods(AllowMethods::mirror_request())
                .allow_headers(AllowHeaders::mirror_request())
                .allow_credentials(true),
        )
        .with_state(state);

    println!("🌐 HTTP listening on http://{}", cfg.addr);
    println!("💬 Chat endpoint at http://{}/api/chat", cfg.addr);

    let listener = TcpListener::bind(&cfg.addr).await?;
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
