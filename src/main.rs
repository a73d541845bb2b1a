mod error;
mod gemini;
mod ingest;
mod models;
mod orchestrator;
mod preprocess;
mod routes;

use axum::routing::{get, post, put};
use axum::Router;
use routes::{
    analyze_style, clear_viewer, get_preview, get_session, get_studio, get_viewer, remove_image,
    select_viewer, set_aspect_ratio, set_prompts, set_style, start_generation, upload_image,
    AppState,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{fmt, EnvFilter};

use crate::gemini::GeminiClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    // Init tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let api_key = std::env::var("GEMINI_API_KEY").unwrap_or_else(|_| "DEMO_KEY".into());
    if api_key == "DEMO_KEY" {
        tracing::warn!("GEMINI_API_KEY not set; analysis and generation calls will fail");
    }
    tracing::info!("Using API key: {}...", key_preview(&api_key));
    let state = AppState::new(Arc::new(GeminiClient::new(api_key)));

    let app = Router::new()
        .route("/api/upload/:kind", post(upload_image).delete(remove_image))
        .route("/api/preview/:id", get(get_preview))
        .route("/api/studio", get(get_studio))
        .route("/api/style", put(set_style))
        .route("/api/style/analyze", post(analyze_style))
        .route("/api/aspect-ratio", put(set_aspect_ratio))
        .route("/api/prompts", put(set_prompts))
        .route("/api/session", post(start_generation).get(get_session))
        .route(
            "/api/viewer",
            post(select_viewer).get(get_viewer).delete(clear_viewer),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "Starting server");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}

/// First few characters of the key for the startup log, never raw bytes.
fn key_preview(key: &str) -> String {
    key.chars().take(10).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_preview_is_safe_on_multibyte_input() {
        assert_eq!(key_preview("DEMO_KEY"), "DEMO_KEY");
        assert_eq!(key_preview("khóa-bí-mật-dài"), "khóa-bí-mậ");
        assert_eq!(key_preview(""), "");
    }
}
