//! Shared HTTP middleware

use axum::Json;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tower_http::cors::CorsLayer;

use super::types::ErrorBody;

/// JSON 404 for unknown paths
pub async fn handle_404() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorBody {
            code: "NOT_FOUND".to_string(),
            message: "Unknown endpoint".to_string(),
        }),
    )
}

/// Dashboard clients connect from arbitrary origins; the API carries no
/// credentials, so a permissive policy is acceptable.
pub fn cors() -> CorsLayer {
    CorsLayer::permissive()
}
