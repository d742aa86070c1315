use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::error;

use crate::context::AppContext;
use crate::render::render_json;

pub async fn get(State(context): State<AppContext>) -> Response {
    match render_json(&context) {
        Ok(data) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            data,
        )
            .into_response(),
        Err(err) => {
            error!("failed to render packet fields: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                err.to_string(),
            )
                .into_response()
        }
    }
}
