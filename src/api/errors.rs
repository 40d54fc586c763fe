use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    let message = message.into();
    let payload = json!({
        "ok": false,
        "detail": { "message": message },
    });
    (status, Json(payload)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn error_body_carries_the_message() {
        let response = error_response(StatusCode::BAD_REQUEST, "missing channel id");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let payload: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(payload["ok"], json!(false));
        assert_eq!(payload["detail"]["message"], json!("missing channel id"));
    }
}
