use axum::body::to_bytes;
use axum::response::IntoResponse;
use common_http_errors::ApiError;

#[tokio::test]
async fn bad_request_renders_detail_envelope() {
    let err = ApiError::bad_request("from_ts must be <= to_ts");
    let resp = err.into_response();
    assert_eq!(resp.status().as_u16(), 400);
    let body = to_bytes(resp.into_body(), 1024 * 8).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(
        text.contains("\"detail\":\"from_ts must be <= to_ts\""),
        "unexpected body: {}",
        text
    );
}

#[tokio::test]
async fn unauthorized_renders_static_detail() {
    let err = ApiError::Unauthorized { detail: "Missing API key" };
    let resp = err.into_response();
    assert_eq!(resp.status().as_u16(), 401);
    let body = to_bytes(resp.into_body(), 1024 * 8).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("\"detail\":\"Missing API key\""), "unexpected body: {}", text);
}

#[tokio::test]
async fn rate_limited_carries_window_headers() {
    let err = ApiError::RateLimited { limit: 2, remaining: 0, reset_epoch: 1_700_000_060 };
    let resp = err.into_response();
    assert_eq!(resp.status().as_u16(), 429);
    let headers = resp.headers();
    assert_eq!(headers.get("X-RateLimit-Limit").unwrap(), "2");
    assert_eq!(headers.get("X-RateLimit-Remaining").unwrap(), "0");
    assert_eq!(headers.get("X-RateLimit-Reset").unwrap(), "1700000060");
    let body = to_bytes(resp.into_body(), 1024 * 8).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("\"detail\":\"Rate limit exceeded\""), "unexpected body: {}", text);
}
