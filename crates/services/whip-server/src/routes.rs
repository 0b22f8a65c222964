//! WHIP HTTP endpoints
//!
//! - `POST {whip_path}` - Submit an SDP offer, receive the answer
//! - `OPTIONS {whip_path}` - Advertise accepted content type and ICE servers
//! - `DELETE {whip_path}/:session_id` - Tear down a session
//! - `GET /health` - Health check
//! - `GET /sessions` - Snapshot of active sessions

use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::error;
use whip_ingest::{Error, ErrorKind, IngestResponse, WhipIngest, SDP_CONTENT_TYPE};

const ACCEPT_POST: HeaderName = HeaderName::from_static("accept-post");

/// Seconds a publisher should wait before retrying a saturated server
const RETRY_AFTER_SECS: &str = "5";

/// State shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub ingest: Arc<WhipIngest>,
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorKind,
    pub message: String,
}

/// Build the router for an ingest engine
pub fn router(ingest: Arc<WhipIngest>) -> Router {
    let config = ingest.config();
    let base = config.whip_path.trim_end_matches('/');
    let endpoint = if base.is_empty() { "/" } else { base };
    let resource = format!("{}/:session_id", base);
    let body_limit = config.max_offer_bytes;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::POST, Method::OPTIONS, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .expose_headers([header::LOCATION, header::LINK]);

    Router::new()
        .route(endpoint, post(ingest_offer).options(endpoint_options))
        .route(&resource, delete(teardown_session))
        .route("/health", get(health))
        .route("/sessions", get(list_sessions))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(AppState { ingest })
        .layer(
            tower::ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors),
        )
}

/// Negotiate a session for the offer in the request body
///
/// POST {whip_path}
async fn ingest_offer(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");

    match state.ingest.handle_ingest(&body, content_type) {
        Ok(response) => created(response),
        Err(e) => error_response(e),
    }
}

fn created(response: IngestResponse) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::CREATED)
        .header(header::CONTENT_TYPE, SDP_CONTENT_TYPE)
        .header(header::LOCATION, response.location.as_str());
    for link in &response.ice_server_links {
        builder = builder.header(header::LINK, link.as_str());
    }

    builder.body(Body::from(response.answer)).unwrap_or_else(|e| {
        error!(session_id = %response.session_id, "Failed to build answer response: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR.into_response()
    })
}

fn error_response(err: Error) -> Response {
    let status =
        StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = Json(ErrorResponse {
        error: err.kind(),
        message: err.to_string(),
    });

    if err.is_retryable() {
        (status, [(header::RETRY_AFTER, RETRY_AFTER_SECS)], body).into_response()
    } else {
        (status, body).into_response()
    }
}

/// OPTIONS {whip_path}
async fn endpoint_options(State(state): State<AppState>) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::NO_CONTENT)
        .header(ACCEPT_POST, SDP_CONTENT_TYPE);
    for link in state.ingest.ice_server_links() {
        builder = builder.header(header::LINK, link.as_str());
    }

    builder
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::NO_CONTENT.into_response())
}

/// DELETE {whip_path}/:session_id
async fn teardown_session(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
) -> StatusCode {
    let status = state.ingest.handle_teardown(&session_id).await;
    StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// GET /health
async fn health() -> &'static str {
    "ok"
}

/// GET /sessions
async fn list_sessions(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.ingest.snapshots())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::http::Request;
    use tower::ServiceExt;
    use whip_ingest::{
        BridgeEventSender, DtlsFingerprint, FixedCredentials, Offer, PortLease, Result,
        TransportFactory, TransportHandle, TransportParams, WhipIngestConfig,
    };

    struct IdleFactory;

    #[async_trait]
    impl TransportFactory for IdleFactory {
        async fn start(
            &self,
            _offer: Offer,
            params: TransportParams,
            _events: BridgeEventSender,
        ) -> Result<Box<dyn TransportHandle>> {
            Ok(Box::new(IdleTransport(params.port)))
        }
    }

    struct IdleTransport(#[allow(dead_code)] PortLease);

    #[async_trait]
    impl TransportHandle for IdleTransport {
        async fn close(self: Box<Self>) -> Result<()> {
            Ok(())
        }
    }

    fn offer_with(media: &str, rtpmap: &str) -> String {
        format!(
            "v=0\r\n\
             o=- 3141592653 2 IN IP4 127.0.0.1\r\n\
             s=-\r\n\
             t=0 0\r\n\
             a=group:BUNDLE 0\r\n\
             m={media} 9 UDP/TLS/RTP/SAVPF 111\r\n\
             c=IN IP4 0.0.0.0\r\n\
             a=ice-ufrag:Xq3z\r\n\
             a=ice-pwd:8hX5mTq0lAqTTbSVlPZ3Yc7E\r\n\
             a=fingerprint:sha-256 AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99:AA:BB:CC:DD:EE:FF:00:11:22:33:44:55:66:77:88:99\r\n\
             a=setup:actpass\r\n\
             a=mid:0\r\n\
             a=sendonly\r\n\
             a=rtcp-mux\r\n\
             a=rtpmap:111 {rtpmap}\r\n",
        )
    }

    fn opus_offer() -> String {
        offer_with("audio", "opus/48000/2")
    }

    fn app(max_sessions: usize) -> Router {
        let config = WhipIngestConfig::default()
            .with_max_sessions(max_sessions)
            .with_port_range(42000, 42099);
        let ingest = WhipIngest::new(
            config,
            Arc::new(IdleFactory),
            DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "01:02:03:04".to_string(),
            },
            Arc::new(FixedCredentials::new(
                "routesufrag00001",
                "routespasswordroutespassword0001",
            )),
        )
        .unwrap();
        router(Arc::new(ingest))
    }

    fn post_offer(body: String, content_type: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri("/whip")
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap()
    }

    fn delete_request(uri: &str) -> Request<Body> {
        Request::builder()
            .method(Method::DELETE)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_string(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_post_offer_returns_answer() {
        let app = app(10);

        let response = app
            .clone()
            .oneshot(post_offer(opus_offer(), "application/sdp"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/sdp"
        );
        let location = response.headers()[header::LOCATION]
            .to_str()
            .unwrap()
            .to_string();
        assert!(location.starts_with("/whip/"));
        assert_eq!(
            response.headers()[header::LINK],
            "<stun:stun.l.google.com:19302>; rel=\"ice-server\""
        );

        let answer = body_string(response).await;
        assert!(answer.starts_with("v=0\r\n"));
        assert!(answer.contains("a=fingerprint:sha-256 01:02:03:04\r\n"));
        assert!(answer.contains("a=rtpmap:111 opus/48000/2\r\n"));

        let response = app.clone().oneshot(delete_request(&location)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = app.oneshot(delete_request(&location)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_content_type_with_parameters_is_accepted() {
        let response = app(10)
            .oneshot(post_offer(opus_offer(), "application/sdp; charset=utf-8"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_wrong_content_type_is_bad_request() {
        let response = app(10)
            .oneshot(post_offer(opus_offer(), "application/json"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"], "invalid_offer");
    }

    #[tokio::test]
    async fn test_incompatible_codecs_are_unprocessable() {
        let response = app(10)
            .oneshot(post_offer(offer_with("video", "AV1/90000"), "application/sdp"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(body["error"], "no_compatible_codec");
    }

    #[tokio::test]
    async fn test_capacity_exceeded_is_retryable() {
        let app = app(1);

        let first = app
            .clone()
            .oneshot(post_offer(opus_offer(), "application/sdp"))
            .await
            .unwrap();
        assert_eq!(first.status(), StatusCode::CREATED);

        let second = app
            .oneshot(post_offer(opus_offer(), "application/sdp"))
            .await
            .unwrap();
        assert_eq!(second.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(second.headers()[header::RETRY_AFTER], RETRY_AFTER_SECS);
        let body: serde_json::Value = serde_json::from_str(&body_string(second).await).unwrap();
        assert_eq!(body["error"], "capacity_exceeded");
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let padding = "a=x-padding:0123456789\r\n".repeat(300);
        let response = app(10)
            .oneshot(post_offer(opus_offer() + &padding, "application/sdp"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_other_methods_are_not_allowed() {
        let request = Request::builder()
            .method(Method::GET)
            .uri("/whip")
            .body(Body::empty())
            .unwrap();
        let response = app(10).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_options_advertises_sdp_and_ice_servers() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/whip")
            .body(Body::empty())
            .unwrap();
        let response = app(10).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()[ACCEPT_POST], "application/sdp");
        assert!(response.headers().contains_key(header::LINK));
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/whip")
            .header(header::ORIGIN, "https://publisher.example.com")
            .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
            .body(Body::empty())
            .unwrap();
        let response = app(10).oneshot(request).await.unwrap();

        assert!(response.status().is_success());
        assert_eq!(
            response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
            "*"
        );
    }

    #[tokio::test]
    async fn test_health_and_session_listing() {
        let app = app(10);

        let request = Request::builder()
            .uri("/health")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_string(response).await, "ok");

        app.clone()
            .oneshot(post_offer(opus_offer(), "application/sdp"))
            .await
            .unwrap();

        let request = Request::builder()
            .uri("/sessions")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let sessions: serde_json::Value =
            serde_json::from_str(&body_string(response).await).unwrap();
        let sessions = sessions.as_array().unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0]["codecs"], serde_json::json!(["opus"]));
    }
}
