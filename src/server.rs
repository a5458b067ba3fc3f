use crate::auth::{create_auth_provider, AuthProvider};
use crate::config::Config;
use crate::duration::DurationParser;
use crate::manager::SourceManager;
use crate::notifications::Notifier;
use crate::types::{AuthRequest, CacheFilter, CacheResponse, InfoResponse};
use crate::version;
use axum::extract::{Query, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{Json, Response};
use axum::routing::{get, post};
use axum::Router;
use axum_extra::extract::cookie::CookieJar;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<SourceManager>,
    pub auth: Arc<dyn AuthProvider>,
}

pub struct DoomsdayServer {
    app_state: AppState,
    config: Config,
}

impl DoomsdayServer {
    pub fn new(config: Config) -> crate::Result<Self> {
        let manager = Arc::new(SourceManager::from_config(&config)?);
        let auth = create_auth_provider(&config.server.auth)?;

        Ok(DoomsdayServer {
            app_state: AppState { manager, auth },
            config,
        })
    }

    pub fn create_router(&self) -> Router {
        Router::new()
            .route("/v1/info", get(info_handler))
            .route("/v1/auth", post(auth_handler))
            .route("/v1/cache", get(cache_handler))
            .route("/v1/cache/refresh", post(refresh_handler))
            .route("/v1/scheduler", get(scheduler_handler))
            .layer(
                ServiceBuilder::new()
                    .layer(axum::middleware::from_fn(request_logging_middleware))
                    .layer(TraceLayer::new_for_http())
                    .layer(CorsLayer::permissive()),
            )
            .with_state(self.app_state.clone())
    }

    pub async fn serve(&self) -> crate::Result<()> {
        // The scheduler comes up first; a backend that cannot authenticate
        // is a configuration problem and the server refuses to start.
        self.app_state.manager.background_scheduler().await?;

        if let Some(notifications) = &self.config.notifications {
            Notifier::from_config(notifications, self.app_state.manager.clone())?.spawn();
            tracing::info!("Notifications enabled");
        }

        let addr = SocketAddr::from(([0, 0, 0, 0], self.config.server.port));
        let router = self.create_router();

        tracing::info!("🚀 Doomsday server listening on {}", addr);

        match &self.config.server.tls {
            Some(tls) => {
                let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem(
                    tls.cert.clone().into_bytes(),
                    tls.key.clone().into_bytes(),
                )
                .await
                .map_err(|e| {
                    crate::DoomsdayError::config(format!("Could not load server TLS keypair: {}", e))
                })?;

                axum_server::bind_rustls(addr, rustls_config)
                    .serve(router.into_make_service())
                    .await
                    .map_err(|e| crate::DoomsdayError::internal(format!("Server error: {}", e)))?;
            }
            None => {
                let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
                    crate::DoomsdayError::internal(format!("Failed to bind to {}: {}", addr, e))
                })?;

                axum::serve(listener, router)
                    .with_graceful_shutdown(shutdown_signal())
                    .await
                    .map_err(|e| crate::DoomsdayError::internal(format!("Server error: {}", e)))?;
            }
        }

        tracing::info!("Server shutdown complete");
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down");
        },
    }
}

async fn request_logging_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;
    let status = response.status();

    if status.is_server_error() {
        tracing::error!("{} {} -> {} in {:?}", method, uri, status, start.elapsed());
    } else {
        tracing::info!("{} {} -> {} in {:?}", method, uri, status, start.elapsed());
    }

    response
}

/// The session token comes from the X-Doomsday-Token header, or from the
/// doomsday-token cookie as a fallback for the dashboard.
fn extract_token(headers: &HeaderMap, cookies: &CookieJar) -> Option<String> {
    if let Some(header) = headers.get("X-Doomsday-Token") {
        if let Ok(token) = header.to_str() {
            return Some(token.to_string());
        }
    }

    cookies
        .get("doomsday-token")
        .map(|cookie| cookie.value().to_string())
}

async fn check_auth(
    state: &AppState,
    headers: &HeaderMap,
    cookies: &CookieJar,
) -> Result<(), StatusCode> {
    if !state.auth.requires_auth() {
        return Ok(());
    }

    let token = extract_token(headers, cookies).ok_or(StatusCode::UNAUTHORIZED)?;
    if !state.auth.validate_token(&token).await {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

async fn info_handler(State(state): State<AppState>) -> Json<InfoResponse> {
    Json(InfoResponse {
        version: version::version(),
        auth_type: state.auth.auth_type().to_string(),
    })
}

async fn auth_handler(
    State(state): State<AppState>,
    Json(request): Json<AuthRequest>,
) -> Result<Json<crate::types::AuthResponse>, StatusCode> {
    match state.auth.authenticate(&request).await {
        Ok(response) => Ok(Json(response)),
        Err(e) => {
            tracing::warn!("Authentication failed for user {}: {}", request.username, e);
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

#[derive(Deserialize)]
struct CacheQuery {
    beyond: Option<String>,
    within: Option<String>,
}

impl CacheQuery {
    fn to_filter(&self) -> crate::Result<CacheFilter> {
        let mut filter = CacheFilter::default();
        if let Some(beyond) = &self.beyond {
            filter.beyond = Some(DurationParser::parse(beyond)?);
        }
        if let Some(within) = &self.within {
            filter.within = Some(DurationParser::parse(within)?);
        }
        Ok(filter)
    }
}

async fn cache_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    cookies: CookieJar,
    Query(query): Query<CacheQuery>,
) -> Result<Json<CacheResponse>, StatusCode> {
    check_auth(&state, &headers, &cookies).await?;

    let filter = query.to_filter().map_err(|_| StatusCode::BAD_REQUEST)?;
    let content = filter.apply(state.manager.data().await);

    Ok(Json(CacheResponse { content }))
}

async fn refresh_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    cookies: CookieJar,
) -> Result<StatusCode, StatusCode> {
    check_auth(&state, &headers, &cookies).await?;

    state.manager.refresh_all().await;
    Ok(StatusCode::NO_CONTENT)
}

async fn scheduler_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    cookies: CookieJar,
) -> Result<Json<crate::types::SchedulerResponse>, StatusCode> {
    check_auth(&state, &headers, &cookies).await?;

    Ok(Json(state.manager.scheduler_state().await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::NopAuthProvider;
    use crate::source::tests::{self_signed_pem, MockAccessor};
    use crate::source::Source;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn router_with(manager: SourceManager, auth: Arc<dyn AuthProvider>) -> Router {
        let state = AppState {
            manager: Arc::new(manager),
            auth,
        };
        Router::new()
            .route("/v1/info", get(info_handler))
            .route("/v1/auth", post(auth_handler))
            .route("/v1/cache", get(cache_handler))
            .route("/v1/cache/refresh", post(refresh_handler))
            .route("/v1/scheduler", get(scheduler_handler))
            .with_state(state)
    }

    fn empty_manager() -> SourceManager {
        SourceManager::new(vec![], 1)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_info_reports_auth_type() {
        let router = router_with(empty_manager(), Arc::new(NopAuthProvider));
        let response = router
            .oneshot(
                HttpRequest::get("/v1/info")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["auth_type"], "none");
    }

    #[tokio::test]
    async fn test_cache_serves_content_wrapper() {
        let pem = self_signed_pem("served");
        let source = Arc::new(Source::new(
            Arc::new(MockAccessor::new("v").with_secret("a", "pem", &pem)),
            chrono::Duration::minutes(30),
        ));
        let manager = SourceManager::new(vec![source], 1);
        manager.background_scheduler().await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;

        let router = router_with(manager, Arc::new(NopAuthProvider));
        let response = router
            .oneshot(
                HttpRequest::get("/v1/cache")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["content"][0]["common_name"], "served");
        assert_eq!(body["content"][0]["paths"][0]["backend"], "v");
        assert_eq!(body["content"][0]["paths"][0]["location"], "a:pem");
    }

    #[tokio::test]
    async fn test_cache_requires_token_under_userpass() {
        let auth = crate::auth::create_auth_provider(&crate::config::AuthConfig {
            auth_type: "userpass".to_string(),
            properties: serde_yaml::from_str("users:\n  admin: secret\n").unwrap(),
        })
        .unwrap();
        let router = router_with(empty_manager(), auth);

        let response = router
            .clone()
            .oneshot(
                HttpRequest::get("/v1/cache")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // Log in, then retry with the token in the header.
        let response = router
            .clone()
            .oneshot(
                HttpRequest::post("/v1/auth")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({"username": "admin", "password": "secret"}).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let token = body_json(response).await["token"]
            .as_str()
            .unwrap()
            .to_string();

        let response = router
            .oneshot(
                HttpRequest::get("/v1/cache")
                    .header("X-Doomsday-Token", token)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_refresh_returns_no_content() {
        let router = router_with(empty_manager(), Arc::new(NopAuthProvider));
        let response = router
            .oneshot(
                HttpRequest::post("/v1/cache/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_cache_rejects_bad_filter() {
        let router = router_with(empty_manager(), Arc::new(NopAuthProvider));
        let response = router
            .oneshot(
                HttpRequest::get("/v1/cache?within=3parsecs")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_scheduler_snapshot_shape() {
        let router = router_with(empty_manager(), Arc::new(NopAuthProvider));
        let response = router
            .oneshot(
                HttpRequest::get("/v1/scheduler")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["running"].is_array());
        assert!(body["pending"].is_array());
        assert!(body["workers"].is_array());
    }
}
