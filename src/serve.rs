use crate::config::ServerConfig;
use std::future::Future;

/// Shared, read-only view of the running agent.
#[derive(Clone)]
pub struct AppState {
    agent_name: std::sync::Arc<str>,
    tools: std::sync::Arc<Vec<String>>,
}

impl AppState {
    pub fn new(agent_name: &str, tools: Vec<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            tools: std::sync::Arc::new(tools),
        }
    }
}

#[cfg(feature = "serve")]
pub fn router(state: AppState, request_tracing: bool) -> axum::Router {
    use axum::{routing::get, Router};
    use tower_http::cors::CorsLayer;
    use tower_http::trace::TraceLayer;

    let mut app = Router::new()
        .route("/liveness", get(liveness))
        .route("/readiness", get(readiness))
        .route("/api/tools", get(api_tools))
        .with_state(state)
        .layer(CorsLayer::permissive());
    if request_tracing {
        app = app.layer(TraceLayer::new_for_http());
    }
    app
}

/// Serve until `shutdown` resolves.
#[cfg(feature = "serve")]
pub async fn run(
    config: &ServerConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(state, config.enable_server_tracing);

    let addr = format!("{}:{}", config.bind, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;
    tracing::info!("hosted agent listening on {local_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    tracing::info!("hosted agent server stopped");
    Ok(())
}

#[cfg(not(feature = "serve"))]
pub async fn run(
    _config: &ServerConfig,
    _state: AppState,
    _shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), Box<dyn std::error::Error>> {
    Err("server mode requires the `serve` feature".into())
}

#[cfg(feature = "serve")]
async fn liveness() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"status": "alive"}))
}

#[cfg(feature = "serve")]
async fn readiness(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"status": "ready", "agent": &*state.agent_name}))
}

#[cfg(feature = "serve")]
async fn api_tools(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({"tools": &*state.tools}))
}

#[cfg(all(test, feature = "serve"))]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    async fn get_json(path: &str) -> (StatusCode, serde_json::Value) {
        let app = router(
            AppState::new("JokeAgent", vec!["search".to_string()]),
            false,
        );
        let response = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_liveness() {
        let (status, body) = get_json("/liveness").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "alive");
    }

    #[tokio::test]
    async fn test_readiness_names_agent() {
        let (status, body) = get_json("/readiness").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["agent"], "JokeAgent");
    }

    #[tokio::test]
    async fn test_tools_listing() {
        let (_, body) = get_json("/api/tools").await;
        assert_eq!(body["tools"], serde_json::json!(["search"]));
    }

    #[tokio::test]
    async fn test_unknown_route_404() {
        let (status, _) = get_json("/nope").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let config = ServerConfig {
            bind: "127.0.0.1".to_string(),
            port: 0,
            ..Default::default()
        };
        let state = AppState::new("JokeAgent", Vec::new());
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            run(&config, state, async {}),
        )
        .await
        .expect("server did not shut down");
        assert!(result.is_ok());
    }
}
