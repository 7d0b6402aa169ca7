use crate::coordinator::LifecycleCoordinator;
use crate::error::Error;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::AUTHORIZATION;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the daemon
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Deploy request body
#[derive(Debug, Deserialize)]
struct DeployRequest {
    backend_host: String,
    backend_port: u16,
}

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// JSON error response carrying the typed error code in X-Portgate-Error
fn error_response(err: &Error) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "code": err.code(),
        "message": err.to_string(),
        "retryable": err.is_retryable(),
    });
    Response::builder()
        .status(err.status_code())
        .header("content-type", "application/json")
        .header("X-Portgate-Error", err.code())
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("valid response with StatusCode enum and static headers")
}

/// Admin API server for the app lifecycle manager
pub struct AdminServer {
    bind_addr: SocketAddr,
    coordinator: Arc<LifecycleCoordinator>,
    shutdown_rx: watch::Receiver<bool>,
    auth_token: Arc<String>,
}

impl AdminServer {
    pub fn new(
        bind_addr: SocketAddr,
        coordinator: Arc<LifecycleCoordinator>,
        shutdown_rx: watch::Receiver<bool>,
        auth_token: String,
    ) -> Self {
        Self {
            bind_addr,
            coordinator,
            shutdown_rx,
            auth_token: Arc::new(auth_token),
        }
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Admin API server listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let auth_token = Arc::clone(&self.auth_token);

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let coordinator = Arc::clone(&self.coordinator);
                            let auth_token = Arc::clone(&auth_token);

                            tokio::spawn(async move {
                                if let Err(e) = serve_admin_connection(stream, addr, coordinator, auth_token).await {
                                    debug!(addr = %addr, error = %e, "Admin connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept admin connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Admin server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_admin_connection(
    stream: TcpStream,
    _addr: SocketAddr,
    coordinator: Arc<LifecycleCoordinator>,
    auth_token: Arc<String>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let coordinator = Arc::clone(&coordinator);
        let token = Arc::clone(&auth_token);
        async move { handle_admin_request(req, coordinator, token).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Admin connection error: {}", e))?;

    Ok(())
}

fn check_auth(req: &Request<hyper::body::Incoming>, expected_token: &str) -> bool {
    req.headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|auth| {
            // Support "Bearer <token>" format
            auth.strip_prefix("Bearer ")
                .unwrap_or(auth)
                .eq(expected_token)
        })
        .unwrap_or(false)
}

async fn handle_admin_request(
    req: Request<hyper::body::Incoming>,
    coordinator: Arc<LifecycleCoordinator>,
    auth_token: Arc<String>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    debug!(%method, %path, "Admin API request");

    let response = match (&method, path.as_str()) {
        // Health check for the admin API itself (no auth required)
        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        // Version endpoint: GET /version (no auth required)
        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        // Allocator occupancy: GET /stats (auth required)
        (&Method::GET, "/stats") => {
            if !check_auth(&req, &auth_token) {
                warn!(path = %path, "Unauthorized admin API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let stats = coordinator.stats();
                json_response(
                    StatusCode::OK,
                    serde_json::to_string(&stats).unwrap_or_else(|_| "{}".to_string()),
                )
            }
        }

        // List live routes: GET /apps (auth required)
        (&Method::GET, "/apps") => {
            if !check_auth(&req, &auth_token) {
                warn!(path = %path, "Unauthorized admin API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let routes = coordinator.routes().await;
                let count = routes.len();
                let body = serde_json::json!({
                    "apps": routes,
                    "count": count,
                });
                json_response(StatusCode::OK, body.to_string())
            }
        }

        // Deploy an app: POST /apps/{app} (auth required)
        (&Method::POST, p) if p.starts_with("/apps/") => {
            if !check_auth(&req, &auth_token) {
                warn!(path = %path, "Unauthorized admin API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let app_id = p.strip_prefix("/apps/").unwrap_or("").to_string();
                if app_id.is_empty() {
                    response(StatusCode::BAD_REQUEST, "missing app id")
                } else {
                    let body = req.collect().await?.to_bytes();
                    match serde_json::from_slice::<DeployRequest>(&body) {
                        Ok(deploy) => {
                            match coordinator
                                .deploy(&app_id, &deploy.backend_host, deploy.backend_port)
                                .await
                            {
                                Ok((public_port, canvas_port)) => {
                                    let body = serde_json::json!({
                                        "app_id": app_id,
                                        "public_port": public_port,
                                        "canvas_port": canvas_port,
                                    });
                                    json_response(StatusCode::CREATED, body.to_string())
                                }
                                Err(e) => error_response(&e),
                            }
                        }
                        Err(e) => response(
                            StatusCode::BAD_REQUEST,
                            format!("invalid deploy request: {}", e),
                        ),
                    }
                }
            }
        }

        // Tear an app down: DELETE /apps/{app} (auth required)
        (&Method::DELETE, p) if p.starts_with("/apps/") => {
            if !check_auth(&req, &auth_token) {
                warn!(path = %path, "Unauthorized admin API request");
                response(StatusCode::UNAUTHORIZED, "unauthorized")
            } else {
                let app_id = p.strip_prefix("/apps/").unwrap_or("");
                if app_id.is_empty() {
                    response(StatusCode::BAD_REQUEST, "missing app id")
                } else {
                    match coordinator.teardown(app_id).await {
                        Ok(()) => response(StatusCode::NO_CONTENT, ""),
                        Err(e) => error_response(&e),
                    }
                }
            }
        }

        // 404 for everything else
        _ => response(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_response_carries_code_header() {
        let err = Error::PortRangeExhausted {
            range: "public".to_string(),
        };
        let resp = error_response(&err);

        assert_eq!(resp.status(), StatusCode::CONFLICT);
        assert_eq!(
            resp.headers().get("X-Portgate-Error").unwrap(),
            "PORT_RANGE_EXHAUSTED"
        );
    }

    #[test]
    fn test_deploy_request_parses() {
        let req: DeployRequest =
            serde_json::from_str(r#"{"backend_host":"10.0.0.5","backend_port":80}"#).unwrap();
        assert_eq!(req.backend_host, "10.0.0.5");
        assert_eq!(req.backend_port, 80);
    }
}
