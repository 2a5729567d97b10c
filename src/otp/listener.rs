//! Loopback HTTP listener for one-time passwords.
//!
//! Routes:
//! - `GET /ffxivlauncher/{otp}`: code in the path, as sent by authenticator apps
//! - `POST /otp`: JSON body `{"otp": "123456"}`
//! - `GET /health`

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use super::{OtpError, normalize_otp};

/// Receives validated codes.
pub trait OtpSink: Send + Sync + 'static {
    /// Delivers one code.
    fn submit(&self, code: &str) -> Result<(), String>;
}

impl<F> OtpSink for F
where
    F: Fn(&str) -> Result<(), String> + Send + Sync + 'static,
{
    fn submit(&self, code: &str) -> Result<(), String> {
        self(code)
    }
}

#[derive(Clone)]
struct ListenerState {
    sink: Arc<dyn OtpSink>,
    delivered: Arc<AtomicUsize>,
}

#[derive(Debug, Deserialize)]
struct OtpBody {
    otp: String,
}

/// HTTP listener bound to 127.0.0.1.
pub struct OtpListener {
    shutdown_tx: Option<oneshot::Sender<()>>,
    port: u16,
    delivered: Arc<AtomicUsize>,
}

impl OtpListener {
    /// Binds `port` (0 picks a free one) and starts serving.
    pub async fn start(port: u16, sink: Arc<dyn OtpSink>) -> Result<Self, OtpError> {
        let delivered = Arc::new(AtomicUsize::new(0));
        let state = ListenerState {
            sink,
            delivered: Arc::clone(&delivered),
        };

        let app = Router::new()
            .route("/ffxivlauncher/{otp}", get(handle_path_otp))
            .route("/otp", post(handle_json_otp))
            .route("/health", get(handle_health))
            .with_state(state);

        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| OtpError::Bind { port, source })?;
        let port = listener
            .local_addr()
            .map_err(|source| OtpError::Bind { port, source })?
            .port();

        info!("[OTP] Listening on http://127.0.0.1:{}", port);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        tokio::spawn(async move {
            let server = axum::serve(listener, app);

            tokio::select! {
                result = server => {
                    if let Err(e) = result {
                        error!("[OTP] Listener error: {}", e);
                    }
                }
                _ = shutdown_rx => {
                    info!("[OTP] Listener shutting down");
                }
            }
        });

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            port,
            delivered,
        })
    }

    /// Returns the bound port.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Returns how many codes were delivered to the sink.
    #[must_use]
    pub fn delivered(&self) -> usize {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Stops the listener.
    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for OtpListener {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn deliver(state: &ListenerState, raw: &str) -> (StatusCode, &'static str) {
    let code = match normalize_otp(raw) {
        Ok(code) => code,
        Err(e) => {
            warn!("[OTP] Rejected request: {}", e);
            return (StatusCode::BAD_REQUEST, "Invalid OTP");
        }
    };

    let sink = Arc::clone(&state.sink);
    let result = tokio::task::spawn_blocking(move || sink.submit(&code)).await;

    match result {
        Ok(Ok(())) => {
            state.delivered.fetch_add(1, Ordering::SeqCst);
            info!("[OTP] Code delivered");
            (StatusCode::OK, "OTP received")
        }
        Ok(Err(e)) => {
            error!("[OTP] Could not deliver code: {}", e);
            (StatusCode::BAD_GATEWAY, "Launcher unavailable")
        }
        Err(e) => {
            error!("[OTP] Delivery task failed: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

/// Handler for GET /ffxivlauncher/{otp}
async fn handle_path_otp(
    State(state): State<ListenerState>,
    Path(otp): Path<String>,
) -> (StatusCode, &'static str) {
    deliver(&state, &otp).await
}

/// Handler for POST /otp
async fn handle_json_otp(
    State(state): State<ListenerState>,
    Json(body): Json<OtpBody>,
) -> (StatusCode, &'static str) {
    deliver(&state, &body.otp).await
}

/// Handler for GET /health
async fn handle_health() -> &'static str {
    "OK"
}
