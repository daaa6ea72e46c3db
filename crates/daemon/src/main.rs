// paguridaed: HTTP/WebSocket front door for collaborative editor sessions.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use paguridae_daemon::config::Config;
use paguridae_daemon::connection;
use paguridae_daemon::protocol::{InitRequest, InitResponse};
use paguridae_daemon::session::{SessionManager, SOCKET_DIR};

#[derive(Clone)]
struct AppState {
    manager: Arc<SessionManager>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = Arc::new(Config::parse());
    let manager = SessionManager::new(config.clone());

    // Shutdown controller: stop every session, then remove the socket
    // directory.
    let shutdown_manager = manager.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        let mut terminate = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(signal) => signal,
            Err(error) => {
                warn!(%error, "cannot install SIGTERM handler");
                let _ = ctrl_c.await;
                shutdown(&shutdown_manager).await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
        shutdown(&shutdown_manager).await;
    });

    let address = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind http server at {address}"))?;
    info!(port = config.port, "starting http server");

    let router = Router::new()
        .route("/ws", get(websocket_route))
        .with_state(AppState { manager });
    axum::serve(listener, router)
        .await
        .context("http server failed")
}

async fn shutdown(manager: &Arc<SessionManager>) {
    manager.stop_all().await;
    let _ = std::fs::remove_dir_all(SOCKET_DIR);
    std::process::exit(0);
}

async fn websocket_route(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        if let Err(error) = serve_socket(socket, state.manager).await {
            warn!(%error, "error serving connection");
        }
    })
}

/// Handshake: the client may supply session/client UUIDs to reclaim; the
/// reply announces the authoritative pair. Then the connection adapter
/// takes over.
async fn serve_socket(mut socket: WebSocket, manager: Arc<SessionManager>) -> Result<()> {
    let init = match socket.recv().await {
        Some(Ok(Message::Text(payload))) => {
            serde_json::from_str::<InitRequest>(payload.as_str()).unwrap_or_default()
        }
        _ => InitRequest::default(),
    };

    let session = manager.find_or_create_session(init.session_id).await?;
    let (client_id, events, flush) = session.connect(init.client_id).await?;

    let response = InitResponse {
        session_id: session.id(),
        client_id,
    };
    let encoded = serde_json::to_string(&response).context("failed to serialize handshake")?;
    if socket.send(Message::Text(encoded.into())).await.is_err() {
        session.disconnect(client_id).await;
        return Ok(());
    }

    let result = connection::serve(socket, session.clone(), client_id, events, flush).await;
    session.disconnect(client_id).await;
    result
}
