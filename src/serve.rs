//! Static file server for browsing a run directory.
//!
//! The socket is bound on the caller's thread so a bad address fails fast;
//! serving happens on a dedicated thread with its own current-thread tokio
//! runtime. Dropping the handle leaves the server running.

use std::net::{SocketAddr, TcpListener};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use axum::routing::get;
use axum::Router;
use thiserror::Error;
use tokio::sync::oneshot;
use tower_http::services::ServeDir;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("Directory does not exist: {0}")]
    MissingDir(PathBuf),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Address actually bound (useful with port 0).
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Stop accepting connections and wait for the server thread.
    pub fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.join();
    }

    /// Block until the server stops on its own.
    pub fn wait(mut self) {
        self.join();
    }

    fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("Static server thread panicked");
            }
        }
    }
}

pub fn router(dir: &Path) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .fallback_service(ServeDir::new(dir))
}

/// Serve `dir` at `addr` in the background.
pub fn spawn_static_server(dir: &Path, addr: &str) -> Result<ServerHandle, ServeError> {
    if !dir.is_dir() {
        return Err(ServeError::MissingDir(dir.to_path_buf()));
    }

    let listener = TcpListener::bind(addr).map_err(|source| ServeError::Bind {
        addr: addr.to_string(),
        source,
    })?;
    listener.set_nonblocking(true)?;
    let bound = listener.local_addr()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;

    let app = router(dir);
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

    let thread = std::thread::Builder::new()
        .name("runwright-serve".into())
        .spawn(move || {
            runtime.block_on(async move {
                let listener = match tokio::net::TcpListener::from_std(listener) {
                    Ok(listener) => listener,
                    Err(e) => {
                        tracing::error!(error = %e, "Static server could not adopt listener");
                        return;
                    }
                };
                // A dropped sender means the handle went away, not a stop request.
                let shutdown_signal = async move {
                    match shutdown_rx.await {
                        Ok(()) => tracing::info!("Static server shutting down"),
                        Err(_) => std::future::pending::<()>().await,
                    }
                };
                if let Err(e) = axum::serve(listener, app)
                    .with_graceful_shutdown(shutdown_signal)
                    .await
                {
                    tracing::error!(error = %e, "Static server error");
                }
            });
        })?;

    tracing::info!(addr = %bound, dir = %dir.display(), "Static server started");

    Ok(ServerHandle {
        addr: bound,
        shutdown_tx: Some(shutdown_tx),
        thread: Some(thread),
    })
}
