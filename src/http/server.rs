//! HTTP server implementation.

use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::error::{Result, TollgateError};

/// HTTP server hosting a governed router.
pub struct HttpServer {
    /// Bound listener
    listener: TcpListener,
    /// Routes, already wrapped in the rate limiting middleware
    router: Router,
}

impl HttpServer {
    /// Bind the listener. Use port 0 to let the OS pick one.
    pub async fn bind(addr: SocketAddr, router: Router) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TollgateError::Server(format!("Failed to bind {}: {}", addr, e)))?;
        Ok(Self { listener, router })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    ///
    /// Peer addresses are attached to every request so the middleware can key
    /// quotas by client.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            self.listener,
            self.router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TollgateError::Io(e)
        })
    }
}
