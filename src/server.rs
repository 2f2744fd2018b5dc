//! HTTP server shell
//!
//! Binding and serving split apart so tests can grab an ephemeral port and
//! drive the router without the full binary.

use std::net::SocketAddr;

use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Binds a listener on the given address.
///
/// # Errors
///
/// Returns the bind error unchanged.
pub async fn bind(addr: SocketAddr) -> Result<(TcpListener, SocketAddr), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    let actual = listener.local_addr()?;
    Ok((listener, actual))
}

/// Binds on any free localhost port (for tests).
///
/// # Errors
///
/// Returns the bind error unchanged.
pub async fn bind_ephemeral() -> Result<(TcpListener, SocketAddr), std::io::Error> {
    bind(SocketAddr::from(([127, 0, 0, 1], 0))).await
}

/// Serves the application until the listener fails.
///
/// # Errors
///
/// Returns the serve error as `std::io::Error`.
pub async fn serve(listener: TcpListener, router: Router) -> Result<(), std::io::Error> {
    axum::serve(listener, router)
        .await
        .map_err(std::io::Error::other)
}

/// Serves the application until the shutdown token fires.
///
/// # Errors
///
/// Returns the serve error as `std::io::Error`.
pub async fn serve_with_graceful_shutdown(
    listener: TcpListener,
    router: Router,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let signal = async move {
        shutdown.cancelled().await;
    };
    axum::serve(listener, router)
        .with_graceful_shutdown(signal)
        .await
        .map_err(std::io::Error::other)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ephemeral_bind_picks_a_port() {
        let (listener, addr) = bind_ephemeral().await.unwrap();
        assert_ne!(addr.port(), 0);
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        drop(listener);
    }

    #[tokio::test]
    async fn liveness_answers_over_a_real_socket() {
        let gateway = crate::gateway::Gateway::new(crate::config::GatewayConfig::default());
        let app = crate::rest_api::create_app(gateway.app_state());
        let (listener, addr) = bind_ephemeral().await.unwrap();
        let handle = tokio::spawn(serve(listener, app));

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        let response = reqwest::get(format!("http://{addr}/health")).await.unwrap();
        assert!(response.status().is_success());
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["status"], "alive");

        handle.abort();
    }

    #[tokio::test]
    async fn graceful_shutdown_stops_the_server() {
        let (listener, _addr) = bind_ephemeral().await.unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn(serve_with_graceful_shutdown(
            listener,
            Router::new(),
            token.clone(),
        ));
        token.cancel();
        handle.await.unwrap().unwrap();
    }
}
