//! Minimal operator status endpoint
//!
//! Every accepted TCP connection receives one JSON status document followed
//! by a newline, then the connection is closed.

use std::net::{Ipv4Addr, SocketAddr};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{LocalApi, StatusProvider};
use crate::error::{GridError, GridResult};

/// Default [`LocalApi`]: a one-shot JSON status listener on `api_port`
#[derive(Debug)]
pub struct StatusApi {
    port: u16,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: Mutex<Option<CancellationToken>>,
}

impl StatusApi {
    /// Listener on all interfaces at `port`; `0` picks an ephemeral port
    pub fn new(port: u16) -> Self {
        Self {
            port,
            local_addr: Mutex::new(None),
            shutdown: Mutex::new(None),
        }
    }

    /// Bound address, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }
}

#[async_trait]
impl LocalApi for StatusApi {
    async fn start(&self, status: StatusProvider) -> GridResult<()> {
        if self.shutdown.lock().is_some() {
            return Err(GridError::InvalidOperation("status API already running".to_string()));
        }

        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port))
            .await
            .map_err(|e| GridError::Transport(format!("Failed to bind API port {}: {}", self.port, e)))?;
        let addr = listener.local_addr()?;
        info!(%addr, "Status API listening");

        let cancel = CancellationToken::new();
        *self.local_addr.lock() = Some(addr);
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            loop {
                let (mut stream, peer) = tokio::select! {
                    _ = cancel.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            warn!(error = %e, "Status API accept failed");
                            continue;
                        }
                    },
                };

                let mut body = match serde_json::to_vec(&status()) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "Failed to render status");
                        continue;
                    }
                };
                body.push(b'\n');

                tokio::spawn(async move {
                    if let Err(e) = stream.write_all(&body).await {
                        debug!(%peer, error = %e, "Status client went away");
                    }
                    let _ = stream.shutdown().await;
                });
            }
            debug!("Status API stopped");
        });
        Ok(())
    }

    async fn close(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
        *self.local_addr.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    #[tokio::test]
    async fn test_serves_one_document_per_connection() {
        let api = StatusApi::new(0);
        api.start(Arc::new(|| json!({"ready": true}))).await.unwrap();
        let port = api.local_addr().unwrap().port();

        for _ in 0..2 {
            let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
            let mut body = String::new();
            stream.read_to_string(&mut body).await.unwrap();
            let doc: serde_json::Value = serde_json::from_str(body.trim()).unwrap();
            assert_eq!(doc["ready"], true);
        }

        api.close().await;
        assert!(api.local_addr().is_none());
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let api = StatusApi::new(0);
        api.start(Arc::new(|| json!({}))).await.unwrap();
        assert!(api.start(Arc::new(|| json!({}))).await.is_err());
        api.close().await;
    }
}
