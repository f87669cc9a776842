use super::connection::serve_connection;
use crate::storage::store::Store;

use std::sync::Arc;
use tokio::net::TcpListener;

/// Accepts client connections forever, one task per connection.
pub async fn serve(listener: TcpListener, store: Arc<Store>, secret: Arc<str>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                tracing::warn!("Failed to accept connection: {}", e);
                continue;
            }
        };

        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
        }

        let store = store.clone();
        let secret = secret.clone();
        tokio::spawn(async move {
            serve_connection(stream, store, secret, peer.to_string()).await;
        });
    }
}
