//! WebSocket transport.
//!
//! One duplex text-frame channel per connection incarnation; no message
//! semantics. The connection task owns the stream exclusively, so there is
//! exactly one sender and one close observation per open.

use crate::error::ClientError;
use std::time::Duration;
use tokio_tungstenite::connect_async;

pub type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

/// Turn the configured host into a connection URL.
///
/// Full `ws://` / `wss://` URLs pass through untouched; a bare
/// `host[:port]` becomes `ws://host[:port]/`.
pub fn build_url(host: &str) -> String {
    if host.starts_with("ws://") || host.starts_with("wss://") {
        host.to_owned()
    } else {
        format!("ws://{host}/")
    }
}

/// Open one transport incarnation.
///
/// Fails with `ConnectFailed` when the endpoint refuses, is unreachable, or
/// does not complete the WebSocket upgrade within `timeout`.
pub async fn connect(url: &str, timeout: Duration) -> Result<WsStream, ClientError> {
    match tokio::time::timeout(timeout, connect_async(url)).await {
        Ok(Ok((ws, _response))) => Ok(ws),
        Ok(Err(e)) => Err(ClientError::ConnectFailed(format!("{url}: {e}"))),
        Err(_) => Err(ClientError::ConnectFailed(format!(
            "{url}: no connection within {timeout:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_wraps_bare_hosts_and_keeps_urls() {
        assert_eq!(build_url("shore.example.com"), "ws://shore.example.com/");
        assert_eq!(build_url("10.0.0.5:43690"), "ws://10.0.0.5:43690/");
        assert_eq!(build_url("ws://host:1/custom"), "ws://host:1/custom");
        assert_eq!(build_url("wss://host/"), "wss://host/");
    }

    #[tokio::test]
    async fn connect_to_refused_port_is_connect_failed() {
        // Port 1 on localhost is essentially never listening.
        let err = connect("ws://127.0.0.1:1/", Duration::from_secs(2)).await.unwrap_err();
        assert!(matches!(err, ClientError::ConnectFailed(_)));
    }
}
