// raw_client: frame-level WebSocket client for protocol tests.
//
// Speaks raw text frames with no engine behavior on top, so tests can
// drive exact protocol sequences (and wrong ones).

use futures_util::{SinkExt, StreamExt};
use sn_protocol::{ConnectionMessage, decode_frame, encode_frame};
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

pub struct RawFrameClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl RawFrameClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    pub async fn send_message(
        &mut self,
        msg: &ConnectionMessage,
    ) -> Result<(), Box<dyn std::error::Error>> {
        self.send_raw(&encode_frame(msg)).await
    }

    /// Send an arbitrary text frame, valid or not.
    pub async fn send_raw(&mut self, frame: &str) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Text(frame.to_owned().into())).await?;
        Ok(())
    }

    pub async fn recv_message(&mut self) -> Result<ConnectionMessage, Box<dyn std::error::Error>> {
        loop {
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => return Ok(decode_frame(&text)?),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by peer".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}
