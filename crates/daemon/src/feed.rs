//! Live update feed over the paintboard WebSocket channel.

use anyhow::{bail, Context};
use futures_util::{SinkExt, StreamExt};
use paintboard_core::model::PaintboardUpdate;
use paintboard_core::now_ms;
use paintboard_core::ports::UpdateFeed;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, trace, warn};

const FEED_CAPACITY: usize = 16_384;

#[derive(Debug, Serialize)]
struct JoinChannel<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    channel: &'a str,
    channel_param: &'a str,
}

#[derive(Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireMessage {
    Result {
        result: String,
    },
    PaintboardUpdate {
        x: i64,
        y: i64,
        color: i64,
    },
    #[serde(other)]
    Other,
}

fn parse(text: &str) -> Option<WireMessage> {
    match serde_json::from_str(text) {
        Ok(message) => Some(message),
        Err(err) => {
            warn!(error = %err, "undecodable feed message");
            None
        }
    }
}

/// Connects, joins the paintboard channel, and pumps updates into the
/// returned receiver until either side goes away.
pub async fn connect(url: &str) -> anyhow::Result<UpdateFeed> {
    debug!(url, "connecting feed");
    let (socket, _) = tokio_tungstenite::connect_async(url)
        .await
        .context("websocket connect")?;
    let (mut sink, mut stream) = socket.split();

    let join = serde_json::to_string(&JoinChannel {
        kind: "join_channel",
        channel: "paintboard",
        channel_param: "",
    })?;
    sink.send(Message::Text(join.into()))
        .await
        .context("sending join")?;

    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match parse(text.as_str()) {
                Some(WireMessage::Result { result }) if result == "success" => break,
                Some(WireMessage::Result { result }) => bail!("join rejected: {result}"),
                _ => bail!("unexpected reply to join: {}", text.as_str()),
            },
            Some(Ok(Message::Close(_))) | None => bail!("websocket closed before joining"),
            Some(Ok(_)) => continue,
            Some(Err(err)) => return Err(err).context("reading join reply"),
        }
    }
    info!(url, "feed joined");

    let (tx, rx) = mpsc::channel(FEED_CAPACITY);
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = tx.closed() => break,
                message = stream.next() => message,
            };
            let time = now_ms();
            match message {
                Some(Ok(Message::Text(text))) => {
                    if let Some(WireMessage::PaintboardUpdate { x, y, color }) = parse(text.as_str()) {
                        trace!(x, y, color, "feed update");
                        if tx.send(PaintboardUpdate { x, y, color, time }).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "feed closed by peer");
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    warn!(error = %err, "feed read failed");
                    break;
                }
                None => break,
            }
        }
        let _ = sink.close().await;
        info!("feed disconnected");
    });
    Ok(rx)
}
