//! HTTP adapters for the remote board: snapshot download, paint, and
//! credential validation.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use async_trait::async_trait;
use paintboard_core::model::{token_tail, BoardState, Color, PaintOutcome, PaintTarget, Pos, Validation};
use paintboard_core::ports::{CanvasSource, PaintApi, UpdateFeed};
use rand::Rng;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use crate::config::RemoteConfig;
use crate::feed;

/// Color painted by validation requests.
const VALIDATION_COLOR: Color = 2;

/// One HTTP client per egress route.
#[derive(Clone)]
pub struct Routes {
    clients: Arc<[Client]>,
}

impl Routes {
    pub fn new(egress: &[IpAddr], timeout: Duration) -> anyhow::Result<Self> {
        let build = |addr: Option<IpAddr>| {
            Client::builder()
                .timeout(timeout)
                .local_address(addr)
                .build()
                .context("building http client")
        };
        let clients: Vec<Client> = if egress.is_empty() {
            vec![build(None)?]
        } else {
            egress
                .iter()
                .map(|addr| build(Some(*addr)))
                .collect::<anyhow::Result<_>>()?
        };
        Ok(Self {
            clients: clients.into(),
        })
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    fn get(&self, route: usize) -> &Client {
        &self.clients[route % self.clients.len()]
    }
}

/// Snapshot endpoint plus the WebSocket feed.
pub struct RemoteCanvas {
    routes: Routes,
    board_url: String,
    websocket_url: String,
}

impl RemoteCanvas {
    pub fn new(routes: Routes, config: &RemoteConfig) -> Self {
        Self {
            routes,
            board_url: config.board_url.clone(),
            websocket_url: config.websocket_url.clone(),
        }
    }
}

#[async_trait]
impl CanvasSource for RemoteCanvas {
    async fn fetch_snapshot(&self) -> anyhow::Result<BoardState> {
        debug!(url = %self.board_url, "loading board");
        let text = self
            .routes
            .get(0)
            .get(&self.board_url)
            .send()
            .await
            .context("board request")?
            .error_for_status()
            .context("board status")?
            .text()
            .await
            .context("board body")?;
        let state = decode_snapshot(&text)?;
        debug!(width = state.width, height = state.height, "board loaded");
        Ok(state)
    }

    async fn open_feed(&self) -> anyhow::Result<UpdateFeed> {
        feed::connect(&self.websocket_url).await
    }
}

/// Parses the board payload: one line per column, one base-36 digit per cell.
pub fn decode_snapshot(text: &str) -> anyhow::Result<BoardState> {
    let body = text.strip_suffix('\n').unwrap_or(text);
    if body.is_empty() {
        bail!("empty board payload");
    }
    let columns: Vec<&[u8]> = body.split('\n').map(str::as_bytes).collect();
    let width = columns.len();
    let height = columns[0].len();
    if height == 0 {
        bail!("board payload has an empty first column");
    }

    let mut data = Vec::with_capacity(width * height);
    for (x, column) in columns.iter().enumerate() {
        if column.len() != height {
            bail!("column {x} has {} cells, expected {height}", column.len());
        }
        for (y, &byte) in column.iter().enumerate() {
            let color = (byte as char)
                .to_digit(36)
                .with_context(|| format!("invalid cell {:?} at ({x},{y})", byte as char))?;
            data.push(color as Color);
        }
    }
    Ok(BoardState {
        width,
        height,
        data,
    })
}

#[derive(Debug, Deserialize)]
struct PaintResponse {
    status: i64,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug)]
struct PaintReply {
    outcome: PaintOutcome,
    code: i64,
    message: String,
}

/// Maps the HTTP status and, for OK responses, the decoded body status.
pub fn classify(http_status: u16, body_status: Option<i64>) -> PaintOutcome {
    if !(200..300).contains(&http_status) {
        return PaintOutcome::from_status(http_status as i64);
    }
    match body_status {
        Some(status) => PaintOutcome::from_status(status),
        None => PaintOutcome::NetworkError,
    }
}

/// Paint endpoint. Validation is a paint of a random cell.
pub struct RemotePaint {
    routes: Routes,
    paint_url: String,
    width: usize,
    height: usize,
}

impl RemotePaint {
    pub fn new(routes: Routes, config: &RemoteConfig, width: usize, height: usize) -> Self {
        Self {
            routes,
            paint_url: config.paint_url.clone(),
            width,
            height,
        }
    }

    async fn send(&self, token: &str, target: PaintTarget, route: usize) -> PaintReply {
        let form = [
            ("x", target.pos.x.to_string()),
            ("y", target.pos.y.to_string()),
            ("color", target.color.to_string()),
            ("token", token.to_string()),
        ];
        let response = match self
            .routes
            .get(route)
            .post(&self.paint_url)
            .header(reqwest::header::CACHE_CONTROL, "no-cache")
            .form(&form)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                return PaintReply {
                    outcome: PaintOutcome::NetworkError,
                    code: -1,
                    message: err.to_string(),
                }
            }
        };

        let http = response.status();
        if !http.is_success() {
            return PaintReply {
                outcome: classify(http.as_u16(), None),
                code: http.as_u16() as i64,
                message: http.canonical_reason().unwrap_or_default().to_string(),
            };
        }
        match response.json::<PaintResponse>().await {
            Ok(body) => PaintReply {
                outcome: classify(http.as_u16(), Some(body.status)),
                code: body.status,
                message: body.message.unwrap_or_default(),
            },
            Err(err) => PaintReply {
                outcome: PaintOutcome::NetworkError,
                code: -1,
                message: err.to_string(),
            },
        }
    }
}

#[async_trait]
impl PaintApi for RemotePaint {
    async fn paint(&self, token: &str, target: PaintTarget, route: usize) -> PaintOutcome {
        let reply = self.send(token, target, route).await;
        debug!(
            token = token_tail(token),
            route,
            outcome = ?reply.outcome,
            code = reply.code,
            message = %reply.message,
            "paint response"
        );
        reply.outcome
    }

    async fn validate(&self, token: &str, route: usize) -> anyhow::Result<Validation> {
        let pos = {
            let mut rng = rand::rng();
            Pos::new(
                rng.random_range(0..self.width) as u16,
                rng.random_range(0..self.height) as u16,
            )
        };
        let target = PaintTarget {
            pos,
            color: VALIDATION_COLOR,
        };
        let reply = self.send(token, target, route).await;
        debug!(token = token_tail(token), outcome = ?reply.outcome, "validation response");
        match reply.outcome {
            PaintOutcome::Success | PaintOutcome::Cooldowning => Ok(Validation::Valid),
            PaintOutcome::InvalidToken => Ok(Validation::Invalid {
                reason: if reply.message.is_empty() {
                    "token rejected".to_string()
                } else {
                    reply.message
                },
            }),
            other => bail!("validation inconclusive ({other:?} {}): {}", reply.code, reply.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_lines_are_columns() {
        let state = decode_snapshot("01a\nv23\n").unwrap();
        assert_eq!((state.width, state.height), (2, 3));
        assert_eq!(state.data, vec![0, 1, 10, 31, 2, 3]);
    }

    #[test]
    fn trailing_newline_is_optional() {
        let with = decode_snapshot("12\n34\n").unwrap();
        let without = decode_snapshot("12\n34").unwrap();
        assert_eq!(with, without);
    }

    #[test]
    fn ragged_or_garbled_snapshots_are_rejected() {
        assert!(decode_snapshot("").is_err());
        assert!(decode_snapshot("\n").is_err());
        assert!(decode_snapshot("012\n01\n").is_err());
        assert!(decode_snapshot("0!2\n012\n").is_err());
    }

    #[test]
    fn classification_prefers_body_status_on_ok() {
        assert_eq!(classify(200, Some(200)), PaintOutcome::Success);
        assert_eq!(classify(200, Some(500)), PaintOutcome::Cooldowning);
        assert_eq!(classify(200, Some(401)), PaintOutcome::InvalidToken);
        assert_eq!(classify(200, None), PaintOutcome::NetworkError);
        assert_eq!(classify(503, Some(200)), PaintOutcome::RateLimited);
        assert_eq!(classify(502, None), PaintOutcome::ServerError);
        assert_eq!(classify(418, None), PaintOutcome::BadRequest);
    }

    #[test]
    fn routes_fall_back_to_one_client() {
        let routes = Routes::new(&[], Duration::from_secs(1)).unwrap();
        assert_eq!(routes.len(), 1);
        let _ = routes.get(5);
    }
}
