//! Tunnel sessions for the relay
//!
//! One WebSocket carries many requests. Each request frame is executed on
//! its own task and answered with a frame carrying the same id, so a slow
//! origin never holds up the others.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tunnelgate_shared::protocol::{TunnelRequest, TunnelResponse};

use crate::upstream;

/// Drive one tunnel until the client goes away.
pub async fn handle_socket(socket: WebSocket, client: reqwest::Client) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(100);
    let mut served: u64 = 0;

    info!("Tunnel opened");

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        match serde_json::from_slice::<TunnelRequest>(&data) {
                            Ok(req) => {
                                served += 1;
                                spawn_request(client.clone(), req, tx.clone());
                            }
                            Err(e) => warn!("Malformed request frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Ping(d))) => { let _ = sender.send(Message::Pong(d)).await; }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("Tunnel error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
            Some(data) = rx.recv() => {
                if sender.send(Message::Binary(data)).await.is_err() { break; }
            }
        }
    }

    info!("Tunnel closed after {} requests", served);
}

fn spawn_request(client: reqwest::Client, req: TunnelRequest, tx: mpsc::Sender<Vec<u8>>) {
    tokio::spawn(async move {
        debug!("{} {} ({})", req.method, req.url, req.id);
        let resp = upstream::execute(&client, req).await;
        let data = match serde_json::to_vec(&resp) {
            Ok(d) => d,
            Err(e) => {
                warn!("Failed to encode response {}: {}", resp.id, e);
                match serde_json::to_vec(&TunnelResponse::error(resp.id, 502, "Response encoding failed")) {
                    Ok(d) => d,
                    Err(_) => return,
                }
            }
        };
        // The tunnel may have closed while we were fetching.
        let _ = tx.send(data).await;
    });
}
