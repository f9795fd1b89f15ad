//! WebSocket bridge between sign nodes and the shared sign channel.
//!
//! A connected sign node acts as the handler of a [`SignResponder`]: each
//! request from the channel is forwarded over the socket and the node's
//! next text frame is published as the reply.
//!
//! [`SignResponder`]: distbuild_scheduler::SignResponder

use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use distbuild_core::signing::SignRequest;
use distbuild_core::{Error, Result};
use distbuild_scheduler::SignHandler;
use futures::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::AppState;

/// WebSocket upgrade handler for sign nodes.
pub async fn sign_task_queue(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_sign_node(socket, state))
}

async fn serve_sign_node(socket: WebSocket, state: AppState) {
    info!("Sign node connected");
    let (sink, stream) = socket.split();
    let signer = SocketSigner::new(sink, stream, state.signing.request_timeout);

    match state.responder().run(&signer, state.shutdown.clone()).await {
        Ok(()) => info!("Sign node session ended"),
        Err(Error::Disconnected(reason)) => info!(%reason, "Sign node disconnected"),
        Err(e) => warn!(error = %e, "Sign node session failed"),
    }
}

/// Signs by asking the node on the other end of a socket.
pub(crate) struct SocketSigner<Tx, Rx> {
    socket: Mutex<(Tx, Rx)>,
    reply_timeout: Duration,
}

impl<Tx, Rx> SocketSigner<Tx, Rx> {
    pub(crate) fn new(tx: Tx, rx: Rx, reply_timeout: Duration) -> Self {
        Self {
            socket: Mutex::new((tx, rx)),
            reply_timeout,
        }
    }
}

#[async_trait]
impl<Tx, Rx, E> SignHandler for SocketSigner<Tx, Rx>
where
    Tx: Sink<Message> + Unpin + Send,
    Tx::Error: Display + Send,
    Rx: Stream<Item = std::result::Result<Message, E>> + Unpin + Send,
    E: Display + Send,
{
    async fn handle(&self, request: &SignRequest) -> Result<Value> {
        let text = serde_json::to_string(request)
            .map_err(|e| Error::Internal(format!("encode sign request: {}", e)))?;

        let mut socket = self.socket.lock().await;
        let (tx, rx) = &mut *socket;
        tx.send(Message::Text(text.into()))
            .await
            .map_err(|e| Error::Disconnected(format!("send to sign node failed: {}", e)))?;

        // A reply arriving after the deadline would be read as the answer to
        // the next request, so a silent node ends the session.
        let reply = tokio::time::timeout(self.reply_timeout, next_text(rx))
            .await
            .map_err(|_| {
                Error::Disconnected(format!(
                    "sign node did not answer request {}",
                    request.task_id
                ))
            })??;

        serde_json::from_str(&reply)
            .map_err(|e| Error::Validation(format!("malformed reply from sign node: {}", e)))
    }
}

async fn next_text<Rx, E>(rx: &mut Rx) -> Result<String>
where
    Rx: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    while let Some(message) = rx.next().await {
        match message {
            Ok(Message::Text(text)) => return Ok(text.as_str().to_string()),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => return Err(Error::Disconnected(format!("sign node socket error: {}", e))),
        }
    }
    Err(Error::Disconnected(
        "sign node closed the connection".to_string(),
    ))
}
