//! Lifecycle of one vision websocket: authentication, the receive loop and teardown.
//!
//! The session is the only component that reads from or writes to the socket. Frames
//! are admitted through an [`AdmissionGate`]; admitted frames run on their own task
//! and hand the result back over a channel, so the receive loop never waits on
//! inference.

use crate::gate::{AdmissionGate, AdmissionPermit};
use crate::pipeline::{InferencePipeline, PipelineError};
use crate::protocol::{ClientMessage, FrameMessage, ServerMessage, VisionResult};
use crate::telemetry::Metrics;
use axum::extract::ws::{CloseFrame, Message, Utf8Bytes};
use futures::{Sink, SinkExt, Stream, StreamExt};
use std::{fmt::Display, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::mpsc;

pub const AUTH_FAILURE_CLOSE_CODE: u16 = 4001;
const AUTH_FAILURE_REASON: &str = "Authentication failed";
const AUTH_REQUIRED_MESSAGE: &str = "Authentication required.";

type ResultSender = mpsc::Sender<(VisionResult, AdmissionPermit)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingAuth,
    Authenticated,
    Closed,
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("No auth message within {0:?}")]
    Timeout(Duration),
    #[error("Malformed auth message: {0}")]
    Malformed(String),
    #[error("Invalid token")]
    InvalidToken,
    #[error("Connection closed before authentication")]
    Disconnected,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Failed to serialize message: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct SessionAuth {
    token: Arc<str>,
    timeout: Duration,
}

impl SessionAuth {
    pub fn new(token: impl Into<Arc<str>>, timeout: Duration) -> Self {
        Self {
            token: token.into(),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Checks the first text message of a connection.
    pub fn verify(&self, text: &str) -> Result<(), AuthError> {
        let message: ClientMessage =
            serde_json::from_str(text).map_err(|e| AuthError::Malformed(e.to_string()))?;

        match message {
            ClientMessage::Auth { token } if *token == *self.token => Ok(()),
            ClientMessage::Auth { .. } => Err(AuthError::InvalidToken),
            _ => Err(AuthError::Malformed("expected an auth message".into())),
        }
    }
}

pub struct VisionSession {
    pipeline: InferencePipeline,
    auth: SessionAuth,
    metrics: Arc<Metrics>,
    gate: AdmissionGate,
    state: SessionState,
}

impl VisionSession {
    pub fn new(pipeline: InferencePipeline, auth: SessionAuth, metrics: Arc<Metrics>) -> Self {
        Self {
            pipeline,
            auth,
            metrics,
            gate: AdmissionGate::new(),
            state: SessionState::AwaitingAuth,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drives the connection until the client leaves or authentication fails.
    ///
    /// A client that disconnects, before or after authenticating, ends the session
    /// with `Ok(())`.
    pub async fn run<S, R, E>(&mut self, mut sink: S, mut stream: R) -> Result<(), SessionError>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        match self.authenticate(&mut stream).await {
            Ok(()) => {}
            Err(AuthError::Disconnected) => {
                tracing::debug!("Client left before authenticating");
                self.state = SessionState::Closed;
                return Ok(());
            }
            Err(err) => {
                tracing::warn!(error = %err, "Vision authentication failed");
                reject(&mut sink).await;
                self.state = SessionState::Closed;
                return Err(err.into());
            }
        }

        self.state = SessionState::Authenticated;
        if let Err(err) = send(&mut sink, &ServerMessage::Connected).await {
            self.state = SessionState::Closed;
            return Err(err);
        }

        tracing::info!("Vision client connected");
        self.metrics.session_opened();

        let result = self.receive_loop(&mut sink, &mut stream).await;

        self.metrics.session_closed();
        self.state = SessionState::Closed;
        tracing::info!("Vision client disconnected");

        result
    }

    async fn authenticate<R, E>(&self, stream: &mut R) -> Result<(), AuthError>
    where
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let first_message = async {
            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => return self.auth.verify(text.as_str()),
                    Some(Ok(Message::Binary(_))) => {
                        return Err(AuthError::Malformed("binary message".into()))
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => return Err(AuthError::Disconnected),
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "Read failed during authentication");
                        return Err(AuthError::Disconnected);
                    }
                }
            }
        };

        tokio::time::timeout(self.auth.timeout(), first_message)
            .await
            .map_err(|_| AuthError::Timeout(self.auth.timeout()))?
    }

    async fn receive_loop<S, R, E>(&self, sink: &mut S, stream: &mut R) -> Result<(), SessionError>
    where
        S: Sink<Message> + Unpin,
        S::Error: Display,
        R: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let (result_tx, mut result_rx) = mpsc::channel::<(VisionResult, AdmissionPermit)>(1);

        loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str(), &result_tx),
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        tracing::debug!(error = %err, "Vision socket read failed");
                        return Err(SessionError::Transport(err.to_string()));
                    }
                },
                Some((result, permit)) = result_rx.recv() => {
                    // reopen the gate before the client can see the result
                    drop(permit);
                    let (mode, inference_ms) = (result.mode, result.inference_ms);
                    send(sink, &ServerMessage::Result(result)).await?;
                    self.metrics.record_result(mode, inference_ms);
                }
            }
        }
    }

    fn handle_text(&self, text: &str, results: &ResultSender) {
        let frame = match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Frame(frame)) => frame,
            Ok(_) => {
                tracing::debug!("Ignoring non-frame message");
                return;
            }
            Err(err) => {
                tracing::debug!(error = %err, "Ignoring unparseable message");
                return;
            }
        };

        self.metrics.record_frame_received();

        let Some(permit) = self.gate.try_admit() else {
            self.metrics.record_frame_dropped();
            tracing::debug!(mode = %frame.mode, "Frame dropped, inference in flight");
            return;
        };

        let pipeline = self.pipeline.clone();
        let metrics = Arc::clone(&self.metrics);
        let results = results.clone();

        // the permit travels with the result so the next frame cannot be queued ahead of it
        tokio::spawn(async move {
            if let Some(result) = process_frame(&pipeline, &metrics, frame).await {
                if results.send((result, permit)).await.is_err() {
                    tracing::debug!("Session closed, discarding result");
                }
            }
        });
    }
}

async fn process_frame(
    pipeline: &InferencePipeline,
    metrics: &Metrics,
    frame: FrameMessage,
) -> Option<VisionResult> {
    let mode = frame.mode;

    match pipeline.process(frame).await {
        Ok(result) => Some(result),
        Err(err) => {
            metrics.record_failure(err.kind());
            match &err {
                PipelineError::Decode(_) => {
                    tracing::warn!(%mode, kind = err.kind(), error = %err, "Frame rejected")
                }
                _ => tracing::error!(%mode, kind = err.kind(), error = %err, "Vision frame error"),
            }
            None
        }
    }
}

async fn send<S>(sink: &mut S, message: &ServerMessage) -> Result<(), SessionError>
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let text = serde_json::to_string(message)?;
    sink.send(Message::Text(text.into()))
        .await
        .map_err(|e| SessionError::Transport(e.to_string()))
}

/// One error notification, then the auth-failure close. The client may already be
/// gone, so write failures are ignored.
async fn reject<S>(sink: &mut S)
where
    S: Sink<Message> + Unpin,
    S::Error: Display,
{
    let error = ServerMessage::Error {
        message: AUTH_REQUIRED_MESSAGE.into(),
    };
    if let Err(err) = send(sink, &error).await {
        tracing::debug!(error = %err, "Failed to send auth error");
    }

    let close = Message::Close(Some(CloseFrame {
        code: AUTH_FAILURE_CLOSE_CODE,
        reason: Utf8Bytes::from_static(AUTH_FAILURE_REASON),
    }));
    if let Err(err) = sink.send(close).await {
        tracing::debug!(error = %err, "Failed to send auth close");
    }
}
