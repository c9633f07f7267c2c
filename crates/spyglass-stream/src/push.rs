//! Push delivery over the run channel websocket.
//!
//! Delivery is subscribe-then-trigger: the channel is opened for a
//! client-chosen channel id first, then the trigger request names that
//! channel. The accepted trigger response carries nothing but the run id;
//! every result arrives through the channel. Each text frame is one run
//! event JSON object; frames that do not parse are dropped with a warning
//! and never kill the channel.

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt, stream::SplitSink};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc, watch};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::{debug, warn};
use url::Url;
use uuid::Uuid;

use spyglass_api::{ApiClient, TriggerRunRequest};

use crate::coordinator::{ChannelOpener, EventSink, PushRunObserver, RunChannel};
use crate::error::StreamError;
use crate::event::{RunEvent, parse_run_event};
use crate::poll::RunBackend;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsWriter = SplitSink<WsStream, Message>;

/// Final disposition of a pushed run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { result: Option<Value> },
    Failed { message: String },
    Cancelled,
}

/// Build the channel URL: same host as the API base, websocket scheme,
/// access token as a query parameter.
pub fn channel_url(
    base_url: &str,
    channel_id: &str,
    access_token: &str,
) -> Result<Url, StreamError> {
    let joined = format!(
        "{}{}",
        base_url.trim_end_matches('/'),
        ApiClient::run_channel_path(channel_id)
    );
    let mut url = Url::parse(&joined).map_err(|error| StreamError::InvalidUrl(error.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(StreamError::InvalidUrl(format!(
                "unsupported scheme: {other}"
            )));
        }
    };
    url.set_scheme(scheme)
        .map_err(|()| StreamError::InvalidUrl("scheme rewrite failed".to_string()))?;
    url.query_pairs_mut().append_pair("token", access_token);
    Ok(url)
}

/// Decode one text frame. `None` means the frame is not an event; the
/// caller drops it without closing the channel.
#[must_use]
pub fn parse_push_frame(text: &str) -> Option<RunEvent> {
    let value = serde_json::from_str::<Value>(text).ok()?;
    parse_run_event(&value)
}

/// An open run channel. Events arrive through [`Self::recv`]; the final
/// outcome resolves exactly once, whether the job finished, the transport
/// died, or the caller cancelled.
pub struct PushSubscription {
    run_id: Arc<Mutex<Option<String>>>,
    writer: Arc<Mutex<Option<WsWriter>>>,
    events_rx: Mutex<mpsc::UnboundedReceiver<RunEvent>>,
    outcome_rx: watch::Receiver<Option<RunOutcome>>,
    outcome_tx: watch::Sender<Option<RunOutcome>>,
    reader_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PushSubscription {
    /// Connect the channel and start the background reader.
    pub async fn open(url: &Url) -> Result<Self, StreamError> {
        if url.scheme() != "ws" && url.scheme() != "wss" {
            return Err(StreamError::InvalidUrl(format!(
                "channel must use ws:// or wss://, got {}",
                url.scheme()
            )));
        }

        let (stream, _response) = connect_async(url.as_str())
            .await
            .map_err(|error| StreamError::Connect(error.to_string()))?;
        let (writer, mut reader) = stream.split();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let reader_outcome = outcome_tx.clone();
        let channel_url = url.to_string();
        let task = tokio::spawn(async move {
            let mut saw_terminal = false;
            while let Some(frame) = reader.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let Some(event) = parse_push_frame(text.as_str()) else {
                            warn!(url = %channel_url, "dropping unparseable channel frame");
                            continue;
                        };
                        match &event {
                            RunEvent::Done { result } => {
                                saw_terminal = true;
                                resolve(
                                    &reader_outcome,
                                    RunOutcome::Completed {
                                        result: result.clone(),
                                    },
                                );
                            }
                            RunEvent::Error { message, .. } => {
                                saw_terminal = true;
                                resolve(
                                    &reader_outcome,
                                    RunOutcome::Failed {
                                        message: message.clone(),
                                    },
                                );
                            }
                            _ => {}
                        }
                        let terminal = event.is_terminal();
                        if events_tx.send(event).is_err() {
                            break;
                        }
                        if terminal {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        debug!(url = %channel_url, bytes = payload.len(), "channel ping");
                    }
                    Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {}
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        warn!(url = %channel_url, %error, "channel read failed");
                        let event = RunEvent::transport_error(error.to_string());
                        saw_terminal = true;
                        resolve(
                            &reader_outcome,
                            RunOutcome::Failed {
                                message: error.to_string(),
                            },
                        );
                        let _ = events_tx.send(event);
                        break;
                    }
                }
            }

            // Closed under us before the job reported anything terminal.
            if !saw_terminal {
                let event = RunEvent::transport_error("channel closed before done");
                resolve(
                    &reader_outcome,
                    RunOutcome::Failed {
                        message: "channel closed before done".to_string(),
                    },
                );
                let _ = events_tx.send(event);
            }
        });

        Ok(Self {
            run_id: Arc::new(Mutex::new(None)),
            writer: Arc::new(Mutex::new(Some(writer))),
            events_rx: Mutex::new(events_rx),
            outcome_rx,
            outcome_tx,
            reader_task: Mutex::new(Some(task)),
        })
    }

    /// Attach the run id once the trigger response arrives. Used for the
    /// best-effort stop notification on cancel.
    pub async fn bind_run(&self, run_id: &str) {
        *self.run_id.lock().await = Some(run_id.to_string());
    }

    /// Next event, in arrival order. `None` after the channel is done.
    pub async fn recv(&self) -> Option<RunEvent> {
        self.events_rx.lock().await.recv().await
    }

    /// Wait for the final outcome. Resolves exactly once per channel.
    pub async fn wait(&self) -> RunOutcome {
        let mut rx = self.outcome_rx.clone();
        loop {
            if let Some(outcome) = rx.borrow().clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return RunOutcome::Failed {
                    message: "channel state lost".to_string(),
                };
            }
        }
    }

    #[must_use]
    pub fn outcome(&self) -> Option<RunOutcome> {
        self.outcome_rx.borrow().clone()
    }

    /// Close the socket and stop the reader without resolving an
    /// outcome. Leaving the channel at a pause boundary goes through
    /// here; the run continues on a fresh subscription.
    pub async fn detach(&self) {
        if let Some(mut writer) = self.writer.lock().await.take()
            && let Err(error) = writer.send(Message::Close(None)).await
        {
            debug!(%error, "close frame send failed");
        }
        if let Some(task) = self.reader_task.lock().await.take() {
            task.abort();
        }
    }

    /// Close the channel locally and resolve the outcome as cancelled.
    /// The backend stop notification is best-effort; a failure there is
    /// logged and not surfaced.
    pub async fn cancel(&self, backend: Option<&dyn RunBackend>) {
        resolve(&self.outcome_tx, RunOutcome::Cancelled);
        self.detach().await;

        if let Some(backend) = backend {
            let run_id = self.run_id.lock().await.clone();
            if let Some(run_id) = run_id
                && let Err(error) = backend.stop_run(&run_id).await
            {
                warn!(%run_id, %error, "stop notification failed");
            }
        }
    }
}

#[async_trait]
impl RunChannel for PushSubscription {
    async fn next_event(&mut self) -> Option<RunEvent> {
        self.recv().await
    }

    async fn close(&mut self) {
        self.detach().await;
    }
}

/// Opens run channels through the API client, reading the access token
/// fresh on every subscription so a rotated credential is picked up.
pub struct ApiChannelOpener {
    api: ApiClient,
}

impl ApiChannelOpener {
    #[must_use]
    pub fn new(api: ApiClient) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ChannelOpener for ApiChannelOpener {
    async fn open_channel(&self, run_id: &str) -> Result<Box<dyn RunChannel>, StreamError> {
        let token = self.api.bearer_token().ok_or(StreamError::NotAuthenticated)?;
        let url = channel_url(self.api.base_url(), run_id, &token)?;
        let subscription = PushSubscription::open(&url).await?;
        subscription.bind_run(run_id).await;
        Ok(Box::new(subscription))
    }
}

/// First outcome wins; later resolutions are ignored.
fn resolve(tx: &watch::Sender<Option<RunOutcome>>, outcome: RunOutcome) {
    tx.send_if_modified(|slot| {
        if slot.is_none() {
            *slot = Some(outcome);
            true
        } else {
            false
        }
    });
}

/// Subscribe-then-trigger. Opens the channel on a fresh channel id, then
/// issues the trigger naming it, so no event can be emitted before anyone
/// is listening.
pub async fn subscribe_then_trigger(
    api: &ApiClient,
    kind: &str,
    payload: Value,
) -> Result<(PushSubscription, String), StreamError> {
    let token = api.bearer_token().ok_or(StreamError::NotAuthenticated)?;
    let channel_id = format!("ch_{}", Uuid::new_v4().simple());
    let url = channel_url(api.base_url(), &channel_id, &token)?;

    let subscription = PushSubscription::open(&url).await?;
    let accepted = api
        .trigger_run(&TriggerRunRequest {
            kind: kind.to_string(),
            payload,
            channel: Some(channel_id),
        })
        .await?;
    subscription.bind_run(&accepted.run_id).await;
    Ok((subscription, accepted.run_id))
}

/// Subscribe-then-trigger wired into the pause-capable observer. The
/// pre-trigger subscription is adopted as the first channel; a pause
/// later re-subscribes through the same API client.
pub async fn observe_then_trigger<S: EventSink>(
    api: &ApiClient,
    kind: &str,
    payload: Value,
    sink: S,
) -> Result<PushRunObserver<S>, StreamError> {
    let (subscription, run_id) = subscribe_then_trigger(api, kind, payload).await?;
    let backend: Arc<dyn RunBackend> = Arc::new(api.clone());
    let opener = Arc::new(ApiChannelOpener::new(api.clone()));
    Ok(PushRunObserver::with_channel(
        backend,
        opener,
        run_id,
        sink,
        Box::new(subscription),
    ))
}
