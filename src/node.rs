// src/node.rs
//
// The client driver: owns a `Client`, keeps membership alive, long-polls
// for events, and hands each batch to the registered dispatchers.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::client::{Client, ClientConfig};
use crate::error::SignalingError;
use crate::event::{Event, Kinded};
use crate::schema::{Members, Message, Request, SetLockedArgs};

// ─── Dispatcher ─────────────────────────────────────────────────────────────

/// Consumer of pulled event batches.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn dispatch(&self, events: &[Event]);
}

/// Adapter turning a plain closure into a [`Dispatcher`].
pub struct DispatcherFn<F>(pub F);

#[async_trait]
impl<F> Dispatcher for DispatcherFn<F>
where
    F: Fn(&[Event]) + Send + Sync,
{
    async fn dispatch(&self, events: &[Event]) {
        (self.0)(events)
    }
}

// ─── Node ───────────────────────────────────────────────────────────────────

struct Run {
    closing: watch::Sender<bool>,
    done: JoinHandle<Result<(), SignalingError>>,
}

/// Driver for one member's presence: start (create or join), pull loop,
/// cooperative stop, and thin passthroughs for the remaining operations.
pub struct Node {
    request: Request,
    client: Arc<Client>,
    run: tokio::sync::Mutex<Option<Run>>,
}

impl Node {
    /// Build a node from a (possibly partial) config; see
    /// [`ClientConfig::normalize`] for the filled-in defaults.
    pub fn new(config: ClientConfig) -> Result<Self, SignalingError> {
        let config = config.normalize()?;
        Ok(Self {
            request: config.request.clone(),
            client: Arc::new(Client::new(config)),
            run: tokio::sync::Mutex::new(None),
        })
    }

    pub fn room(&self) -> &str {
        &self.request.room_id
    }

    pub fn user(&self) -> &str {
        &self.request.user_id
    }

    pub fn client(&self) -> &Arc<Client> {
        &self.client
    }

    /// Establish membership -- `CreateRoom` when `owner`, `Join` otherwise --
    /// then launch the pull loop feeding `dispatchers`.
    pub async fn start(
        &self,
        owner: bool,
        dispatchers: Vec<Arc<dyn Dispatcher>>,
    ) -> Result<(), SignalingError> {
        self.stop().await?;

        if owner {
            self.client.create_room(&self.request).await?;
        } else {
            self.client.join(&self.request).await?;
        }

        let (closing, closing_rx) = watch::channel(false);
        let client = self.client.clone();
        let request = self.request.clone();
        let done = tokio::spawn(run_loop(client, request, dispatchers, closing_rx));

        *self.run.lock().await = Some(Run { closing, done });
        Ok(())
    }

    /// Signal the pull loop and wait for it to finish, returning the error
    /// it died with, if any. Idempotent: stopping a stopped node is `Ok`.
    pub async fn stop(&self) -> Result<(), SignalingError> {
        let Some(run) = self.run.lock().await.take() else {
            return Ok(());
        };
        let _ = run.closing.send(true);
        match run.done.await {
            Ok(result) => result,
            Err(e) => Err(SignalingError::Transport(format!("pull loop failed: {e}"))),
        }
    }

    /// Wrap `payload` in an event from this node and deliver it; `to = ""`
    /// broadcasts.
    pub async fn send<T: Kinded>(&self, to: &str, payload: &T) -> Result<(), SignalingError> {
        self.send_event(Event::new(&self.request.user_id, to, payload))
            .await
    }

    /// Deliver an already-built event envelope.
    pub async fn send_event(&self, event: Event) -> Result<(), SignalingError> {
        self.client
            .send(&Message {
                request: self.request.clone(),
                event,
            })
            .await
    }

    pub async fn members(&self) -> Result<Members, SignalingError> {
        self.client.members(&self.request).await
    }

    pub async fn locked(&self) -> Result<bool, SignalingError> {
        self.client.locked(&self.request).await
    }

    pub async fn set_locked(&self, locked: bool) -> Result<(), SignalingError> {
        self.client
            .set_locked(&SetLockedArgs {
                request: self.request.clone(),
                locked,
            })
            .await
    }
}

/// Idempotent membership refresh, then a pull; repeat until the close
/// signal or the first failed call. The close signal is only honored
/// between calls, so an in-flight pull finishes (bounded by the server's
/// reply deadline) before `stop` returns.
async fn run_loop(
    client: Arc<Client>,
    request: Request,
    dispatchers: Vec<Arc<dyn Dispatcher>>,
    mut closing: watch::Receiver<bool>,
) -> Result<(), SignalingError> {
    loop {
        if *closing.borrow() {
            return Ok(());
        }
        client.join(&request).await?;
        tokio::select! {
            _ = closing.changed() => {
                debug!(room = %request.room_id, "pull loop closing");
                return Ok(());
            }
            pulled = client.pull(&request) => {
                let events = pulled?;
                for dispatcher in &dispatchers {
                    dispatcher.dispatch(&events).await;
                }
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
