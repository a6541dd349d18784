//! Outbound command dispatcher
//!
//! A single task owns the link session and its scheduler state, so every
//! mutation happens on one logical thread of control. Control surfaces talk
//! to it through the cloneable [`DispatcherHandle`], whose calls never block.
//!
//! The task wakes up for two reasons only: a request from a handle, or the
//! completion of the one outstanding write. After either it runs one tick of
//! the scheduler. There is no timer.

use super::events::{DispatchEvent, LinkStatus};
use crate::transport::{CommandLink, TransportError};
use futures::future::BoxFuture;
use futures::FutureExt;
use rabbit_shared::{
    ControlInputs, CriticalIntent, EncodedCommand, Encoder, Intent, LinkState, Movement, Step,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Errors returned by the Intent API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("No active link, command dropped")]
    TransportUnavailable,

    #[error("Dispatcher task has stopped")]
    Closed,
}

enum Request {
    Critical(CriticalIntent),
    Movement(Movement),
    SetMovementEnabled(bool),
    RequestMovement,
    Connect(Arc<dyn CommandLink>),
    Disconnect(String),
    Release {
        stop: bool,
        reply: oneshot::Sender<Option<Arc<dyn CommandLink>>>,
    },
    Status(oneshot::Sender<LinkStatus>),
}

/// Intent API exposed to control surfaces
#[derive(Clone)]
pub struct DispatcherHandle {
    requests: mpsc::UnboundedSender<Request>,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<DispatchEvent>,
}

impl DispatcherHandle {
    fn send(&self, request: Request) -> Result<(), DispatchError> {
        self.requests
            .send(request)
            .map_err(|_| DispatchError::Closed)
    }

    /// Queue a critical command behind any already submitted.
    ///
    /// Without an active link the command is dropped and reported.
    pub fn submit_critical(&self, intent: CriticalIntent) -> Result<(), DispatchError> {
        if !self.is_connected() {
            warn!("[DISPATCH] No link, dropping {} command", intent.kind);
            let _ = self
                .events
                .send(DispatchEvent::CriticalDropped { kind: intent.kind });
            return Err(DispatchError::TransportUnavailable);
        }
        self.send(Request::Critical(intent))
    }

    /// Replace the movement target; only the latest value is ever written
    pub fn update_movement(&self, angle: i32, motor_speed: i32) -> Result<(), DispatchError> {
        self.send(Request::Movement(Movement::new(angle, motor_speed)))
    }

    /// Allow or suppress movement writes (manual control on/off)
    pub fn set_movement_enabled(&self, enabled: bool) -> Result<(), DispatchError> {
        self.send(Request::SetMovementEnabled(enabled))
    }

    /// Re-send the current target even if it was already written
    pub fn request_movement(&self) -> Result<(), DispatchError> {
        self.send(Request::RequestMovement)
    }

    /// Start a fresh session on a newly connected link
    pub fn on_connect(&self, link: Arc<dyn CommandLink>) -> Result<(), DispatchError> {
        self.connected.store(true, Ordering::SeqCst);
        self.send(Request::Connect(link))
    }

    /// Drop the session and everything queued on it
    pub fn on_disconnect(&self, reason: impl Into<String>) -> Result<(), DispatchError> {
        self.connected.store(false, Ordering::SeqCst);
        self.send(Request::Disconnect(reason.into()))
    }

    /// Intentional disconnect: drop the session, optionally write a stop
    /// command straight to the link, and hand the link back for closing.
    pub async fn release(&self, stop: bool) -> Result<Option<Arc<dyn CommandLink>>, DispatchError> {
        self.connected.store(false, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        self.send(Request::Release { stop, reply })?;
        rx.await.map_err(|_| DispatchError::Closed)
    }

    /// Snapshot of the dispatcher state after all earlier requests were handled
    pub async fn status(&self) -> Result<LinkStatus, DispatchError> {
        let (reply, rx) = oneshot::channel();
        self.send(Request::Status(reply))?;
        rx.await.map_err(|_| DispatchError::Closed)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

/// The write currently occupying the link
struct PendingWrite {
    command: EncodedCommand,
    future: BoxFuture<'static, Result<(), TransportError>>,
}

/// One connection session; dropping it cancels the outstanding write
struct Session {
    link: Arc<dyn CommandLink>,
    state: LinkState,
    write: Option<PendingWrite>,
}

/// Owns the session and runs the scheduler
pub struct Dispatcher {
    encoder: Encoder,
    inputs: ControlInputs,
    session: Option<Session>,
    requests: mpsc::UnboundedReceiver<Request>,
    events: mpsc::UnboundedSender<DispatchEvent>,
}

impl Dispatcher {
    /// Spawn the dispatcher task. Outcomes are reported on `events`.
    pub fn spawn(encoder: Encoder, events: mpsc::UnboundedSender<DispatchEvent>) -> DispatcherHandle {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();

        let dispatcher = Self {
            encoder,
            inputs: ControlInputs::default(),
            session: None,
            requests: requests_rx,
            events: events.clone(),
        };
        tokio::spawn(dispatcher.run());

        DispatcherHandle {
            requests: requests_tx,
            connected: Arc::new(AtomicBool::new(false)),
            events,
        }
    }

    async fn run(mut self) {
        info!(
            "[DISPATCH] Started ({:?} wire format)",
            self.encoder.format()
        );

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => break,
                },
                result = wait_for_write(&mut self.session) => self.finish_write(result),
            }
            self.tick();
        }

        info!("[DISPATCH] All handles dropped, stopping");
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Critical(intent) => {
                let kind = intent.kind;
                match self.session.as_mut() {
                    Some(session) => {
                        session
                            .state
                            .enqueue_critical(self.encoder.encode(&Intent::Critical(intent)));
                        debug!(
                            "[DISPATCH] Queued {} ({} waiting)",
                            kind,
                            session.state.queued_critical()
                        );
                    }
                    // Lost the race with a disconnect
                    None => {
                        warn!("[DISPATCH] Session gone, dropping {} command", kind);
                        emit(&self.events, DispatchEvent::CriticalDropped { kind });
                    }
                }
            }
            Request::Movement(movement) => {
                if self.inputs.set_target(movement) {
                    if let Some(session) = self.session.as_mut() {
                        session.state.request_movement();
                    }
                }
            }
            Request::SetMovementEnabled(enabled) => {
                let was_enabled = self.inputs.movement_enabled;
                self.inputs.movement_enabled = enabled;
                if enabled && !was_enabled {
                    // Push the current position right after switching to manual
                    if let Some(session) = self.session.as_mut() {
                        session.state.request_movement();
                    }
                }
                info!("[DISPATCH] Movement {}", if enabled { "enabled" } else { "disabled" });
            }
            Request::RequestMovement => {
                if let Some(session) = self.session.as_mut() {
                    session.state.request_movement();
                }
            }
            Request::Connect(link) => {
                if let Some(old) = self.session.take() {
                    self.close_session(old, "replaced by a new link");
                }
                info!("[DISPATCH] Session opened on {} link", link.name());
                emit(
                    &self.events,
                    DispatchEvent::SessionOpened {
                        transport: link.name(),
                    },
                );
                self.session = Some(Session {
                    link,
                    state: LinkState::new(),
                    write: None,
                });
            }
            Request::Disconnect(reason) => {
                if let Some(session) = self.session.take() {
                    self.close_session(session, &reason);
                }
            }
            Request::Release { stop, reply } => {
                let link = self.session.take().map(|session| {
                    let link = session.link.clone();
                    self.close_session(session, "released");
                    link
                });

                if let (true, Some(link)) = (stop, link.as_ref()) {
                    let command = self.encoder.encode(&CriticalIntent::stop().into());
                    match link.write(command.payload().clone()).await {
                        Ok(()) => info!("[DISPATCH] Sent stop command before disconnect"),
                        Err(e) => error!("[DISPATCH] Stop command before disconnect failed: {}", e),
                    }
                }

                let _ = reply.send(link);
            }
            Request::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    /// One scheduler evaluation; starts at most one write
    fn tick(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let command = match session.state.next_step(&self.inputs) {
            Step::Critical(command) => command,
            Step::Movement(movement) => self.encoder.encode_movement(movement),
            Step::Busy | Step::Idle => return,
        };

        debug!("[DISPATCH] Writing {}", command);
        let link = session.link.clone();
        let payload = command.payload().clone();
        session.write = Some(PendingWrite {
            command,
            future: async move { link.write(payload).await }.boxed(),
        });
    }

    fn finish_write(&mut self, result: Result<(), TransportError>) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(write) = session.write.take() else {
            return;
        };
        session.state.complete();

        let kind = write.command.kind();
        match result {
            Ok(()) => {
                debug!("[DISPATCH] Sent {}", write.command);
                emit(
                    &self.events,
                    DispatchEvent::Sent {
                        kind,
                        payload: write.command.to_string(),
                    },
                );
            }
            Err(e) => {
                if kind.is_critical() {
                    error!("[DISPATCH] Critical {} command lost: {}", kind, e);
                } else {
                    warn!("[DISPATCH] Movement write failed: {}", e);
                }
                emit(
                    &self.events,
                    DispatchEvent::WriteFailed {
                        kind,
                        payload: write.command.to_string(),
                        error: e.to_string(),
                    },
                );
            }
        }
    }

    fn close_session(&self, session: Session, reason: &str) {
        let dropped_critical = session.state.queued_critical();
        let cancelled_write = session.state.in_flight();

        if dropped_critical > 0 || cancelled_write.is_some() {
            warn!(
                "[DISPATCH] Session closed ({}): dropped {} queued command(s), cancelled write: {:?}",
                reason, dropped_critical, cancelled_write
            );
        } else {
            info!("[DISPATCH] Session closed ({})", reason);
        }

        emit(
            &self.events,
            DispatchEvent::SessionClosed {
                reason: reason.to_string(),
                dropped_critical,
                cancelled_write,
            },
        );
    }

    fn status(&self) -> LinkStatus {
        let mut status = LinkStatus {
            target: self.inputs.target,
            movement_enabled: self.inputs.movement_enabled,
            ..Default::default()
        };
        if let Some(session) = &self.session {
            status.connected = true;
            status.in_flight = session.state.in_flight();
            status.queued_critical = session.state.queued_critical();
            status.pending_movement = session.state.pending_movement();
            status.last_sent = session.state.last_sent();
        }
        status
    }
}

/// Resolves when the outstanding write completes; never resolves when idle
async fn wait_for_write(session: &mut Option<Session>) -> Result<(), TransportError> {
    match session.as_mut().and_then(|s| s.write.as_mut()) {
        Some(write) => (&mut write.future).await,
        None => std::future::pending().await,
    }
}

fn emit(events: &mpsc::UnboundedSender<DispatchEvent>, event: DispatchEvent) {
    let _ = events.send(event);
}
