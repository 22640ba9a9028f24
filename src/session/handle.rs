// Session task and its handle
//
// `Session::spawn` moves the session into a tokio task that owns it. The
// task serialises commands from `SessionHandle`s, transport events and the
// phase deadline through one select loop, so every mutation happens on a
// single task and observers only ever see whole snapshots.

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use super::{Session, SessionSnapshot};
use crate::error::{OtaError, OtaResult};
use crate::framer::FirmwareImage;
use crate::scanner::PeripheralIdentity;
use crate::transport::{EventReceiver, Transport};

const COMMAND_QUEUE_DEPTH: usize = 32;

type Reply = oneshot::Sender<OtaResult<()>>;

pub enum Command {
    Connect(PeripheralIdentity, Reply),
    StartOta(FirmwareImage, Reply),
    Reset(Reply),
    Disconnect(Reply),
    Rescan(Reply),
    StopScan(Reply),
}

/// Cloneable front end to a running session task.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionSnapshot>,
}

impl SessionHandle {
    pub async fn connect(&self, peripheral: PeripheralIdentity) -> OtaResult<()> {
        self.request(|reply| Command::Connect(peripheral, reply)).await
    }

    pub async fn start_ota(&self, image: FirmwareImage) -> OtaResult<()> {
        self.request(|reply| Command::StartOta(image, reply)).await
    }

    pub async fn reset(&self) -> OtaResult<()> {
        self.request(Command::Reset).await
    }

    pub async fn disconnect(&self) -> OtaResult<()> {
        self.request(Command::Disconnect).await
    }

    pub async fn rescan(&self) -> OtaResult<()> {
        self.request(Command::Rescan).await
    }

    pub async fn stop_scan(&self) -> OtaResult<()> {
        self.request(Command::StopScan).await
    }

    /// Latest published state.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.state.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_for<F>(&self, mut predicate: F) -> OtaResult<SessionSnapshot>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut state = self.state.clone();
        loop {
            {
                let snapshot = state.borrow_and_update();
                if predicate(&snapshot) {
                    return Ok(snapshot.clone());
                }
            }
            state.changed().await.map_err(|_| OtaError::SessionClosed)?;
        }
    }

    async fn request<F>(&self, command: F) -> OtaResult<()>
    where
        F: FnOnce(Reply) -> Command,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| OtaError::SessionClosed)?;
        reply_rx.await.map_err(|_| OtaError::SessionClosed)?
    }
}

impl<T: Transport + 'static> Session<T> {
    /// Move the session onto its own task.
    pub fn spawn(self, events: EventReceiver) -> SessionHandle {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let state = self.subscribe();
        tokio::spawn(self.run(commands_rx, events));
        SessionHandle {
            commands: commands_tx,
            state,
        }
    }

    /// Runs until every `SessionHandle` is dropped.
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut events: EventReceiver) {
        let mut events_open = true;
        loop {
            let deadline = self.deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.dispatch(command).await,
                    None => break,
                },
                event = events.recv(), if events_open => match event {
                    Some(event) => self.handle_event(event).await,
                    None => {
                        tlog!("[session] Transport event channel closed");
                        events_open = false;
                    }
                },
                _ = sleep_until(deadline), if deadline.is_some() => {
                    self.expire_deadline().await;
                }
            }
        }
        tlog!("[session] All handles dropped, session task exiting");
    }

    async fn dispatch(&mut self, command: Command) {
        // A caller that stopped waiting for its reply is not an error
        match command {
            Command::Connect(peripheral, reply) => {
                let _ = reply.send(self.connect(peripheral).await);
            }
            Command::StartOta(image, reply) => {
                let _ = reply.send(self.start_ota(image).await);
            }
            Command::Reset(reply) => {
                self.reset();
                let _ = reply.send(Ok(()));
            }
            Command::Disconnect(reply) => {
                let _ = reply.send(self.disconnect().await);
            }
            Command::Rescan(reply) => {
                let _ = reply.send(self.rescan().await);
            }
            Command::StopScan(reply) => {
                let _ = reply.send(self.stop_scan().await);
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
