//! Concurrent swaps, one task each, addressed by swap id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::contract::ContractHandle;
use crate::machine::{MachineError, Step, SwapContext, SwapEvent, SwapMachine, SwapSetup};
use crate::message::PeerMessage;
use crate::params::SwapId;
use crate::state::{Role, SwapState};
use crate::timeout::{Clock, DeadlineKind};

const COMMAND_BUFFER: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SwapStatus {
    pub swap_id: SwapId,
    pub role: Role,
    pub state: SwapState,
    pub handle: Option<ContractHandle>,
    /// The counterparty revealed its secret and the joint XMR account can be swept.
    pub spend_key_recovered: bool,
    pub events_handled: u64,
    pub last_error: Option<String>,
}

/// A message one of our swaps wants delivered to its counterparty.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub swap_id: SwapId,
    pub message: PeerMessage,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("swap {0} already registered")]
    DuplicateSwap(SwapId),
    #[error("unknown swap {0}")]
    UnknownSwap(SwapId),
    #[error("swap {swap_id} finished in state {state}")]
    Finished { swap_id: SwapId, state: SwapState },
    #[error("initiate request rejected: {0}")]
    InitiateRejected(String),
    #[error(transparent)]
    Machine(#[from] MachineError),
}

struct Command {
    event: SwapEvent,
    reply: Option<oneshot::Sender<Result<Step, MachineError>>>,
}

struct SwapEntry {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SwapStatus>,
    task: Option<JoinHandle<()>>,
}

pub struct SwapRegistry {
    ctx: Arc<SwapContext>,
    swaps: RwLock<HashMap<SwapId, SwapEntry>>,
    /// Setups waiting for the counterparty's initiate request.
    expected: Mutex<HashMap<SwapId, SwapSetup>>,
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: watch::Sender<bool>,
}

impl SwapRegistry {
    pub fn new(ctx: Arc<SwapContext>) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let registry = Arc::new(Self {
            ctx,
            swaps: RwLock::new(HashMap::new()),
            expected: Mutex::new(HashMap::new()),
            outbound,
            shutdown,
        });
        (registry, outbound_rx)
    }

    pub fn context(&self) -> &Arc<SwapContext> {
        &self.ctx
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Spawns the task for a new swap. An id can be registered only once, even after the
    /// swap has finished.
    pub async fn start(&self, setup: SwapSetup) -> Result<SwapId, RegistryError> {
        self.spawn(setup, None).await
    }

    /// Starts a swap and sends the counterparty an initiate request for it.
    pub async fn initiate(&self, setup: SwapSetup) -> Result<SwapId, RegistryError> {
        let role = setup.role;
        let params = setup.params.clone();
        let swap_id = self.start(setup).await?;
        self.send_outbound(
            swap_id,
            PeerMessage::InitiateRequest {
                swap_id,
                role,
                params,
            },
        );
        Ok(swap_id)
    }

    /// Restarts a swap after a crash; the machine re-derives its state from the chain
    /// before handling anything else.
    pub async fn resume(&self, setup: SwapSetup) -> Result<SwapId, RegistryError> {
        self.spawn(setup, Some(SwapEvent::Resync)).await
    }

    /// Registers the setup we agreed to, to be started when the counterparty initiates.
    pub async fn expect(&self, setup: SwapSetup) -> SwapId {
        let swap_id = setup.params.swap_id();
        self.expected.lock().await.insert(swap_id, setup);
        swap_id
    }

    /// Routes an inbound peer message to its swap.
    pub async fn deliver(&self, message: PeerMessage) -> Result<(), RegistryError> {
        match message {
            PeerMessage::InitiateRequest {
                swap_id,
                role,
                params,
            } => {
                let mut expected = self.expected.lock().await;
                let Some(setup) = expected.get(&swap_id) else {
                    warn!(%swap_id, "Initiate request for a swap we never agreed to");
                    return Err(RegistryError::UnknownSwap(swap_id));
                };
                if role != setup.role.counterparty() {
                    return Err(RegistryError::InitiateRejected(format!(
                        "peer claims role {role}, we are {}",
                        setup.role
                    )));
                }
                if params != setup.params || params.swap_id() != swap_id {
                    return Err(RegistryError::InitiateRejected(
                        "parameters differ from the agreed swap".into(),
                    ));
                }
                let Some(setup) = expected.remove(&swap_id) else {
                    return Err(RegistryError::UnknownSwap(swap_id));
                };
                drop(expected);
                self.start(setup).await.map(|_| ())
            }
            message => {
                let swap_id = message.swap_id();
                self.dispatch(swap_id, SwapEvent::Peer(message)).await
            }
        }
    }

    /// Queues an event for a running swap.
    pub async fn dispatch(&self, swap_id: SwapId, event: SwapEvent) -> Result<(), RegistryError> {
        let (commands, status) = self.sender_for(swap_id).await?;
        commands
            .send(Command { event, reply: None })
            .await
            .map_err(|_| finished(swap_id, &status))
    }

    /// Like [`SwapRegistry::dispatch`], waiting for the swap task to handle the event.
    pub async fn submit(&self, swap_id: SwapId, event: SwapEvent) -> Result<Step, RegistryError> {
        let (commands, status) = self.sender_for(swap_id).await?;
        let (reply, response) = oneshot::channel();
        commands
            .send(Command {
                event,
                reply: Some(reply),
            })
            .await
            .map_err(|_| finished(swap_id, &status))?;
        match response.await {
            Ok(result) => result.map_err(RegistryError::from),
            Err(_) => Err(finished(swap_id, &status)),
        }
    }

    pub async fn cancel(&self, swap_id: SwapId) -> Result<Step, RegistryError> {
        self.submit(swap_id, SwapEvent::Cancel).await
    }

    pub async fn status(&self, swap_id: SwapId) -> Option<SwapStatus> {
        self.swaps
            .read()
            .await
            .get(&swap_id)
            .map(|entry| entry.status.borrow().clone())
    }

    pub async fn statuses(&self) -> Vec<SwapStatus> {
        self.swaps
            .read()
            .await
            .values()
            .map(|entry| entry.status.borrow().clone())
            .collect()
    }

    /// Contracts of swaps that still need chain events.
    pub async fn watched_contracts(&self) -> Vec<ContractHandle> {
        self.swaps
            .read()
            .await
            .values()
            .filter_map(|entry| {
                let status = entry.status.borrow();
                if status.state.is_terminal() {
                    None
                } else {
                    status.handle
                }
            })
            .collect()
    }

    pub async fn wait_for_state(
        &self,
        swap_id: SwapId,
        state: SwapState,
    ) -> Result<SwapStatus, RegistryError> {
        self.wait_until(swap_id, |status| {
            status.state == state || status.state.is_terminal()
        })
        .await
    }

    pub async fn wait_for_terminal(&self, swap_id: SwapId) -> Result<SwapStatus, RegistryError> {
        self.wait_until(swap_id, |status| status.state.is_terminal())
            .await
    }

    /// Resolves once `predicate` holds, or with the last status if the swap task exits.
    pub async fn wait_until(
        &self,
        swap_id: SwapId,
        predicate: impl FnMut(&SwapStatus) -> bool,
    ) -> Result<SwapStatus, RegistryError> {
        let mut status = self
            .swaps
            .read()
            .await
            .get(&swap_id)
            .map(|entry| entry.status.clone())
            .ok_or(RegistryError::UnknownSwap(swap_id))?;
        let reached = match status.wait_for(predicate).await {
            Ok(current) => Some(current.clone()),
            Err(_) => None,
        };
        Ok(reached.unwrap_or_else(|| status.borrow().clone()))
    }

    /// Stops every swap task. Swaps that were not finished can be resumed later.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let tasks: Vec<_> = {
            let mut swaps = self.swaps.write().await;
            swaps.values_mut().filter_map(|entry| entry.task.take()).collect()
        };
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "Swap task ended abnormally");
            }
        }
        info!("Swap registry stopped");
    }

    async fn spawn(
        &self,
        setup: SwapSetup,
        first: Option<SwapEvent>,
    ) -> Result<SwapId, RegistryError> {
        let role = setup.role;
        let machine = SwapMachine::new(setup, self.ctx.clone())?;
        let swap_id = machine.swap_id();

        let mut swaps = self.swaps.write().await;
        if swaps.contains_key(&swap_id) {
            return Err(RegistryError::DuplicateSwap(swap_id));
        }

        let (commands, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        if let Some(event) = first {
            // Fresh channel with spare capacity.
            let _ = commands.try_send(Command { event, reply: None });
        }
        let (status_tx, status_rx) = watch::channel(status_of(&machine, 0, None));
        let runner = SwapRunner {
            machine,
            commands: commands_rx,
            status: status_tx,
            outbound: self.outbound.clone(),
            shutdown: self.shutdown.subscribe(),
            clock: self.ctx.clock.clone(),
            backoff: self.ctx.retry.base_delay.max(Duration::from_millis(100)),
            events_handled: 0,
            resync_pending: false,
        };
        let span = info_span!("swap", %swap_id, %role);
        let task = tokio::spawn(runner.run().instrument(span));

        swaps.insert(
            swap_id,
            SwapEntry {
                commands,
                status: status_rx,
                task: Some(task),
            },
        );
        info!(%swap_id, %role, "Swap registered");
        Ok(swap_id)
    }

    async fn sender_for(
        &self,
        swap_id: SwapId,
    ) -> Result<(mpsc::Sender<Command>, watch::Receiver<SwapStatus>), RegistryError> {
        let swaps = self.swaps.read().await;
        let entry = swaps
            .get(&swap_id)
            .ok_or(RegistryError::UnknownSwap(swap_id))?;
        let state = entry.status.borrow().state;
        if state.is_terminal() {
            return Err(RegistryError::Finished { swap_id, state });
        }
        Ok((entry.commands.clone(), entry.status.clone()))
    }

    fn send_outbound(&self, swap_id: SwapId, message: PeerMessage) {
        if self.outbound.send(Outbound { swap_id, message }).is_err() {
            warn!(%swap_id, "Outbound channel closed; dropping peer message");
        }
    }
}

/// The task stopped, either finished or shut down.
fn finished(swap_id: SwapId, status: &watch::Receiver<SwapStatus>) -> RegistryError {
    RegistryError::Finished {
        swap_id,
        state: status.borrow().state,
    }
}

fn status_of(machine: &SwapMachine, events_handled: u64, last_error: Option<String>) -> SwapStatus {
    SwapStatus {
        swap_id: machine.swap_id(),
        role: machine.role(),
        state: machine.state(),
        handle: machine.contract_handle(),
        spend_key_recovered: machine.recovered_spend_key().is_some(),
        events_handled,
        last_error,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Done,
    /// The event itself was not acceptable.
    Rejected,
    /// The environment failed; the swap backs off, then re-reads the chain before acting
    /// on its own again.
    Failed,
}

struct SwapRunner {
    machine: SwapMachine,
    commands: mpsc::Receiver<Command>,
    status: watch::Sender<SwapStatus>,
    outbound: mpsc::UnboundedSender<Outbound>,
    shutdown: watch::Receiver<bool>,
    clock: Arc<dyn Clock>,
    backoff: Duration,
    events_handled: u64,
    resync_pending: bool,
}

impl SwapRunner {
    async fn run(mut self) {
        let mut retry_at: Option<Instant> = None;

        loop {
            if self.machine.state().is_terminal() {
                info!(state = %self.machine.state(), "Swap finished");
                break;
            }

            if retry_at.map_or(true, |at| Instant::now() >= at) {
                if self.resync_pending {
                    self.resync_pending = false;
                    retry_at = match self.apply(SwapEvent::Resync, None).await {
                        Applied::Failed => Some(Instant::now() + self.backoff),
                        Applied::Done | Applied::Rejected => None,
                    };
                    continue;
                }
                if let Some(event) = self.machine.follow_up() {
                    retry_at = match self.apply(event, None).await {
                        Applied::Done => None,
                        Applied::Rejected | Applied::Failed => Some(Instant::now() + self.backoff),
                    };
                    continue;
                }
            }

            let deadline = self.machine.next_deadline();
            let clock = self.clock.clone();
            let fire_deadline = async move {
                match deadline {
                    Some((kind, at)) => {
                        if let Some(retry_at) = retry_at {
                            tokio::time::sleep_until(retry_at).await;
                        }
                        clock.sleep_until(at).await;
                        kind
                    }
                    None => std::future::pending::<DeadlineKind>().await,
                }
            };

            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        debug!("Swap task stopping for shutdown");
                        break;
                    }
                }
                command = self.commands.recv() => {
                    let Some(Command { event, reply }) = command else {
                        break;
                    };
                    if self.apply(event, reply).await == Applied::Failed {
                        retry_at.get_or_insert_with(|| Instant::now() + self.backoff);
                    }
                }
                kind = fire_deadline => {
                    retry_at = None;
                    if self.apply(SwapEvent::Deadline(kind), None).await != Applied::Done {
                        retry_at = Some(Instant::now() + self.backoff);
                    }
                }
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    retry_at = None;
                }
            }
        }
    }

    /// Handles one event and publishes the result.
    async fn apply(
        &mut self,
        event: SwapEvent,
        reply: Option<oneshot::Sender<Result<Step, MachineError>>>,
    ) -> Applied {
        let result = self.machine.handle(event).await;
        self.events_handled += 1;

        let (applied, last_error) = match &result {
            Ok(step) => {
                for message in &step.outbound {
                    let outbound = Outbound {
                        swap_id: self.machine.swap_id(),
                        message: message.clone(),
                    };
                    if self.outbound.send(outbound).is_err() {
                        warn!(kind = message.kind(), "Outbound channel closed; dropping peer message");
                    }
                }
                // Errors stay visible until the swap makes progress.
                let last_error = if step.changed() {
                    None
                } else {
                    self.status.borrow().last_error.clone()
                };
                (Applied::Done, last_error)
            }
            Err(err) if err.is_violation() => (Applied::Rejected, Some(err.to_string())),
            Err(err) => {
                warn!(error = %err, "Swap step failed; chain state will be re-read");
                self.resync_pending = true;
                (Applied::Failed, Some(err.to_string()))
            }
        };

        self.status
            .send_replace(status_of(&self.machine, self.events_handled, last_error));
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
        applied
    }
}
