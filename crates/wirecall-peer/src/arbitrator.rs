//! Reply arbitration for peers that both call and serve over one transport.
//!
//! Callers register a pending slot keyed by sequence number *before* sending
//! their request. Whichever thread owns the shared receive (a server's run
//! loop or a [`ReceivePump`](crate::ReceivePump)) hands replies to the
//! matching slot and returns invocations to its caller. Callers never touch
//! the shared transport's receive side themselves.
//!
//! Lock order: client list, then slot. A slot lock is never held while
//! acquiring the list lock.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};
use wirecall_codec::{CodecError, CodecFactory, MessageHeader, MessageType};
use wirecall_transport::{MessageBuffer, MessageBufferFactory, Transport, TransportError};

use crate::config::ArbitratorConfig;
use crate::error::{Result, RpcError};

/// Handle to a reserved pending-client slot.
///
/// Obtained from [`TransportArbitrator::create_pending_client`] and given back
/// through [`TransportArbitrator::release_pending_client`] or
/// [`TransportArbitrator::client_receive`].
#[derive(Debug)]
#[must_use = "a pending client holds a slot until released"]
pub struct PendingClient {
    index: usize,
    generation: u64,
}

impl PendingClient {
    /// Slot index, for diagnostics.
    pub fn index(&self) -> usize {
        self.index
    }
}

enum Phase {
    Idle,
    Awaiting,
    Delivered(MessageBuffer),
    Failed(TransportError),
}

struct SlotState {
    generation: u64,
    sequence: u32,
    phase: Phase,
}

struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Slot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState {
                generation: 0,
                sequence: 0,
                phase: Phase::Idle,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct ClientList {
    free: Vec<usize>,
    /// Registered `(slot, sequence)` pairs awaiting a reply.
    active: Vec<(usize, u32)>,
    /// Set once the shared transport fails; no caller can be registered after.
    closed: Option<TransportError>,
}

/// Outcome of reading one message from the shared transport.
enum Routed {
    /// An invocation or oneway call is left in the buffer.
    Invocation,
    /// The message was a reply, a notification or undecodable, and was
    /// handled here.
    Consumed,
}

/// Demultiplexes replies from requests on a shared transport.
pub struct TransportArbitrator {
    shared: Arc<dyn Transport>,
    codec_factory: Arc<dyn CodecFactory>,
    buffer_factory: Arc<dyn MessageBufferFactory>,
    slots: Box<[Slot]>,
    clients: Mutex<ClientList>,
    receive_lock: Mutex<()>,
    dropped_replies: AtomicU64,
    pump_attached: AtomicBool,
}

impl TransportArbitrator {
    pub fn new(
        shared: Arc<dyn Transport>,
        codec_factory: Arc<dyn CodecFactory>,
        buffer_factory: Arc<dyn MessageBufferFactory>,
    ) -> Self {
        Self::with_config(
            shared,
            codec_factory,
            buffer_factory,
            ArbitratorConfig::default(),
        )
    }

    pub fn with_config(
        shared: Arc<dyn Transport>,
        codec_factory: Arc<dyn CodecFactory>,
        buffer_factory: Arc<dyn MessageBufferFactory>,
        config: ArbitratorConfig,
    ) -> Self {
        let capacity = config.max_pending_clients;
        let slots = (0..capacity).map(|_| Slot::new()).collect();
        Self {
            shared,
            codec_factory,
            buffer_factory,
            slots,
            clients: Mutex::new(ClientList {
                // Popped from the back, so slot 0 is handed out first.
                free: (0..capacity).rev().collect(),
                active: Vec::with_capacity(capacity),
                closed: None,
            }),
            receive_lock: Mutex::new(()),
            dropped_replies: AtomicU64::new(0),
            pump_attached: AtomicBool::new(false),
        }
    }

    pub fn codec_factory(&self) -> &Arc<dyn CodecFactory> {
        &self.codec_factory
    }

    pub fn buffer_factory(&self) -> &Arc<dyn MessageBufferFactory> {
        &self.buffer_factory
    }

    /// Total number of pending-client slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of callers currently registered for a reply.
    pub fn pending_count(&self) -> usize {
        self.lock_clients().active.len()
    }

    /// Number of slots not handed out.
    pub fn free_count(&self) -> usize {
        self.lock_clients().free.len()
    }

    /// Replies that matched no registered caller.
    pub fn dropped_replies(&self) -> u64 {
        self.dropped_replies.load(Ordering::Relaxed)
    }

    /// The fatal error that closed the shared transport, if any.
    ///
    /// Once set, registering a caller fails with this error.
    pub fn closed_error(&self) -> Option<TransportError> {
        self.lock_clients().closed.as_ref().map(fan_out_error)
    }

    pub fn is_closed(&self) -> bool {
        self.lock_clients().closed.is_some()
    }

    /// Whether a [`ReceivePump`](crate::ReceivePump) drives this arbitrator.
    pub fn has_pump(&self) -> bool {
        self.pump_attached.load(Ordering::Acquire)
    }

    pub(crate) fn set_pump_attached(&self, attached: bool) {
        self.pump_attached.store(attached, Ordering::Release);
    }

    /// Reserve a slot from the free stack.
    pub fn create_pending_client(&self) -> Result<PendingClient> {
        let mut clients = self.lock_clients();
        let index = clients.free.pop().ok_or(RpcError::PendingListFull {
            capacity: self.slots.len(),
        })?;
        let mut state = self.slots[index].lock();
        state.phase = Phase::Idle;
        Ok(PendingClient {
            index,
            generation: state.generation,
        })
    }

    /// Register `client` as waiting for the reply with `sequence`.
    pub fn add_pending_client(&self, client: &PendingClient, sequence: u32) -> Result<()> {
        let mut clients = self.lock_clients();
        if let Some(err) = &clients.closed {
            return Err(RpcError::Transport(fan_out_error(err)));
        }
        let mut state = self.slots[client.index].lock();
        if state.generation != client.generation {
            return Err(RpcError::InvalidArgument(
                "pending client was already released".into(),
            ));
        }
        if matches!(state.phase, Phase::Awaiting) {
            clients.active.retain(|&(index, _)| index != client.index);
        }
        state.sequence = sequence;
        state.phase = Phase::Awaiting;
        clients.active.push((client.index, sequence));
        trace!(slot = client.index, sequence, "pending client registered");
        Ok(())
    }

    /// Deregister `client`. A reply delivered but not yet collected is
    /// returned to the buffer factory.
    pub fn remove_pending_client(&self, client: &PendingClient) {
        let mut clients = self.lock_clients();
        let mut state = self.slots[client.index].lock();
        if state.generation != client.generation {
            return;
        }
        clients.active.retain(|&(index, _)| index != client.index);
        if let Phase::Delivered(buffer) = std::mem::replace(&mut state.phase, Phase::Idle) {
            self.buffer_factory.dispose(buffer);
        }
    }

    /// Deregister `client` and return its slot to the free stack.
    pub fn release_pending_client(&self, client: PendingClient) {
        self.remove_pending_client(&client);
        let mut clients = self.lock_clients();
        let mut state = self.slots[client.index].lock();
        if state.generation != client.generation {
            return;
        }
        state.generation = state.generation.wrapping_add(1);
        state.phase = Phase::Idle;
        clients.free.push(client.index);
    }

    /// Reclaim every slot. Callers still waiting fail with
    /// [`TransportError::ConnectionClosed`]; their handles become stale.
    pub fn free_client_list(&self) {
        let mut clients = self.lock_clients();
        clients.active.clear();
        let mut reclaimed = 0usize;
        for (index, slot) in self.slots.iter().enumerate() {
            if clients.free.contains(&index) {
                continue;
            }
            let mut state = slot.lock();
            state.generation = state.generation.wrapping_add(1);
            if let Phase::Delivered(buffer) = std::mem::replace(&mut state.phase, Phase::Idle) {
                self.buffer_factory.dispose(buffer);
            }
            drop(state);
            slot.ready.notify_all();
            clients.free.push(index);
            reclaimed += 1;
        }
        if reclaimed > 0 {
            debug!(reclaimed, "pending client list freed");
        }
    }

    /// Reserve and register a slot for `sequence`. Call before sending the
    /// request so a fast reply cannot arrive unmatched.
    pub fn prepare_client_receive(&self, sequence: u32) -> Result<PendingClient> {
        let client = self.create_pending_client()?;
        if let Err(err) = self.add_pending_client(&client, sequence) {
            self.release_pending_client(client);
            return Err(err);
        }
        Ok(client)
    }

    /// Wait for the reply registered under `client`.
    ///
    /// The slot is released on every path. On timeout the caller is
    /// deregistered before returning, so a late reply is dropped rather than
    /// delivered to a slot that has been reused.
    pub fn client_receive(
        &self,
        client: PendingClient,
        timeout: Option<Duration>,
    ) -> Result<MessageBuffer> {
        let slot = &self.slots[client.index];
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = slot.lock();
        loop {
            if state.generation != client.generation {
                return Err(RpcError::Transport(TransportError::ConnectionClosed));
            }
            match std::mem::replace(&mut state.phase, Phase::Idle) {
                Phase::Delivered(buffer) => {
                    drop(state);
                    self.release_pending_client(client);
                    return Ok(buffer);
                }
                Phase::Failed(err) => {
                    drop(state);
                    self.release_pending_client(client);
                    return Err(err.into());
                }
                Phase::Idle => {
                    drop(state);
                    self.release_pending_client(client);
                    return Err(RpcError::InvalidArgument(
                        "pending client was never registered".into(),
                    ));
                }
                Phase::Awaiting => state.phase = Phase::Awaiting,
            }
            state = match deadline {
                None => slot.ready.wait(state).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        drop(state);
                        return self.expire(client);
                    }
                    slot.ready
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
    }

    fn expire(&self, client: PendingClient) -> Result<MessageBuffer> {
        let mut clients = self.lock_clients();
        let mut state = self.slots[client.index].lock();
        if state.generation != client.generation {
            return Err(RpcError::Transport(TransportError::ConnectionClosed));
        }
        clients.active.retain(|&(index, _)| index != client.index);
        let sequence = state.sequence;
        let phase = std::mem::replace(&mut state.phase, Phase::Idle);
        drop(state);
        drop(clients);
        self.release_pending_client(client);
        match phase {
            // Delivered between the wakeup and deregistration: still ours.
            Phase::Delivered(buffer) => Ok(buffer),
            Phase::Failed(err) => Err(err.into()),
            Phase::Idle | Phase::Awaiting => {
                debug!(sequence, "reply wait timed out");
                Err(RpcError::Timeout)
            }
        }
    }

    /// Hand a reply to the caller registered for `sequence`. On success the
    /// caller owns the received buffer and `message` is replaced with a
    /// fresh one from the buffer factory.
    fn deliver_reply(&self, sequence: u32, message: &mut MessageBuffer) -> bool {
        let mut clients = self.lock_clients();
        let Some(pos) = clients.active.iter().position(|&(_, seq)| seq == sequence) else {
            drop(clients);
            let dropped = self.dropped_replies.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(sequence, dropped, "dropping reply with no pending caller");
            return false;
        };
        let (index, _) = clients.active.swap_remove(pos);
        let slot = &self.slots[index];
        let mut state = slot.lock();
        state.phase = match self.buffer_factory.create() {
            Ok(fresh) => Phase::Delivered(std::mem::replace(message, fresh)),
            Err(err) => Phase::Failed(TransportError::Buffer(err)),
        };
        drop(state);
        drop(clients);
        slot.ready.notify_one();
        trace!(sequence, slot = index, "reply delivered");
        true
    }

    /// Mark the shared transport closed and wake every registered caller
    /// with an error derived from `err`.
    fn fail_all(&self, err: &TransportError) {
        let mut clients = self.lock_clients();
        if clients.closed.is_none() {
            clients.closed = Some(fan_out_error(err));
        }
        let failed = clients.active.len();
        for (index, _) in clients.active.drain(..) {
            let slot = &self.slots[index];
            slot.lock().phase = Phase::Failed(fan_out_error(err));
            slot.ready.notify_one();
        }
        if failed > 0 {
            warn!(failed, error = %err, "shared transport failed; pending callers woken");
        }
    }

    /// Read one message from the shared transport and route it. The caller
    /// holds `receive_lock`.
    fn receive_one(&self, message: &mut MessageBuffer) -> wirecall_transport::Result<Routed> {
        if let Err(err) = self.shared.receive(message) {
            if err.is_fatal() {
                self.fail_all(&err);
            }
            return Err(err);
        }
        let header = match self.peek_header(message) {
            Ok(header) => header,
            Err(err) => {
                warn!(error = %err, "discarding undecodable message");
                return Ok(Routed::Consumed);
            }
        };
        match header.message_type {
            MessageType::Invocation | MessageType::Oneway => Ok(Routed::Invocation),
            MessageType::Reply => {
                self.deliver_reply(header.sequence, message);
                Ok(Routed::Consumed)
            }
            MessageType::Notification => {
                debug!(service = header.service, "ignoring notification");
                Ok(Routed::Consumed)
            }
        }
    }

    fn peek_header(
        &self,
        message: &mut MessageBuffer,
    ) -> std::result::Result<MessageHeader, CodecError> {
        let owned = std::mem::replace(message, MessageBuffer::wrap(Vec::new()));
        let mut codec = self
            .codec_factory
            .create(owned, self.shared.reserve_header_size())?;
        let header = codec.start_read_message();
        *message = codec.into_buffer();
        header
    }

    fn lock_clients(&self) -> MutexGuard<'_, ClientList> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn fan_out_error(err: &TransportError) -> TransportError {
    match err {
        TransportError::ConnectionClosed => TransportError::ConnectionClosed,
        TransportError::Timeout => TransportError::Timeout,
        other => TransportError::ReceiveFailed(other.to_string()),
    }
}

impl Transport for TransportArbitrator {
    fn send(&self, message: &mut MessageBuffer) -> wirecall_transport::Result<()> {
        self.shared.send(message)
    }

    /// Receive until an invocation or oneway call arrives, routing replies to
    /// their callers along the way. Notifications are discarded.
    fn receive(&self, message: &mut MessageBuffer) -> wirecall_transport::Result<()> {
        let _receiver = self
            .receive_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if let Routed::Invocation = self.receive_one(message)? {
                return Ok(());
            }
        }
    }

    /// Route at most one pending message. Returns `Ok(true)` only when an
    /// invocation or oneway call is left in `message`.
    ///
    /// Never waits: if another thread owns the shared receive, or nothing is
    /// pending, this returns `Ok(false)` at once.
    fn try_receive(&self, message: &mut MessageBuffer) -> wirecall_transport::Result<bool> {
        let _receiver = match self.receive_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Ok(false),
        };
        if !self.shared.has_message() {
            return Ok(false);
        }
        Ok(matches!(self.receive_one(message)?, Routed::Invocation))
    }

    fn has_message(&self) -> bool {
        self.shared.has_message()
    }

    fn reserve_header_size(&self) -> usize {
        self.shared.reserve_header_size()
    }
}

impl std::fmt::Debug for TransportArbitrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportArbitrator")
            .field("capacity", &self.slots.len())
            .field("pending", &self.pending_count())
            .field("dropped_replies", &self.dropped_replies())
            .finish_non_exhaustive()
    }
}
