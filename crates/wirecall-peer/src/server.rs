//! Service registry and dispatch loop.

use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, info, trace, warn};
use wirecall_codec::{Codec, CodecFactory, MessageType};
use wirecall_transport::{MessageBuffer, MessageBufferFactory, Status, Transport, TransportError};

use crate::config::ServerConfig;
use crate::error::{Result, RpcError};
use crate::service::{start_reply, Invocation, Service};

thread_local! {
    static DISPATCH_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Whether the current thread is inside a service handler.
pub(crate) fn in_dispatch() -> bool {
    DISPATCH_DEPTH.with(|depth| depth.get() > 0)
}

struct DispatchGuard;

impl DispatchGuard {
    fn enter() -> Self {
        DISPATCH_DEPTH.with(|depth| depth.set(depth.get() + 1));
        DispatchGuard
    }
}

impl Drop for DispatchGuard {
    fn drop(&mut self) {
        DISPATCH_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Registered services and the logic to dispatch one message to them.
pub struct Server {
    services: RwLock<Vec<Arc<dyn Service>>>,
    codec_factory: Arc<dyn CodecFactory>,
    buffer_factory: Arc<dyn MessageBufferFactory>,
}

impl Server {
    pub fn new(
        codec_factory: Arc<dyn CodecFactory>,
        buffer_factory: Arc<dyn MessageBufferFactory>,
    ) -> Self {
        Self {
            services: RwLock::new(Vec::new()),
            codec_factory,
            buffer_factory,
        }
    }

    /// Register `service`. Service ids must be unique.
    pub fn add_service(&self, service: Arc<dyn Service>) -> Result<()> {
        let id = service.service_id();
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        if services.iter().any(|s| s.service_id() == id) {
            return Err(RpcError::DuplicateService(id));
        }
        services.push(service);
        debug!(service = id, "service registered");
        Ok(())
    }

    pub fn remove_service(&self, id: u32) -> Option<Arc<dyn Service>> {
        let mut services = self.services.write().unwrap_or_else(PoisonError::into_inner);
        let pos = services.iter().position(|s| s.service_id() == id)?;
        Some(services.remove(pos))
    }

    pub fn find_service(&self, id: u32) -> Option<Arc<dyn Service>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|s| s.service_id() == id)
            .cloned()
    }

    pub fn service_count(&self) -> usize {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Receive one message from `transport`, dispatch it, and send the reply
    /// if the call expects one.
    ///
    /// Handler failures are reported to the caller in the reply and do not
    /// fail this call. Messages for unknown services get no reply and return
    /// [`RpcError::UnknownName`].
    pub fn process_message(&self, transport: &dyn Transport) -> Result<()> {
        let mut buffer = self.request_buffer()?;
        if let Err(err) = transport.receive(&mut buffer) {
            self.buffer_factory.dispose(buffer);
            return Err(err.into());
        }
        self.process_received(transport, buffer)
    }

    /// Like [`process_message`](Self::process_message), but never waits for
    /// a call. Returns `Ok(false)` when no call was pending; the transport
    /// may still have consumed a message that was not for this server.
    pub fn try_process_message(&self, transport: &dyn Transport) -> Result<bool> {
        let mut buffer = self.request_buffer()?;
        match transport.try_receive(&mut buffer) {
            Ok(true) => self.process_received(transport, buffer).map(|()| true),
            Ok(false) => {
                self.buffer_factory.dispose(buffer);
                Ok(false)
            }
            Err(err) => {
                self.buffer_factory.dispose(buffer);
                Err(err.into())
            }
        }
    }

    fn request_buffer(&self) -> Result<MessageBuffer> {
        if self.buffer_factory.create_server_buffer() {
            Ok(self.buffer_factory.create()?)
        } else {
            Ok(MessageBuffer::wrap(Vec::new()))
        }
    }

    fn process_received(&self, transport: &dyn Transport, buffer: MessageBuffer) -> Result<()> {
        let mut codec = self
            .codec_factory
            .create(buffer, transport.reserve_header_size())?;
        let outcome = self.dispatch(transport, codec.as_mut());
        self.buffer_factory.dispose(codec.into_buffer());
        outcome
    }

    fn dispatch(&self, transport: &dyn Transport, codec: &mut dyn Codec) -> Result<()> {
        let header = codec.start_read_message()?;
        if !header.message_type.is_request() {
            debug!(
                message_type = %header.message_type,
                sequence = header.sequence,
                "server ignoring non-call message"
            );
            return Ok(());
        }
        let Some(service) = self.find_service(header.service) else {
            warn!(
                service = header.service,
                method = header.method,
                "call to unknown service"
            );
            return Err(RpcError::UnknownName {
                service: header.service,
            });
        };
        trace!(
            service = header.service,
            method = header.method,
            sequence = header.sequence,
            "dispatching"
        );

        let (outcome, reply_started) = {
            let _guard = DispatchGuard::enter();
            let mut invocation = Invocation::new(header, &mut *codec);
            let outcome = service.handle_invocation(&mut invocation);
            (outcome, invocation.reply_started())
        };

        if header.message_type == MessageType::Oneway {
            if let Err(err) = outcome {
                warn!(
                    service = header.service,
                    method = header.method,
                    error = %err,
                    "oneway handler failed"
                );
            }
            return Ok(());
        }

        match outcome {
            Ok(()) if reply_started => {}
            Ok(()) => start_reply(codec, &header, Status::Success.code())?,
            Err(err) => {
                warn!(
                    service = header.service,
                    method = header.method,
                    error = %err,
                    "handler failed"
                );
                start_reply(codec, &header, err.reply_code())?;
            }
        }
        transport.send(codec.buffer_mut())?;
        Ok(())
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("services", &self.service_count())
            .finish_non_exhaustive()
    }
}

/// Cloneable handle that stops a [`SimpleServer`] from another thread.
#[derive(Debug, Clone)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Single-threaded server bound to one transport.
///
/// The transport may be a [`TransportArbitrator`](crate::TransportArbitrator),
/// in which case the server loop also routes replies for local callers.
pub struct SimpleServer {
    server: Server,
    transport: Arc<dyn Transport>,
    config: ServerConfig,
    stopped: Arc<AtomicBool>,
}

impl SimpleServer {
    pub fn new(
        transport: Arc<dyn Transport>,
        codec_factory: Arc<dyn CodecFactory>,
        buffer_factory: Arc<dyn MessageBufferFactory>,
    ) -> Self {
        Self {
            server: Server::new(codec_factory, buffer_factory),
            transport,
            config: ServerConfig::default(),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn add_service(&self, service: Arc<dyn Service>) -> Result<()> {
        self.server.add_service(service)
    }

    pub fn remove_service(&self, id: u32) -> Option<Arc<dyn Service>> {
        self.server.remove_service(id)
    }

    pub fn server(&self) -> &Server {
        &self.server
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Process messages until stopped or the transport fails.
    ///
    /// Receive timeouts are absorbed so a transport with a read timeout lets
    /// the loop observe [`stop`](Self::stop) promptly. Other non-fatal errors
    /// are logged and skipped unless
    /// [`ServerConfig::stop_on_protocol_error`] is set.
    pub fn run(&self) -> Result<()> {
        info!(services = self.server.service_count(), "server running");
        while !self.is_stopped() {
            match self.server.process_message(self.transport.as_ref()) {
                Ok(()) => {}
                Err(RpcError::Transport(TransportError::Timeout)) => {}
                Err(err) if err.is_fatal() => {
                    warn!(error = %err, "transport failed; server stopping");
                    self.stop();
                    return Err(err);
                }
                Err(err) if self.config.stop_on_protocol_error => {
                    warn!(error = %err, "server stopping on error");
                    return Err(err);
                }
                Err(err) => warn!(error = %err, "message dropped"),
            }
        }
        info!("server stopped");
        Ok(())
    }

    /// Process at most one message without blocking when none is pending.
    ///
    /// Returns whether a call was dispatched. Over a
    /// [`TransportArbitrator`](crate::TransportArbitrator) a poll that only
    /// routes a reply returns `Ok(false)`, as does a poll while another
    /// thread owns the arbitrator's receive side.
    pub fn poll(&self) -> Result<bool> {
        if self.is_stopped() {
            return Err(RpcError::ServerIsDown);
        }
        self.server.try_process_message(self.transport.as_ref())
    }

    /// Ask [`run`](Self::run) to return after the current message.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle(Arc::clone(&self.stopped))
    }
}

impl std::fmt::Debug for SimpleServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleServer")
            .field("server", &self.server)
            .field("config", &self.config)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}
