//! Request lifecycle for outgoing calls.
//!
//! A call is built in a [`RequestContext`], sent and answered by
//! [`ClientManager::perform_request`], and read back from the same context.
//! Dropping the context returns its buffer to the factory on every path.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, trace};
use wirecall_codec::{Codec, CodecError, CodecFactory, MessageHeader, MessageType};
use wirecall_transport::{MessageBufferFactory, Status, Transport};

use crate::arbitrator::TransportArbitrator;
use crate::config::ClientConfig;
use crate::error::{Result, RpcError};
use crate::server::in_dispatch;

/// Details passed to the error handler when a call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallFailure {
    pub status: Status,
    pub service: u32,
    pub method: u32,
    pub sequence: u32,
}

/// Hook observing every failed call before the error is returned.
pub type ErrorHandler = Arc<dyn Fn(&CallFailure) + Send + Sync>;

/// One outgoing call: its header and the codec holding its buffer.
pub struct RequestContext {
    header: MessageHeader,
    codec: Box<dyn Codec>,
    buffer_factory: Arc<dyn MessageBufferFactory>,
}

impl RequestContext {
    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn is_oneway(&self) -> bool {
        self.header.message_type == MessageType::Oneway
    }

    /// Codec for writing arguments, and after a successful
    /// [`perform_request`](ClientManager::perform_request) for reading results.
    pub fn codec(&mut self) -> &mut dyn Codec {
        self.codec.as_mut()
    }
}

impl Drop for RequestContext {
    fn drop(&mut self) {
        self.buffer_factory.dispose(self.codec.take_buffer());
    }
}

impl std::fmt::Debug for RequestContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestContext")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

enum Route {
    /// Exclusive transport; each exchange holds the lock from send to reply.
    Direct {
        transport: Arc<dyn Transport>,
        exchange: Mutex<()>,
    },
    Arbitrated(Arc<TransportArbitrator>),
}

/// Issues calls over a transport.
///
/// Built with [`new`](Self::new) it owns the transport's receive side and
/// serializes calls. Built with [`arbitrated`](Self::arbitrated) it shares the
/// transport with a server or [`ReceivePump`](crate::ReceivePump) and many
/// calls may be outstanding at once.
pub struct ClientManager {
    route: Route,
    codec_factory: Arc<dyn CodecFactory>,
    buffer_factory: Arc<dyn MessageBufferFactory>,
    sequence: AtomicU32,
    config: ClientConfig,
    error_handler: Option<ErrorHandler>,
}

impl ClientManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        codec_factory: Arc<dyn CodecFactory>,
        buffer_factory: Arc<dyn MessageBufferFactory>,
    ) -> Self {
        Self {
            route: Route::Direct {
                transport,
                exchange: Mutex::new(()),
            },
            codec_factory,
            buffer_factory,
            sequence: AtomicU32::new(0),
            config: ClientConfig::default(),
            error_handler: None,
        }
    }

    /// Client sharing `arbitrator`'s transport and factories.
    pub fn arbitrated(arbitrator: Arc<TransportArbitrator>) -> Self {
        Self {
            codec_factory: Arc::clone(arbitrator.codec_factory()),
            buffer_factory: Arc::clone(arbitrator.buffer_factory()),
            route: Route::Arbitrated(arbitrator),
            sequence: AtomicU32::new(0),
            config: ClientConfig::default(),
            error_handler: None,
        }
    }

    pub fn with_config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_error_handler(
        mut self,
        handler: impl Fn(&CallFailure) + Send + Sync + 'static,
    ) -> Self {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_arbitrated(&self) -> bool {
        matches!(self.route, Route::Arbitrated(_))
    }

    fn transport(&self) -> &dyn Transport {
        match &self.route {
            Route::Direct { transport, .. } => transport.as_ref(),
            Route::Arbitrated(arbitrator) => arbitrator.as_ref(),
        }
    }

    fn next_sequence(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }

    /// Start a call: obtain a buffer and write the message header.
    pub fn create_request(
        &self,
        service: u32,
        method: u32,
        oneway: bool,
    ) -> Result<RequestContext> {
        let message_type = if oneway {
            MessageType::Oneway
        } else {
            MessageType::Invocation
        };
        let header = MessageHeader::new(message_type, service, method, self.next_sequence());
        let buffer = self.buffer_factory.create()?;
        let codec = self
            .codec_factory
            .create(buffer, self.transport().reserve_header_size())?;
        let mut request = RequestContext {
            header,
            codec,
            buffer_factory: Arc::clone(&self.buffer_factory),
        };
        request.codec.start_write_message(&header)?;
        Ok(request)
    }

    /// Send the request and, unless it is oneway, wait for its reply.
    ///
    /// On success the context's codec is positioned at the reply's results.
    /// On failure the error handler sees the failure before it is returned.
    pub fn perform_request(&self, request: &mut RequestContext) -> Result<()> {
        let outcome = self.exchange(request);
        if let Err(err) = &outcome {
            let failure = CallFailure {
                status: err.status(),
                service: request.header.service,
                method: request.header.method,
                sequence: request.header.sequence,
            };
            debug!(
                service = failure.service,
                method = failure.method,
                sequence = failure.sequence,
                error = %err,
                "call failed"
            );
            if let Some(handler) = &self.error_handler {
                handler(&failure);
            }
        }
        outcome
    }

    /// Return the request's buffer to the factory.
    pub fn release_request(&self, request: RequestContext) {
        drop(request);
    }

    /// Build, perform and return a call in one step.
    pub fn call(
        &self,
        service: u32,
        method: u32,
        args: impl FnOnce(&mut dyn Codec) -> std::result::Result<(), CodecError>,
    ) -> Result<RequestContext> {
        let mut request = self.create_request(service, method, false)?;
        args(request.codec())?;
        self.perform_request(&mut request)?;
        Ok(request)
    }

    /// Send a oneway call.
    pub fn notify(
        &self,
        service: u32,
        method: u32,
        args: impl FnOnce(&mut dyn Codec) -> std::result::Result<(), CodecError>,
    ) -> Result<()> {
        let mut request = self.create_request(service, method, true)?;
        args(request.codec())?;
        self.perform_request(&mut request)
    }

    fn exchange(&self, request: &mut RequestContext) -> Result<()> {
        let oneway = request.is_oneway();
        let sequence = request.sequence();
        trace!(
            service = request.header.service,
            method = request.header.method,
            sequence,
            oneway,
            "sending request"
        );
        match &self.route {
            Route::Direct {
                transport,
                exchange,
            } => {
                let _exchange = exchange.lock().unwrap_or_else(PoisonError::into_inner);
                transport.send(request.codec.buffer_mut())?;
                if oneway {
                    return Ok(());
                }
                let mut buffer = request.codec.take_buffer();
                let received = transport.receive(&mut buffer);
                let old = request
                    .codec
                    .set_buffer(buffer, transport.reserve_header_size())?;
                self.buffer_factory.dispose(old);
                received?;
            }
            Route::Arbitrated(arbitrator) => {
                if oneway {
                    arbitrator.send(request.codec.buffer_mut())?;
                    return Ok(());
                }
                if self.config.nested_call_detection && in_dispatch() && !arbitrator.has_pump() {
                    return Err(RpcError::NestedCallFailure);
                }
                let pending = arbitrator.prepare_client_receive(sequence)?;
                if let Err(err) = arbitrator.send(request.codec.buffer_mut()) {
                    arbitrator.release_pending_client(pending);
                    return Err(err.into());
                }
                let reply = arbitrator.client_receive(pending, self.config.reply_timeout)?;
                let old = request
                    .codec
                    .set_buffer(reply, arbitrator.reserve_header_size())?;
                self.buffer_factory.dispose(old);
            }
        }
        read_reply_status(request.codec.as_mut(), sequence)
    }
}

fn read_reply_status(codec: &mut dyn Codec, sequence: u32) -> Result<()> {
    let header = codec.start_read_message()?;
    if header.message_type != MessageType::Reply || header.sequence != sequence {
        return Err(RpcError::ExpectedReply {
            expected: sequence,
            found: header.sequence,
            message_type: header.message_type,
        });
    }
    let code = codec.read_u32()?;
    let status = Status::from_code(code);
    if status.is_success() {
        Ok(())
    } else {
        Err(RpcError::Remote { status, code })
    }
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("arbitrated", &self.is_arbitrated())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    use wirecall_codec::BasicCodecFactory;
    use wirecall_frame::{memory_pair, FrameConfig};
    use wirecall_transport::{
        DynamicBufferFactory, MemoryTransport, MessageBuffer, PooledBufferFactory,
    };

    use super::*;
    use crate::{Invocation, ReceivePump, Service, SimpleServer};

    const ECHO: u32 = 1;

    struct Echo;

    impl Service for Echo {
        fn service_id(&self) -> u32 {
            ECHO
        }

        fn handle_invocation(&self, invocation: &mut Invocation<'_>) -> Result<()> {
            match invocation.method() {
                1 => {
                    let value = invocation.args().read_i32()?;
                    invocation.begin_reply()?.write_i32(value)?;
                    Ok(())
                }
                2 => Err(RpcError::InvalidArgument("no".into())),
                _ => Ok(()),
            }
        }
    }

    fn factories() -> (Arc<dyn CodecFactory>, Arc<dyn MessageBufferFactory>) {
        (
            Arc::new(BasicCodecFactory),
            Arc::new(DynamicBufferFactory::new(256)),
        )
    }

    fn arbitrated_client(
        transport: MemoryTransport,
    ) -> (ClientManager, Arc<TransportArbitrator>) {
        let (codecs, buffers) = factories();
        let arbitrator = Arc::new(TransportArbitrator::new(
            Arc::new(transport.with_receive_timeout(Duration::from_millis(20))),
            codecs,
            buffers,
        ));
        (ClientManager::arbitrated(Arc::clone(&arbitrator)), arbitrator)
    }

    /// Read one request from `remote`, returning its header and first i32 argument.
    fn take_request(remote: &MemoryTransport) -> (MessageHeader, i32) {
        let mut buffer = MessageBuffer::with_capacity(256).unwrap();
        remote.receive(&mut buffer).unwrap();
        let mut codec = BasicCodecFactory.create(buffer, 0).unwrap();
        let header = codec.start_read_message().unwrap();
        (header, codec.read_i32().unwrap())
    }

    fn send_reply(
        remote: &MemoryTransport,
        request: &MessageHeader,
        status: Status,
        value: i32,
    ) {
        let mut codec = BasicCodecFactory
            .create(MessageBuffer::with_capacity(256).unwrap(), 0)
            .unwrap();
        codec.start_write_message(&request.reply()).unwrap();
        codec.write_u32(status.code()).unwrap();
        codec.write_i32(value).unwrap();
        remote.send(codec.buffer_mut()).unwrap();
    }

    #[test]
    fn direct_call_over_framed_link() {
        let (client_end, server_end) = memory_pair(FrameConfig::default());
        let (codecs, buffers) = factories();
        let server = SimpleServer::new(
            Arc::new(server_end),
            Arc::clone(&codecs),
            Arc::clone(&buffers),
        );
        server.add_service(Arc::new(Echo)).unwrap();
        let worker = thread::spawn(move || server.run());

        let client = ClientManager::new(Arc::new(client_end), codecs, buffers);
        for value in [7, -3, i32::MAX] {
            let mut reply = client.call(ECHO, 1, |c| c.write_i32(value)).unwrap();
            assert_eq!(reply.codec().read_i32().unwrap(), value);
        }

        drop(client);
        assert!(worker.join().unwrap().unwrap_err().is_fatal());
    }

    #[test]
    fn sequence_numbers_increase() {
        let (local, _remote) = MemoryTransport::pair();
        let (codecs, buffers) = factories();
        let client = ClientManager::new(Arc::new(local), codecs, buffers);
        let a = client.create_request(ECHO, 1, false).unwrap();
        let b = client.create_request(ECHO, 1, false).unwrap();
        assert_eq!(b.sequence(), a.sequence() + 1);
    }

    #[test]
    fn remote_status_reaches_error_handler() {
        let (local, remote) = MemoryTransport::pair();
        let (codecs, buffers) = factories();
        let failures = Arc::new(Mutex::new(Vec::new()));
        let client = ClientManager::new(Arc::new(local), codecs, buffers).with_error_handler({
            let failures = Arc::clone(&failures);
            move |failure: &CallFailure| failures.lock().unwrap().push(*failure)
        });

        let responder = thread::spawn(move || {
            let (header, _) = take_request(&remote);
            send_reply(&remote, &header, Status::InvalidArgument, 0);
            remote
        });
        let err = client.call(ECHO, 2, |c| c.write_i32(0)).unwrap_err();
        assert!(matches!(
            err,
            RpcError::Remote {
                status: Status::InvalidArgument,
                code: 4
            }
        ));
        let _remote = responder.join().unwrap();

        let failures = failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].status, Status::InvalidArgument);
        assert_eq!((failures[0].service, failures[0].method), (ECHO, 2));
    }

    #[test]
    fn mismatched_reply_is_rejected() {
        let (local, remote) = MemoryTransport::pair();
        let (codecs, buffers) = factories();
        let client = ClientManager::new(Arc::new(local), codecs, buffers);
        let responder = thread::spawn(move || {
            let (mut header, _) = take_request(&remote);
            header.sequence = header.sequence.wrapping_add(100);
            send_reply(&remote, &header, Status::Success, 0);
            remote
        });
        let err = client.call(ECHO, 1, |c| c.write_i32(1)).unwrap_err();
        assert!(matches!(err, RpcError::ExpectedReply { .. }));
        let _remote = responder.join().unwrap();
    }

    #[test]
    fn oneway_returns_without_reply() {
        let (local, remote) = MemoryTransport::pair();
        let (codecs, buffers) = factories();
        let client = ClientManager::new(Arc::new(local), codecs, buffers);
        client.notify(ECHO, 3, |c| c.write_i32(5)).unwrap();
        let (header, value) = take_request(&remote);
        assert_eq!(header.message_type, MessageType::Oneway);
        assert_eq!(value, 5);
    }

    #[test]
    fn dropped_request_returns_buffer() {
        let (local, _remote) = MemoryTransport::pair();
        let pool = Arc::new(PooledBufferFactory::new(2, 128).unwrap());
        let client =
            ClientManager::new(Arc::new(local), Arc::new(BasicCodecFactory), pool.clone());
        let request = client.create_request(ECHO, 1, false).unwrap();
        assert_eq!(pool.available(), 1);
        client.release_request(request);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn arbitrated_replies_out_of_order() {
        let (local, remote) = MemoryTransport::pair();
        let (client, arbitrator) = arbitrated_client(local);
        let client = Arc::new(client);
        let pump = ReceivePump::spawn(Arc::clone(&arbitrator)).unwrap();

        let callers: Vec<_> = [100, 200]
            .into_iter()
            .map(|value| {
                let client = Arc::clone(&client);
                thread::spawn(move || {
                    let mut reply = client.call(ECHO, 1, |c| c.write_i32(value)).unwrap();
                    (value, reply.codec().read_i32().unwrap())
                })
            })
            .collect();

        let first = take_request(&remote);
        let second = take_request(&remote);
        send_reply(&remote, &second.0, Status::Success, second.1);
        send_reply(&remote, &first.0, Status::Success, first.1);

        for caller in callers {
            let (sent, received) = caller.join().unwrap();
            assert_eq!(sent, received);
        }
        assert_eq!(arbitrator.pending_count(), 0);
        pump.shutdown();
    }

    #[test]
    fn arbitrated_timeout_frees_slot() {
        let (local, remote) = MemoryTransport::pair();
        let (client, arbitrator) = arbitrated_client(local);
        let client = client.with_config(ClientConfig {
            reply_timeout: Some(Duration::from_millis(30)),
            ..ClientConfig::default()
        });
        let pump = ReceivePump::spawn(Arc::clone(&arbitrator)).unwrap();

        let err = client.call(ECHO, 1, |c| c.write_i32(1)).unwrap_err();
        assert!(matches!(err, RpcError::Timeout));
        assert_eq!(arbitrator.pending_count(), 0);
        assert_eq!(arbitrator.free_count(), arbitrator.capacity());

        let (header, value) = take_request(&remote);
        send_reply(&remote, &header, Status::Success, value);
        while arbitrator.dropped_replies() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        pump.shutdown();
    }

    #[test]
    fn arbitrated_callers_fail_when_link_closes() {
        let (local, remote) = MemoryTransport::pair();
        let (client, arbitrator) = arbitrated_client(local);
        let client = Arc::new(client);
        let pump = ReceivePump::spawn(Arc::clone(&arbitrator)).unwrap();

        let caller = {
            let client = Arc::clone(&client);
            thread::spawn(move || client.call(ECHO, 1, |c| c.write_i32(1)).map(|_| ()))
        };
        let _ = take_request(&remote);
        drop(remote);

        let err = caller.join().unwrap().unwrap_err();
        assert!(err.is_fatal(), "{err}");
        pump.shutdown();
    }

    #[test]
    fn nested_call_on_receiving_thread_is_rejected() {
        struct Relay {
            client: Arc<ClientManager>,
            attempts: AtomicUsize,
        }

        impl Service for Relay {
            fn service_id(&self) -> u32 {
                7
            }

            fn handle_invocation(&self, _invocation: &mut Invocation<'_>) -> Result<()> {
                self.attempts.fetch_add(1, Ordering::SeqCst);
                self.client.call(ECHO, 1, |c| c.write_i32(1)).map(|_| ())
            }
        }

        let (local, remote) = MemoryTransport::pair();
        let (client, arbitrator) = arbitrated_client(local);
        let (codecs, buffers) = factories();
        let server = SimpleServer::new(arbitrator.clone(), codecs, buffers);
        let relay = Arc::new(Relay {
            client: Arc::new(client),
            attempts: AtomicUsize::new(0),
        });
        server.add_service(relay.clone()).unwrap();

        let mut codec = BasicCodecFactory
            .create(MessageBuffer::with_capacity(64).unwrap(), 0)
            .unwrap();
        let request = MessageHeader::new(MessageType::Invocation, 7, 0, 1);
        codec.start_write_message(&request).unwrap();
        remote.send(codec.buffer_mut()).unwrap();

        assert!(server.poll().unwrap());
        assert_eq!(relay.attempts.load(Ordering::SeqCst), 1);

        let mut buffer = MessageBuffer::with_capacity(64).unwrap();
        remote.receive(&mut buffer).unwrap();
        let mut reply = BasicCodecFactory.create(buffer, 0).unwrap();
        assert_eq!(reply.start_read_message().unwrap().sequence, 1);
        assert_eq!(reply.read_u32().unwrap(), Status::NestedCallFailure.code());
        // Nothing was sent for the rejected nested call.
        assert!(!remote.has_message());
    }
}
