//! Background receive loop for client-only arbitrated peers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, info, warn};
use wirecall_transport::{Transport, TransportError};

use crate::arbitrator::TransportArbitrator;
use crate::error::Result;

/// Thread that owns the shared receive of a [`TransportArbitrator`] when no
/// server does.
///
/// Replies are routed to waiting callers. Incoming calls are logged and
/// discarded. The loop ends when the transport fails fatally or after
/// [`shutdown`](Self::shutdown); a blocked receive only returns once the
/// transport delivers, times out or closes.
#[derive(Debug)]
pub struct ReceivePump {
    arbitrator: Arc<TransportArbitrator>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ReceivePump {
    pub fn spawn(arbitrator: Arc<TransportArbitrator>) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        arbitrator.set_pump_attached(true);
        let spawned = thread::Builder::new()
            .name("wirecall-pump".into())
            .spawn({
                let arbitrator = Arc::clone(&arbitrator);
                let stop = Arc::clone(&stop);
                move || pump(&arbitrator, &stop)
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(err) => {
                arbitrator.set_pump_attached(false);
                return Err(TransportError::Io(err).into());
            }
        };
        info!("receive pump started");
        Ok(Self {
            arbitrator,
            stop,
            handle: Some(handle),
        })
    }

    /// Whether the loop is still receiving.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the loop, wait for it, and fail any caller still waiting.
    pub fn shutdown(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("receive pump panicked");
            }
        }
        self.arbitrator.set_pump_attached(false);
        self.arbitrator.free_client_list();
    }
}

impl Drop for ReceivePump {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

fn pump(arbitrator: &TransportArbitrator, stop: &AtomicBool) {
    let factory = Arc::clone(arbitrator.buffer_factory());
    while !stop.load(Ordering::Acquire) {
        let mut buffer = match factory.create() {
            Ok(buffer) => buffer,
            Err(err) => {
                warn!(error = %err, "receive pump could not obtain a buffer");
                break;
            }
        };
        let outcome = arbitrator.receive(&mut buffer);
        factory.dispose(buffer);
        match outcome {
            Ok(()) => warn!("dropping incoming call: no server attached"),
            Err(TransportError::Timeout) => {}
            Err(err) if err.is_fatal() => {
                debug!(error = %err, "receive pump exiting");
                break;
            }
            Err(err) => warn!(error = %err, "receive failed"),
        }
    }
    arbitrator.set_pump_attached(false);
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use wirecall_codec::{BasicCodecFactory, CodecFactory, MessageHeader, MessageType};
    use wirecall_transport::{
        DynamicBufferFactory, MemoryTransport, MessageBuffer, Transport, TransportError,
    };

    use super::*;

    fn reply(sequence: u32) -> MessageBuffer {
        let mut codec = BasicCodecFactory
            .create(MessageBuffer::with_capacity(64).unwrap(), 0)
            .unwrap();
        codec
            .start_write_message(&MessageHeader::new(MessageType::Reply, 1, 1, sequence))
            .unwrap();
        codec.into_buffer()
    }

    #[test]
    fn pump_routes_replies_until_closed() {
        let (local, remote) = MemoryTransport::pair();
        let arbitrator = Arc::new(TransportArbitrator::new(
            Arc::new(local.with_receive_timeout(Duration::from_millis(10))),
            Arc::new(BasicCodecFactory),
            Arc::new(DynamicBufferFactory::new(64)),
        ));
        let client = arbitrator.prepare_client_receive(11).unwrap();
        let pump = ReceivePump::spawn(Arc::clone(&arbitrator)).unwrap();
        assert!(arbitrator.has_pump());

        remote.send(&mut reply(11)).unwrap();
        let buffer = arbitrator
            .client_receive(client, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(!buffer.is_empty());

        pump.shutdown();
        assert!(!arbitrator.has_pump());
    }

    #[test]
    fn pump_exits_on_fatal_error() {
        let (local, remote) = MemoryTransport::pair();
        let arbitrator = Arc::new(TransportArbitrator::new(
            Arc::new(local),
            Arc::new(BasicCodecFactory),
            Arc::new(DynamicBufferFactory::new(64)),
        ));
        let pump = ReceivePump::spawn(Arc::clone(&arbitrator)).unwrap();
        drop(remote);
        while pump.is_running() {
            thread::sleep(Duration::from_millis(5));
        }
        pump.shutdown();
        assert_eq!(arbitrator.free_count(), arbitrator.capacity());
    }

    /// Accepts every send; every receive fails as if the line dropped.
    struct DeafLink;

    impl Transport for DeafLink {
        fn send(&self, _message: &mut MessageBuffer) -> wirecall_transport::Result<()> {
            Ok(())
        }

        fn receive(&self, _message: &mut MessageBuffer) -> wirecall_transport::Result<()> {
            Err(TransportError::ReceiveFailed("line down".into()))
        }
    }

    #[test]
    fn call_after_pump_died_fails_fast() {
        let arbitrator = Arc::new(TransportArbitrator::new(
            Arc::new(DeafLink),
            Arc::new(BasicCodecFactory),
            Arc::new(DynamicBufferFactory::new(64)),
        ));
        let pump = ReceivePump::spawn(Arc::clone(&arbitrator)).unwrap();
        while pump.is_running() {
            thread::sleep(Duration::from_millis(5));
        }
        pump.shutdown();
        assert!(arbitrator.is_closed());

        let client = crate::ClientManager::arbitrated(Arc::clone(&arbitrator));
        let err = client.call(1, 1, |_| Ok(())).unwrap_err();
        assert!(err.is_fatal(), "{err}");
        assert!(matches!(
            err,
            crate::RpcError::Transport(TransportError::ReceiveFailed(_))
        ));
    }
}
