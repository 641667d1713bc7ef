//! Two peers calling each other over one in-process link.
//!
//! Each side wraps its end in a `TransportArbitrator`: the side's server loop
//! owns the receive path and hands replies to its own waiting clients.
//!
//! Run with:
//!   cargo run --example duplex

use std::sync::Arc;
use std::thread;

use wirecall::codec::BasicCodecFactory;
use wirecall::echo::{EchoClient, EchoService};
use wirecall::frame::{memory_pair, FrameConfig};
use wirecall::peer::{ClientManager, RpcError, SimpleServer, TransportArbitrator};
use wirecall::transport::{DynamicBufferFactory, Transport, TransportError};

/// Start a server on `link` and return a client sharing it.
fn peer(name: &'static str, link: Arc<dyn Transport>) -> Result<EchoClient, RpcError> {
    let arbitrator = Arc::new(TransportArbitrator::new(
        link,
        Arc::new(BasicCodecFactory),
        Arc::new(DynamicBufferFactory::default()),
    ));
    let server = SimpleServer::new(
        arbitrator.clone(),
        Arc::new(BasicCodecFactory),
        Arc::new(DynamicBufferFactory::default()),
    );
    server.add_service(Arc::new(EchoService::new()))?;
    thread::Builder::new()
        .name(format!("{name}-server"))
        .spawn(move || {
            if let Err(err) = server.run() {
                eprintln!("{name}: server stopped: {err}");
            }
        })
        .map_err(TransportError::Io)?;
    Ok(EchoClient::new(ClientManager::arbitrated(arbitrator)))
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let (left, right) = memory_pair(FrameConfig::default());
    let alice = Arc::new(peer("alice", Arc::new(left))?);
    let bob = Arc::new(peer("bob", Arc::new(right))?);

    println!("alice -> bob: {}", alice.echo("hi bob")?);
    println!("bob -> alice: {}", bob.echo("hi alice")?);

    // Calls in flight in both directions at once, replies matched by sequence.
    let workers: Vec<_> = (0..4)
        .map(|i| {
            let (caller, callee) = if i % 2 == 0 {
                (alice.clone(), "bob")
            } else {
                (bob.clone(), "alice")
            };
            thread::spawn(move || caller.add(i, 100).map(|sum| (callee, sum)))
        })
        .collect();
    for worker in workers {
        match worker.join() {
            Ok(Ok((callee, sum))) => println!("{callee} added: {sum}"),
            Ok(Err(err)) => eprintln!("call failed: {err}"),
            Err(_) => eprintln!("caller panicked"),
        }
    }

    alice.notify("bye")?;
    Ok(())
}
