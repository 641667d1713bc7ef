//! Echo service on a Unix socket, serving one client at a time.
//!
//! Run with:
//!   cargo run --example echo-server
//!
//! In another terminal:
//!   cargo run --features cli -- call /tmp/wirecall-echo-<pid>/echo.sock echo hello

use std::fs;
use std::sync::Arc;

use wirecall::codec::BasicCodecFactory;
use wirecall::echo::EchoService;
use wirecall::frame::{FrameConfig, XmodemCrc16};
use wirecall::peer::SimpleServer;
use wirecall::transport::DynamicBufferFactory;
use wirecall::Endpoint;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let sock_dir = std::env::temp_dir().join(format!("wirecall-echo-{}", std::process::id()));
    fs::create_dir_all(&sock_dir)?;
    let endpoint: Endpoint = sock_dir.join("echo.sock").to_string_lossy().parse()?;

    let listener = endpoint.bind()?;
    eprintln!("Listening on {}", listener.local_endpoint());

    let service = Arc::new(EchoService::new());
    loop {
        let transport = listener.accept(Arc::new(XmodemCrc16), FrameConfig::default())?;
        eprintln!("Client connected");

        let server = SimpleServer::new(
            transport,
            Arc::new(BasicCodecFactory),
            Arc::new(DynamicBufferFactory::default()),
        );
        server.add_service(service.clone())?;
        if let Err(err) = server.run() {
            eprintln!("Client gone: {err}");
        }
        eprintln!("Notifications so far: {}", service.notifications());
    }
}
