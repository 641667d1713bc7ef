use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use wirecall::codec::BasicCodecFactory;
use wirecall::echo::EchoService;
use wirecall::frame::FrameConfig;
use wirecall::peer::{RpcError, SimpleServer, StopHandle};
use wirecall::transport::DynamicBufferFactory;

use crate::cmd::{parse_duration, ServeArgs};
use crate::exit::{rpc_error, transport_error, CliError, CliResult, INTERNAL, INTERRUPTED, SUCCESS};
use crate::output::{print_record, ListeningOutput, OutputFormat};

/// Server of the connection being handled, if any.
type Current = Arc<Mutex<Option<StopHandle>>>;

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let poll_interval = parse_duration(&args.poll_interval)?;
    let listener = args
        .endpoint
        .bind()
        .map_err(|err| transport_error("bind failed", err))?;
    let crc = args.crc.strategy();
    // No read timeout: one expiring between the segments of a slow frame
    // would drop the bytes already read.
    let config = FrameConfig::default();

    print_record(
        &ListeningOutput {
            endpoint: listener.local_endpoint().to_string(),
            crc: crc.name(),
        },
        format,
    );

    let running = Arc::new(AtomicBool::new(true));
    let current: Current = Arc::new(Mutex::new(None));
    install_ctrlc_handler(running.clone(), current.clone())?;

    let service = Arc::new(EchoService::new());
    let codecs = Arc::new(BasicCodecFactory);
    let buffers = Arc::new(DynamicBufferFactory::default());

    while running.load(Ordering::SeqCst) {
        let transport = listener
            .accept(crc.clone(), config.clone())
            .map_err(|err| transport_error("accept failed", err))?;
        tracing::info!("client connected");

        let server = SimpleServer::new(transport, codecs.clone(), buffers.clone());
        server
            .add_service(service.clone())
            .map_err(|err| rpc_error("service setup failed", err))?;
        *lock(&current) = Some(server.stop_handle());
        // A signal that landed between accept and publishing the handle.
        if !running.load(Ordering::SeqCst) {
            server.stop();
        }

        let outcome = serve_connection(&server, poll_interval);
        lock(&current).take();
        match outcome {
            Ok(()) => {}
            Err(err) if err.is_fatal() => {
                tracing::info!(error = %err, "client disconnected");
            }
            Err(err) => return Err(rpc_error("server failed", err)),
        }

        if args.once {
            break;
        }
    }

    tracing::info!(notifications = service.notifications(), "serve finished");
    Ok(SUCCESS)
}

/// Dispatch calls until the connection fails or the server is stopped,
/// sleeping `poll_interval` whenever no call is pending.
fn serve_connection(server: &SimpleServer, poll_interval: Duration) -> Result<(), RpcError> {
    tracing::debug!(services = server.server().service_count(), "serving connection");
    while !server.is_stopped() {
        match server.poll() {
            Ok(true) => {}
            Ok(false) => thread::sleep(poll_interval),
            Err(RpcError::ServerIsDown) => break,
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => tracing::warn!(error = %err, "message dropped"),
        }
    }
    Ok(())
}

fn lock(current: &Current) -> std::sync::MutexGuard<'_, Option<StopHandle>> {
    current.lock().unwrap_or_else(PoisonError::into_inner)
}

/// First Ctrl-C stops the active connection and the accept loop; a second
/// one exits immediately, since `accept` does not observe the flag.
fn install_ctrlc_handler(running: Arc<AtomicBool>, current: Current) -> CliResult<()> {
    ctrlc::set_handler(move || {
        if !running.swap(false, Ordering::SeqCst) {
            std::process::exit(INTERRUPTED);
        }
        if let Some(handle) = lock(&current).as_ref() {
            handle.stop();
        }
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
