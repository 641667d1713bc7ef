use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use wirecall::codec::BasicCodecFactory;
use wirecall::echo::EchoClient;
use wirecall::frame::FrameConfig;
use wirecall::peer::{CallFailure, ClientManager};
use wirecall::transport::DynamicBufferFactory;

use crate::cmd::{parse_duration, CallArgs, CallMethod};
use crate::exit::{rpc_error, transport_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{print_record, CallOutput, OutputFormat};

pub fn run(args: CallArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_duration(&args.timeout)?;
    let config = FrameConfig {
        read_timeout: Some(timeout),
        write_timeout: Some(timeout),
        ..FrameConfig::default()
    };
    // Direct clients wait for replies under the socket read timeout.
    let transport = args
        .endpoint
        .connect(args.crc.strategy(), config)
        .map_err(|err| transport_error("connect failed", err))?;
    let client = ClientManager::new(
        transport,
        Arc::new(BasicCodecFactory),
        Arc::new(DynamicBufferFactory::default()),
    )
    .with_error_handler(|failure: &CallFailure| {
        tracing::debug!(
            status = %failure.status,
            sequence = failure.sequence,
            "call returned an error status"
        );
    });
    let client = EchoClient::new(client);

    let started = Instant::now();
    let result = invoke(&client, args.method, &args.args)?;
    let elapsed_ms = started.elapsed().as_millis();

    print_record(
        &CallOutput {
            endpoint: args.endpoint.to_string(),
            method: args.method.name(),
            oneway: args.method == CallMethod::Notify,
            result,
            elapsed_ms,
        },
        format,
    );
    Ok(SUCCESS)
}

fn invoke(client: &EchoClient, method: CallMethod, args: &[String]) -> CliResult<Value> {
    let failed = |err| rpc_error("call failed", err);
    match method {
        CallMethod::Echo => client.echo(&args.join(" ")).map(Value::from).map_err(failed),
        CallMethod::Add => {
            let (a, b) = parse_operands(args)?;
            client.add(a, b).map(Value::from).map_err(failed)
        }
        CallMethod::Notify => client
            .notify(&args.join(" "))
            .map(|()| Value::Null)
            .map_err(failed),
        CallMethod::Fail => {
            let code = match args {
                [] => 1,
                [code] => parse_arg(code)?,
                _ => return Err(CliError::new(USAGE, "fail takes at most one status code")),
            };
            client.fail(code).map(|()| Value::Null).map_err(failed)
        }
    }
}

fn parse_operands(args: &[String]) -> CliResult<(i32, i32)> {
    match args {
        [a, b] => Ok((parse_arg(a)?, parse_arg(b)?)),
        _ => Err(CliError::new(USAGE, "add takes exactly two integers")),
    }
}

fn parse_arg<T: std::str::FromStr>(text: &str) -> CliResult<T> {
    text.parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid integer argument: {text}")))
}
