use bytes::BytesMut;
use wirecall::frame::{decode_frame, encode_frame};

use crate::cmd::{FrameAction, FrameArgs, FrameDecodeArgs, FrameEncodeArgs};
use crate::exit::{transport_error, CliError, CliResult, SUCCESS, USAGE};
use crate::output::{decode_hex, print_record, FrameOutput, OutputFormat};

pub fn run(args: FrameArgs, format: OutputFormat) -> CliResult<i32> {
    match args.action {
        FrameAction::Encode(args) => encode(args, format),
        FrameAction::Decode(args) => decode(args, format),
    }
}

fn encode(args: FrameEncodeArgs, format: OutputFormat) -> CliResult<i32> {
    let payload = match (&args.data, &args.hex) {
        (Some(text), _) => text.as_bytes().to_vec(),
        (None, Some(hex)) => parse_hex(hex)?,
        (None, None) => Vec::new(),
    };
    let crc = args.crc.strategy();
    let mut frame = BytesMut::new();
    let header = encode_frame(&payload, crc.as_ref(), &mut frame)
        .map_err(|err| transport_error("encode failed", err))?;
    tracing::debug!(payload_len = payload.len(), crc = crc.name(), "frame encoded");
    print_record(
        &FrameOutput::new(crc.name(), &header, frame.to_vec(), &payload),
        format,
    );
    Ok(SUCCESS)
}

fn decode(args: FrameDecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let frame = parse_hex(&args.hex)?;
    let crc = args.crc.strategy();
    let (header, payload) = decode_frame(&frame, crc.as_ref())
        .map_err(|err| transport_error("decode failed", err))?;
    if frame.len() > payload.len() + wirecall::frame::HEADER_SIZE {
        tracing::warn!(
            trailing = frame.len() - payload.len() - wirecall::frame::HEADER_SIZE,
            "ignoring bytes after frame"
        );
    }
    print_record(
        &FrameOutput::new(crc.name(), &header, payload.to_vec(), payload),
        format,
    );
    Ok(SUCCESS)
}

fn parse_hex(text: &str) -> CliResult<Vec<u8>> {
    decode_hex(text).ok_or_else(|| CliError::new(USAGE, "payload is not valid hex"))
}
