use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use wirecall::frame::FrameHeader;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// A single record printed by a subcommand.
pub trait Record: Serialize {
    /// Ordered `(column, value)` pairs for table and pretty output.
    fn fields(&self) -> Vec<(&'static str, String)>;

    /// Bytes written for `--format raw`.
    fn raw(&self) -> Vec<u8>;
}

pub fn print_record<R: Record>(record: &R, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let (header, row): (Vec<_>, Vec<_>) = record
                .fields()
                .into_iter()
                .map(|(name, value)| (name.to_ascii_uppercase(), value))
                .unzip();
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(header)
                .add_row(row);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            let line = record
                .fields()
                .into_iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join(" ");
            println!("{line}");
        }
        OutputFormat::Raw => print_raw(&record.raw()),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

#[derive(Serialize)]
pub struct ListeningOutput {
    pub endpoint: String,
    pub crc: &'static str,
}

impl Record for ListeningOutput {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![("endpoint", self.endpoint.clone()), ("crc", self.crc.to_string())]
    }

    fn raw(&self) -> Vec<u8> {
        format!("{}\n", self.endpoint).into_bytes()
    }
}

#[derive(Serialize)]
pub struct CallOutput {
    pub endpoint: String,
    pub method: &'static str,
    pub oneway: bool,
    pub result: serde_json::Value,
    pub elapsed_ms: u128,
}

impl Record for CallOutput {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("endpoint", self.endpoint.clone()),
            ("method", self.method.to_string()),
            ("oneway", self.oneway.to_string()),
            ("result", value_text(&self.result)),
            ("elapsed_ms", self.elapsed_ms.to_string()),
        ]
    }

    fn raw(&self) -> Vec<u8> {
        let mut text = value_text(&self.result);
        text.push('\n');
        text.into_bytes()
    }
}

#[derive(Serialize)]
pub struct FrameOutput {
    pub crc: &'static str,
    pub payload_len: u32,
    pub header_crc: String,
    pub body_crc: String,
    /// Hex of the encoded frame, or of the decoded payload.
    pub hex: String,
    /// Payload as UTF-8 when it is valid text.
    pub text: Option<String>,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl FrameOutput {
    pub fn new(crc: &'static str, header: &FrameHeader, bytes: Vec<u8>, payload: &[u8]) -> Self {
        Self {
            crc,
            payload_len: header.payload_len,
            header_crc: format!("{:#06x}", header.header_crc),
            body_crc: format!("{:#06x}", header.body_crc),
            hex: encode_hex(&bytes),
            text: std::str::from_utf8(payload).ok().map(str::to_string),
            bytes,
        }
    }
}

impl Record for FrameOutput {
    fn fields(&self) -> Vec<(&'static str, String)> {
        vec![
            ("crc", self.crc.to_string()),
            ("payload_len", self.payload_len.to_string()),
            ("header_crc", self.header_crc.clone()),
            ("body_crc", self.body_crc.clone()),
            ("hex", self.hex.clone()),
            (
                "text",
                self.text.clone().unwrap_or_else(|| "<binary>".to_string()),
            ),
        ]
    }

    fn raw(&self) -> Vec<u8> {
        self.bytes.clone()
    }
}

fn value_text(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(text) => text.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    }
}

pub fn encode_hex(data: &[u8]) -> String {
    use std::fmt::Write as _;
    data.iter().fold(String::with_capacity(data.len() * 2), |mut out, byte| {
        let _ = write!(out, "{byte:02x}");
        out
    })
}

/// Parse hex digits, ignoring whitespace. `None` on odd length or bad digits.
pub fn decode_hex(text: &str) -> Option<Vec<u8>> {
    let digits: Vec<u8> = text.bytes().filter(|b| !b.is_ascii_whitespace()).collect();
    if digits.len() % 2 != 0 {
        return None;
    }
    digits
        .chunks(2)
        .map(|pair| {
            let high = char::from(pair[0]).to_digit(16)?;
            let low = char::from(pair[1]).to_digit(16)?;
            u8::try_from(high << 4 | low).ok()
        })
        .collect()
}
