use wirecall_codec::{Codec, MessageHeader, MessageType};
use wirecall_transport::Status;

use crate::error::Result;

/// A group of methods addressed by one service id.
///
/// Generated or hand-written stubs implement this: read arguments from
/// [`Invocation::args`], then write results after [`Invocation::begin_reply`].
pub trait Service: Send + Sync {
    fn service_id(&self) -> u32;

    /// Handle one call.
    ///
    /// Returning an error sends a reply carrying the error's status instead
    /// of results. Oneway calls send nothing either way.
    fn handle_invocation(&self, invocation: &mut Invocation<'_>) -> Result<()>;
}

/// One incoming call, positioned after its message header.
pub struct Invocation<'a> {
    header: MessageHeader,
    codec: &'a mut dyn Codec,
    reply_started: bool,
}

impl<'a> Invocation<'a> {
    pub(crate) fn new(header: MessageHeader, codec: &'a mut dyn Codec) -> Self {
        Self {
            header,
            codec,
            reply_started: false,
        }
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn method(&self) -> u32 {
        self.header.method
    }

    pub fn sequence(&self) -> u32 {
        self.header.sequence
    }

    pub fn is_oneway(&self) -> bool {
        self.header.message_type == MessageType::Oneway
    }

    /// Codec for reading arguments. Only meaningful before
    /// [`begin_reply`](Self::begin_reply).
    pub fn args(&mut self) -> &mut dyn Codec {
        &mut *self.codec
    }

    /// Discard the request and start a successful reply in the same buffer.
    ///
    /// Read every argument first: the arguments are overwritten.
    pub fn begin_reply(&mut self) -> Result<&mut dyn Codec> {
        start_reply(&mut *self.codec, &self.header, Status::Success.code())?;
        self.reply_started = true;
        Ok(&mut *self.codec)
    }

    pub(crate) fn reply_started(&self) -> bool {
        self.reply_started
    }
}

/// Rewind `codec` and write a reply header followed by `status`.
pub(crate) fn start_reply(
    codec: &mut dyn Codec,
    request: &MessageHeader,
    code: u32,
) -> Result<()> {
    codec.reset()?;
    codec.start_write_message(&request.reply())?;
    codec.write_u32(code)?;
    Ok(())
}

impl std::fmt::Debug for Invocation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invocation")
            .field("header", &self.header)
            .field("reply_started", &self.reply_started)
            .finish_non_exhaustive()
    }
}
