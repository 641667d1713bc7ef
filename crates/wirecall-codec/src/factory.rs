use wirecall_transport::MessageBuffer;

use crate::codec::{BasicCodec, Codec};
use crate::error::Result;

/// Builds codecs over buffers. Bound once at client/server setup.
pub trait CodecFactory: Send + Sync {
    /// A codec positioned `skip` bytes into `buffer`.
    fn create(&self, buffer: MessageBuffer, skip: usize) -> Result<Box<dyn Codec>>;
}

/// Produces [`BasicCodec`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicCodecFactory;

impl CodecFactory for BasicCodecFactory {
    fn create(&self, buffer: MessageBuffer, skip: usize) -> Result<Box<dyn Codec>> {
        Ok(Box::new(BasicCodec::new(buffer, skip)?))
    }
}
