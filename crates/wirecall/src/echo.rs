//! Demo service and its typed client.
//!
//! Serves as the reference for writing stubs by hand: the service reads
//! arguments in declaration order and writes results after
//! [`Invocation::begin_reply`]; the client mirrors that order.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;
use wirecall_peer::{ClientManager, Invocation, Result, RpcError, Service};
use wirecall_transport::Status;

pub const ECHO_SERVICE_ID: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum EchoMethod {
    /// `echo(text: string) -> string`
    Echo = 1,
    /// `add(a: i32, b: i32) -> i32`, failing on overflow.
    Add = 2,
    /// `oneway notify(text: string)`
    Notify = 3,
    /// `fail(status: u32)`: always fails with the given nonzero status.
    Fail = 4,
}

impl EchoMethod {
    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Option<Self> {
        match id {
            1 => Some(EchoMethod::Echo),
            2 => Some(EchoMethod::Add),
            3 => Some(EchoMethod::Notify),
            4 => Some(EchoMethod::Fail),
            _ => None,
        }
    }
}

/// Server side of the echo service.
#[derive(Debug, Default)]
pub struct EchoService {
    notifications: AtomicU64,
}

impl EchoService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Oneway notifications received so far.
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }
}

impl Service for EchoService {
    fn service_id(&self) -> u32 {
        ECHO_SERVICE_ID
    }

    fn handle_invocation(&self, invocation: &mut Invocation<'_>) -> Result<()> {
        let method = invocation.method();
        match EchoMethod::from_id(method) {
            Some(EchoMethod::Echo) => {
                let text = invocation.args().read_string()?;
                invocation.begin_reply()?.write_string(&text)?;
            }
            Some(EchoMethod::Add) => {
                let a = invocation.args().read_i32()?;
                let b = invocation.args().read_i32()?;
                let sum = a
                    .checked_add(b)
                    .ok_or_else(|| RpcError::InvalidArgument(format!("{a} + {b} overflows")))?;
                invocation.begin_reply()?.write_i32(sum)?;
            }
            Some(EchoMethod::Notify) => {
                let text = invocation.args().read_string()?;
                let count = self.notifications.fetch_add(1, Ordering::Relaxed) + 1;
                info!(count, text = %text, "notification");
            }
            Some(EchoMethod::Fail) => {
                let code = invocation.args().read_u32()?;
                if code == Status::Success.code() {
                    return Err(RpcError::InvalidArgument(
                        "fail needs a nonzero status".into(),
                    ));
                }
                return Err(RpcError::Remote {
                    status: Status::from_code(code),
                    code,
                });
            }
            None => {
                return Err(RpcError::UnknownMethod {
                    service: ECHO_SERVICE_ID,
                    method,
                })
            }
        }
        Ok(())
    }
}

/// Client side of the echo service.
#[derive(Debug)]
pub struct EchoClient {
    client: ClientManager,
}

impl EchoClient {
    pub fn new(client: ClientManager) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &ClientManager {
        &self.client
    }

    pub fn echo(&self, text: &str) -> Result<String> {
        let mut reply = self
            .client
            .call(ECHO_SERVICE_ID, EchoMethod::Echo.id(), |args| {
                args.write_string(text)
            })?;
        Ok(reply.codec().read_string()?)
    }

    pub fn add(&self, a: i32, b: i32) -> Result<i32> {
        let mut reply = self
            .client
            .call(ECHO_SERVICE_ID, EchoMethod::Add.id(), |args| {
                args.write_i32(a)?;
                args.write_i32(b)
            })?;
        Ok(reply.codec().read_i32()?)
    }

    pub fn notify(&self, text: &str) -> Result<()> {
        self.client
            .notify(ECHO_SERVICE_ID, EchoMethod::Notify.id(), |args| {
                args.write_string(text)
            })
    }

    /// Ask the server to fail with `status`, which must not be zero.
    ///
    /// Codes outside the known [`Status`] set come back unchanged in
    /// [`RpcError::Remote::code`].
    pub fn fail(&self, status: u32) -> Result<()> {
        if status == Status::Success.code() {
            return Err(RpcError::InvalidArgument(
                "fail needs a nonzero status".into(),
            ));
        }
        self.client
            .call(ECHO_SERVICE_ID, EchoMethod::Fail.id(), |args| {
                args.write_u32(status)
            })
            .map(drop)
    }
}
