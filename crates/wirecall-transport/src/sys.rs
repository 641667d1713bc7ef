use std::os::fd::RawFd;

use crate::error::{Result, TransportError};

/// Zero-timeout readiness check on a file descriptor.
///
/// Hang-up counts as readable so that the following receive observes the
/// closed connection instead of the caller polling forever.
pub(crate) fn poll_readable(fd: RawFd) -> Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        // SAFETY: `pfd` is a valid, initialized pollfd and the count is 1.
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        if rc >= 0 {
            return Ok(rc > 0 && pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(TransportError::from_receive_io(err));
        }
    }
}
