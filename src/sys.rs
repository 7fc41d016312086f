//! Thin shims over the raw V4L2 syscall layer.

use std::io;
use std::mem;
use std::os::raw::{c_int, c_ulong, c_void};
use std::ptr;
use std::time::Duration;

use v4l::v4l2;

/// Issue an ioctl, retrying while the call is interrupted by a signal.
///
/// # Safety
///
/// `arg` must point to a value of the type the request code expects, valid
/// for the duration of the call.
pub(crate) unsafe fn xioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> io::Result<()> {
    loop {
        match v4l2::ioctl(fd, request, arg) {
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => {}
            other => return other,
        }
    }
}

/// Block until `fd` is readable.
///
/// With no timeout this waits indefinitely, returning `Ok(true)` once data
/// is available. With a timeout, `Ok(false)` reports expiry. An
/// interrupting signal surfaces as an error so callers can observe
/// cancellation instead of silently re-arming the wait.
pub(crate) fn wait_readable(fd: c_int, timeout: Option<Duration>) -> io::Result<bool> {
    let mut readfds: libc::fd_set = unsafe { mem::zeroed() };
    unsafe {
        libc::FD_ZERO(&mut readfds);
        libc::FD_SET(fd, &mut readfds);
    }

    let mut tv = libc::timeval {
        tv_sec: 0,
        tv_usec: 0,
    };
    let tv_ptr = match timeout {
        Some(duration) => {
            #[allow(clippy::cast_possible_wrap, clippy::cast_possible_truncation)]
            {
                tv.tv_sec = duration.as_secs() as libc::time_t;
                tv.tv_usec = duration.subsec_micros() as libc::suseconds_t;
            }
            &mut tv as *mut libc::timeval
        }
        None => ptr::null_mut(),
    };

    let ret = unsafe { libc::select(fd + 1, &mut readfds, ptr::null_mut(), ptr::null_mut(), tv_ptr) };
    match ret {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(false),
        _ => Ok(true),
    }
}

/// Decode a fixed-size, NUL-padded identity field from the driver.
pub(crate) fn text_field(raw: &[u8]) -> String {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    String::from_utf8_lossy(raw.get(..end).unwrap_or(raw)).into_owned()
}
