use libc::socklen_t;
use socket2::SockRef;
use std::{
    io,
    net::{Shutdown, TcpStream},
    os::fd::{AsFd, AsRawFd},
};
use tracing::trace;

const SEND_BUFFER_SIZE: usize = 1024 * 1024;
const BUSY_POLL_MICROS: i32 = 50;

pub fn prepare_incoming_socket(stream: &TcpStream) -> io::Result<()> {
    let socket = SockRef::from(stream);
    // Give the socket a 1MB send buffer: a whole send ring fits without the kernel pushing back.
    socket.set_send_buffer_size(SEND_BUFFER_SIZE)?;
    // Check if the OS actually listened to us or just pretended to.
    trace!("Real sndbuf client size: {} bytes", socket.send_buffer_size()?);
    // Disable Nagle's algorithm, small packets need love too.
    stream.set_nodelay(true)?;
    // Busy polling is a privilege on most boxes, so it is a wish, not a requirement.
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_BUSY_POLL,
            &BUSY_POLL_MICROS as *const _ as *const libc::c_void,
            size_of::<i32>() as socklen_t,
        )
    };
    if rc != 0 {
        trace!("SO_BUSY_POLL refused: {}", io::Error::last_os_error());
    }
    // Stays blocking. The ring arms its own poll, and O_NONBLOCK would turn
    // fixed-buffer reads into EAGAIN completions on some kernels.
    Ok(())
}

/// Half-closes both directions, which wakes any receive parked in the kernel.
pub fn shutdown_socket<S: AsFd>(socket: &S) -> io::Result<()> {
    SockRef::from(socket).shutdown(Shutdown::Both)
}
