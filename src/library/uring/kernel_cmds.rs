use io_uring::{opcode, squeue, squeue::Flags, types};
use libc::{MSG_MORE, MSG_NOSIGNAL, MSG_WAITALL};
use std::os::fd::RawFd;
use tracing::trace;

#[inline(always)]
pub unsafe fn recv_fixed(
    client_fd: RawFd,
    user_data: u64,
    buffer: *mut u8,
    len: u32,
    buf_index: u16,
) -> squeue::Entry {
    // Receive straight into the registered arena. The kernel already has the pages pinned,
    // so no per-call page walk.
    trace!("Kernel Call: ReadFixed");
    opcode::ReadFixed::new(types::Fd(client_fd), buffer, len, buf_index)
        .build()
        .user_data(user_data)
}

#[inline(always)]
pub unsafe fn recv(client_fd: RawFd, user_data: u64, buffer: *mut u8, len: u32) -> squeue::Entry {
    // Old-school receive into this specific buffer. Used when the arena could not be registered.
    trace!("Kernel Call: Recv");
    opcode::Recv::new(types::Fd(client_fd), buffer, len)
        .build()
        .user_data(user_data)
}

#[inline(always)]
pub unsafe fn send(
    client_fd: RawFd,
    user_data: u64,
    data: *const u8,
    len: u32,
    more: bool,
) -> squeue::Entry {
    // Send bytes like your life depends on it. If `more` is true, tease the TCP stack a bit
    // and chain the next send behind this one so the kernel keeps them in order.
    trace!("Kernel Call: Send");
    trace!("    Write {} bytes (more: {})", len, more);
    if more {
        opcode::Send::new(types::Fd(client_fd), data, len)
            .flags(MSG_MORE | MSG_NOSIGNAL | MSG_WAITALL) // "There's more coming, trust me"
            .build()
            .user_data(user_data)
            .flags(Flags::IO_LINK)
    } else {
        opcode::Send::new(types::Fd(client_fd), data, len)
            .flags(MSG_NOSIGNAL | MSG_WAITALL)
            .build()
            .user_data(user_data)
    }
}
