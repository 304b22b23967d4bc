use crate::library::{rio::error::IoFault, uring::Ring};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::{
    io,
    net::{SocketAddr, TcpListener},
};

pub const LISTEN_BACKLOG: i32 = 2048;
/// Request correlation of the cached bad-request/busy sends. Every ring send
/// is `-(slot + 1)` with at most 32 slots, so this never collides.
pub const CACHED_SEND: i32 = i32::MIN;

/// What every SQE carries back in its CQE: which connection, and which of its
/// receive slots (>= 0) or send slots (< 0) the completion belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Correlation {
    pub connection_id: u32,
    pub request: i32,
}

impl Correlation {
    #[inline(always)]
    pub const fn receive(connection_id: u32, slot: usize) -> Self {
        Self {
            connection_id,
            request: slot as i32,
        }
    }

    #[inline(always)]
    pub const fn send(connection_id: u32, slot: usize) -> Self {
        Self {
            connection_id,
            request: -(slot as i32) - 1,
        }
    }

    #[inline(always)]
    pub const fn pack_user_data(&self) -> u64 {
        ((self.connection_id as u64) << 32) | (self.request as u32 as u64)
    }

    #[inline(always)]
    pub const fn unpack_user_data(user_data: u64) -> Self {
        Self {
            connection_id: (user_data >> 32) as u32,
            request: user_data as u32 as i32,
        }
    }

    /// Send slot for a negative, non-cached request.
    #[inline(always)]
    pub const fn send_slot(&self) -> Option<usize> {
        if self.request < 0 && self.request != CACHED_SEND {
            Some((-(self.request + 1)) as usize)
        } else {
            None
        }
    }
}

pub trait ServerInternal {
    fn build_listener(&self, addr: &str) -> io::Result<TcpListener> {
        let addr: SocketAddr = addr
            .parse()
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err))?;
        let listener = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        listener.set_reuse_address(true)?;
        listener.bind(&SockAddr::from(addr))?;
        listener.listen(LISTEN_BACKLOG)?;
        // Accept stays blocking: it has a thread of its own.
        Ok(listener.into())
    }

    fn build_ring(&self, size: u32) -> Result<Ring, IoFault> {
        Ok(Ring::new(size)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_correlation_survives_packing() {
        let packed = Correlation::receive(0xDEAD_BEEF, 15).pack_user_data();
        let back = Correlation::unpack_user_data(packed);
        assert_eq!(back.connection_id, 0xDEAD_BEEF);
        assert_eq!(back.request, 15);
        assert_eq!(back.send_slot(), None);
    }

    #[test]
    fn send_correlations_are_negative() {
        for slot in [0usize, 1, 31] {
            let packed = Correlation::send(7, slot).pack_user_data();
            let back = Correlation::unpack_user_data(packed);
            assert!(back.request < 0);
            assert_eq!(back.send_slot(), Some(slot));
        }
        let cached = Correlation {
            connection_id: 7,
            request: CACHED_SEND,
        };
        assert_eq!(Correlation::unpack_user_data(cached.pack_user_data()).send_slot(), None);
    }
}
