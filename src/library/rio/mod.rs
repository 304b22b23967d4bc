pub mod buffer_pool;
pub mod connection;
pub mod error;
pub mod reactor;
pub mod receive;
pub mod request_queue;
#[cfg(test)]
pub(crate) mod testing;

/// Ethernet MTU minus the IPv4 header and the largest TCP header. One send
/// segment never carries more than this.
pub const PACKET_SIZE: usize = 1500 - (20 + 60);
/// Receive slots per connection. Power of two: slot = counter & mask.
pub const MAX_PENDING_RECEIVES: usize = 16;
pub const RECEIVE_MASK: usize = MAX_PENDING_RECEIVES - 1;
/// Send segments per connection. Power of two: slot = counter & mask.
pub const MAX_PENDING_SENDS: usize = 32;
pub const SEND_MASK: usize = MAX_PENDING_SENDS - 1;
pub const MAX_SOCKETS_PER_REACTOR: usize = 1024;
/// Completions copied out of the CQ per drain.
pub const MAX_RESULTS: usize = 512;
/// Reactor-owned segments holding the canned 400 and 503 responses.
pub const CACHED_SEGMENTS: usize = 2;

/// Segments a reactor's pool needs to serve `max_sockets` connections.
pub const fn pool_segments(max_sockets: usize) -> usize {
    max_sockets * (MAX_PENDING_RECEIVES + MAX_PENDING_SENDS) + CACHED_SEGMENTS
}
