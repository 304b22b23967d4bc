use crate::library::rio::{
    error::IoFault,
    receive::{ReceiveAwaitable, ReceiveSlot},
};

/// The per-connection surface consumers drive: a ring of receive slots that
/// stay posted, and a coalescing send path.
///
/// `Connection` implements it on top of the reactor's ring; anything that
/// wants to speak a real protocol sits behind this trait as well.
pub trait RequestQueue: Send + Sync {
    fn receive_slot(&self, index: usize) -> &ReceiveSlot;

    /// Claims the next slot in ring order.
    fn next_receive_index(&self) -> usize;

    /// Puts a consumed slot back in line for the kernel.
    fn post_receive(&self, index: usize) -> Result<(), IoFault>;

    /// Copies `data` into the send ring. With `is_end` the buffered tail is
    /// pushed out and everything deferred so far is committed.
    fn queue_send(&self, data: &[u8], is_end: bool) -> Result<(), IoFault>;

    /// Pushes out a partial segment (or commits deferred sends) without the
    /// caller having more data to add.
    fn flush_sends(&self) -> Result<(), IoFault>;

    fn send_cached_bad(&self) -> Result<(), IoFault>;

    fn send_cached_busy(&self) -> Result<(), IoFault>;

    /// Idempotent.
    fn close(&self);

    /// Awaitable for the next slot. The kernel receive behind it is already
    /// posted; awaiting copies the bytes into `buffer` and hands it back.
    fn receive_async<B: AsMut<[u8]>>(&self, buffer: B) -> ReceiveAwaitable<'_, Self, B>
    where
        Self: Sized,
    {
        let index = self.next_receive_index();
        ReceiveAwaitable::new(self, index, buffer)
    }
}
