use crate::library::rio::{buffer_pool::Segment, error::IoFault, request_queue::RequestQueue};
use futures::task::AtomicWaker;
use std::{
    future::Future,
    pin::Pin,
    sync::atomic::{AtomicI32, AtomicU8, Ordering},
    task::{Context, Poll, Waker},
};

const IDLE: u8 = 0;
const ARMED: u8 = 1;
const IN_KERNEL: u8 = 2;
const COMPLETE: u8 = 3;

/// Completion cell for one receive slot of a connection.
///
/// The reactor thread is the only writer of a completion: it stores the
/// result and correlation, publishes them with the Release store of the
/// state, then wakes whoever is parked. The consumer reads the state with
/// Acquire before touching anything else. The segment is reused for the
/// whole life of the connection.
pub struct ReceiveSlot {
    segment: Segment,
    result: AtomicI32,
    request_correlation: AtomicI32,
    state: AtomicU8,
    waker: AtomicWaker,
}

/// Observable fields of a slot, for comparing against a freshly reset one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotSnapshot {
    pub bytes_transferred: i32,
    pub request_correlation: i32,
    pub completed: bool,
}

impl SlotSnapshot {
    pub const RESET: SlotSnapshot = SlotSnapshot {
        bytes_transferred: 0,
        request_correlation: 0,
        completed: false,
    };
}

impl ReceiveSlot {
    pub fn new(segment: Segment) -> Self {
        Self {
            segment,
            result: AtomicI32::new(0),
            request_correlation: AtomicI32::new(0),
            state: AtomicU8::new(IDLE),
            waker: AtomicWaker::new(),
        }
    }

    #[inline(always)]
    pub fn segment(&self) -> &Segment {
        &self.segment
    }

    /// Queued for the kernel, waiting for its turn.
    #[inline(always)]
    pub fn arm(&self) {
        self.state.store(ARMED, Ordering::Release);
    }

    #[inline(always)]
    pub fn is_armed(&self) -> bool {
        self.state.load(Ordering::Acquire) == ARMED
    }

    /// The kernel now owns the segment.
    #[inline(always)]
    pub fn begin(&self) {
        self.state.store(IN_KERNEL, Ordering::Release);
    }

    /// Publishes a result (bytes, or a negated errno) and wakes the consumer.
    pub fn complete(&self, result: i32, request_correlation: i32) {
        self.result.store(result, Ordering::Relaxed);
        self.request_correlation
            .store(request_correlation, Ordering::Relaxed);
        self.state.store(COMPLETE, Ordering::Release);
        self.waker.wake();
    }

    #[inline(always)]
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == COMPLETE
    }

    /// Only meaningful once `is_completed` returned true.
    #[inline(always)]
    pub fn result(&self) -> i32 {
        self.result.load(Ordering::Relaxed)
    }

    #[inline(always)]
    pub fn request_correlation(&self) -> i32 {
        self.request_correlation.load(Ordering::Relaxed)
    }

    pub fn register(&self, waker: &Waker) {
        self.waker.register(waker);
    }

    pub fn reset(&self) {
        self.result.store(0, Ordering::Relaxed);
        self.request_correlation.store(0, Ordering::Relaxed);
        self.state.store(IDLE, Ordering::Release);
        drop(self.waker.take());
    }

    pub fn snapshot(&self) -> SlotSnapshot {
        let completed = self.is_completed();
        SlotSnapshot {
            bytes_transferred: self.result(),
            request_correlation: self.request_correlation(),
            completed,
        }
    }
}

/// Future over one already-posted receive slot.
///
/// Nothing is allocated per receive: the awaitable borrows its queue, names
/// a slot, and carries the caller's buffer until completion, when the buffer
/// comes back filled together with the byte count. The reactor thread only
/// ever calls `wake()`, so the consumer resumes on its own executor.
///
/// Every awaitable must be driven to completion: the slot it names stays
/// parked until its result is taken.
#[must_use = "the slot stays parked until its result is taken"]
pub struct ReceiveAwaitable<'q, Q: ?Sized, B> {
    queue: &'q Q,
    index: usize,
    buffer: Option<B>,
}

impl<'q, Q, B> ReceiveAwaitable<'q, Q, B>
where
    Q: RequestQueue + ?Sized,
    B: AsMut<[u8]>,
{
    pub fn new(queue: &'q Q, index: usize, buffer: B) -> Self {
        Self {
            queue,
            index,
            buffer: Some(buffer),
        }
    }

    #[inline(always)]
    pub fn index(&self) -> usize {
        self.index
    }

    /// True once the kernel (or a sticky end-of-stream) completed this slot.
    #[inline(always)]
    pub fn is_completed(&self) -> bool {
        self.queue.receive_slot(self.index).is_completed()
    }

    /// Copies the completed bytes out, resets the slot and re-posts it.
    fn get_result(&self, buffer: &mut B) -> Result<usize, IoFault> {
        let slot = self.queue.receive_slot(self.index);
        let result = slot.result();
        let outcome = if result < 0 {
            Err(IoFault::from_code(result))
        } else {
            let dst = buffer.as_mut();
            let count = (result as usize).min(slot.segment().len()).min(dst.len());
            // Completed: the kernel is done with this segment until we re-post.
            let src = unsafe { slot.segment().as_slice() };
            dst[..count].copy_from_slice(&src[..count]);
            Ok(count)
        };
        slot.reset();
        self.queue.post_receive(self.index)?;
        outcome
    }
}

impl<Q, B> Future for ReceiveAwaitable<'_, Q, B>
where
    Q: RequestQueue + ?Sized,
    B: AsMut<[u8]> + Unpin,
{
    type Output = (B, Result<usize, IoFault>);

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let slot = this.queue.receive_slot(this.index);
        if !slot.is_completed() {
            slot.register(cx.waker());
            // Completion may have landed between the check and the registration.
            if !slot.is_completed() {
                return Poll::Pending;
            }
        }
        let mut buffer = this
            .buffer
            .take()
            .expect("ReceiveAwaitable polled after completion");
        let result = this.get_result(&mut buffer);
        Poll::Ready((buffer, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::rio::{
        MAX_PENDING_RECEIVES,
        error::FaultKind,
        testing::{Read, ScriptedQueue},
    };
    use futures::{FutureExt, executor::block_on};
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn completed_slot_yields_bytes() {
        let queue = ScriptedQueue::new([Read::data(b"hello")]);
        let (buffer, result) = block_on(queue.receive_async(vec![0u8; 32]));
        assert_eq!(result.unwrap(), 5);
        assert_eq!(&buffer[..5], b"hello");
    }

    #[test]
    fn slot_is_reset_and_reposted_after_get_result() {
        let queue = ScriptedQueue::new([Read::data(b"GET")]);
        let awaitable = queue.receive_async(vec![0u8; 16]);
        let index = awaitable.index();
        assert!(awaitable.is_completed());
        let (_, result) = block_on(awaitable);
        assert_eq!(result.unwrap(), 3);

        // Nothing left to deliver, so the re-posted slot is waiting in line.
        assert_eq!(queue.receive_slot(index).snapshot(), SlotSnapshot::RESET);
        assert_eq!(queue.posted_last(), Some(index));

        // The next read the queue sees lands in that same slot once the ring
        // wraps back around to it.
        queue.feed_many((1..MAX_PENDING_RECEIVES).map(|_| Read::data(b"x")));
        queue.feed(Read::data(b"again"));
        assert!(queue.receive_slot(index).is_completed());
        assert_eq!(queue.receive_slot(index).request_correlation(), index as i32);
    }

    #[test]
    fn short_destination_truncates() {
        let queue = ScriptedQueue::new([Read::data(b"0123456789")]);
        let (buffer, result) = block_on(queue.receive_async([0u8; 4]));
        assert_eq!(result.unwrap(), 4);
        assert_eq!(&buffer, b"0123");
    }

    #[test]
    fn negative_result_becomes_fault() {
        let queue = ScriptedQueue::new([Read::Fault(libc::ECONNRESET)]);
        let (_, result) = block_on(queue.receive_async(vec![0u8; 8]));
        let fault = result.unwrap_err();
        assert_eq!(fault.code(), Some(libc::ECONNRESET));
        assert_eq!(fault.kind(), Some(FaultKind::Other));
    }

    #[test]
    fn pending_until_completed() {
        let queue = ScriptedQueue::new([]);
        let mut awaitable = queue.receive_async(vec![0u8; 8]);
        assert!((&mut awaitable).now_or_never().is_none());
        queue.feed(Read::data(b"late"));
        let (buffer, result) = awaitable.now_or_never().unwrap();
        assert_eq!(result.unwrap(), 4);
        assert_eq!(&buffer[..4], b"late");
    }

    #[test]
    fn completion_from_another_thread_wakes_the_consumer() {
        let queue = Arc::new(ScriptedQueue::new([]));
        let producer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.feed(Read::Eof);
            })
        };
        let (_, result) = block_on(queue.receive_async(vec![0u8; 8]));
        assert_eq!(result.unwrap(), 0);
        producer.join().unwrap();
    }

    #[test]
    fn receives_are_consumed_in_slot_order() {
        let queue = ScriptedQueue::new([Read::data(b"a"), Read::data(b"b"), Read::data(b"c")]);
        for expected in [b"a", b"b", b"c"] {
            let (buffer, result) = block_on(queue.receive_async(vec![0u8; 4]));
            assert_eq!(result.unwrap(), 1);
            assert_eq!(&buffer[..1], expected);
        }
    }
}
