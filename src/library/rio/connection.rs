use crate::library::{
    network::socket_helpers::shutdown_socket,
    rio::{
        MAX_PENDING_RECEIVES, MAX_PENDING_SENDS, PACKET_SIZE, RECEIVE_MASK, SEND_MASK,
        buffer_pool::Segment,
        error::IoFault,
        reactor::{CachedResponse, Reactor},
        receive::ReceiveSlot,
        request_queue::RequestQueue,
    },
    server_internals::{CACHED_SEND, Correlation},
    uring::kernel_cmds::{recv, recv_fixed, send},
};
use io_uring::squeue;
use parking_lot::Mutex;
use std::{
    net::TcpStream,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
    },
};
use tracing::{debug, trace};

/// One segment's worth of a send run.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SendPart {
    pub(crate) slot: usize,
    pub(crate) data: *const u8,
    pub(crate) len: usize,
}

impl SendPart {
    const EMPTY: SendPart = SendPart {
        slot: 0,
        data: std::ptr::null(),
        len: 0,
    };
}

/// Write-coalescing ring of send segments.
///
/// Bytes are packed into the current segment. Full segments are staged, not
/// sent: they reach the kernel together, as one run, when the caller ends or
/// flushes a batch, or when the ring wraps back to slot 0. An empty run means
/// there is nothing to send and the caller only wants a commit.
///
/// A segment whose last send has not completed yet cannot be written again.
pub(crate) struct SendRing {
    segments: Vec<Segment>,
    send_count: usize,
    offset: usize,
    staged: usize,
}

impl SendRing {
    pub(crate) fn new(segments: Vec<Segment>) -> Self {
        debug_assert_eq!(segments.len(), MAX_PENDING_SENDS);
        Self {
            segments,
            send_count: 0,
            offset: 0,
            staged: 0,
        }
    }

    #[inline(always)]
    fn current_slot(&self) -> usize {
        self.send_count & SEND_MASK
    }

    pub(crate) fn queue<F>(
        &mut self,
        data: &[u8],
        is_end: bool,
        in_flight: &[AtomicBool],
        mut issue: F,
    ) -> Result<(), IoFault>
    where
        F: FnMut(&[SendPart]) -> Result<(), IoFault>,
    {
        let mut remaining: &[u8] = data;
        while !remaining.is_empty() {
            let slot = self.current_slot();
            if self.offset == 0
                && (self.staged == MAX_PENDING_SENDS || in_flight[slot].load(Ordering::Acquire))
            {
                return Err(IoFault::SendRingOverrun { slot });
            }
            let take = (PACKET_SIZE - self.offset).min(remaining.len());
            // Neither staged nor in flight: the kernel has no reference to this segment.
            let segment = unsafe { self.segments[slot].as_mut_slice() };
            segment[self.offset..self.offset + take].copy_from_slice(&remaining[..take]);
            self.offset += take;
            remaining = &remaining[take..];
            if self.offset == PACKET_SIZE {
                self.offset = 0;
                self.send_count = self.send_count.wrapping_add(1);
                self.staged += 1;
                // Wrapping back to slot 0 sends, so a run never grows past
                // one trip around the ring.
                if slot == 0 {
                    self.issue_run(&mut issue)?;
                }
            }
        }
        if is_end {
            if self.offset > 0 || self.staged > 0 {
                self.issue_run(&mut issue)?;
            } else {
                issue(&[])?;
            }
        }
        Ok(())
    }

    pub(crate) fn flush<F>(&mut self, mut issue: F) -> Result<(), IoFault>
    where
        F: FnMut(&[SendPart]) -> Result<(), IoFault>,
    {
        if self.offset > 0 || self.staged > 0 {
            self.issue_run(&mut issue)
        } else {
            Ok(())
        }
    }

    /// Hands every staged segment, plus the partial one if any, to `issue` in
    /// ring order. On failure nothing moves, a later flush retries the same run.
    fn issue_run<F>(&mut self, issue: &mut F) -> Result<(), IoFault>
    where
        F: FnMut(&[SendPart]) -> Result<(), IoFault>,
    {
        let mut parts = [SendPart::EMPTY; MAX_PENDING_SENDS];
        let first = self.send_count.wrapping_sub(self.staged);
        for (at, part) in parts.iter_mut().take(self.staged).enumerate() {
            let slot = first.wrapping_add(at) & SEND_MASK;
            *part = SendPart {
                slot,
                data: self.segments[slot].as_ptr() as *const u8,
                len: PACKET_SIZE,
            };
        }
        let mut count = self.staged;
        let partial = self.offset > 0;
        if partial {
            let slot = self.current_slot();
            parts[count] = SendPart {
                slot,
                data: self.segments[slot].as_ptr() as *const u8,
                len: self.offset,
            };
            count += 1;
        }
        issue(&parts[..count])?;
        if partial {
            self.send_count = self.send_count.wrapping_add(1);
            self.offset = 0;
        }
        self.staged = 0;
        Ok(())
    }
}

/// Walks armed receive slots in ring order with at most one of them in the
/// kernel, so completions come back in the order consumers claim slots.
///
/// Linux gives no ordering between concurrent receives on one socket, so
/// only one receive is ever in the kernel at a time. Consumers still see
/// `MAX_PENDING_RECEIVES` slots posted; the rest wait here, armed, and go to
/// the kernel one by one as each completion comes back.
struct ReceiveChain {
    cursor: usize,
    busy: bool,
    /// First end-of-stream (0) or failure (negated errno). Every slot armed
    /// after it completes with the same value without touching the kernel.
    terminal: Option<i32>,
}

/// An accepted socket bound to one reactor for its whole life.
pub struct Connection {
    id: u32,
    socket: OwnedFd,
    reactor: Arc<Reactor>,
    receive_slots: Box<[ReceiveSlot]>,
    receives: AtomicUsize,
    chain: Mutex<ReceiveChain>,
    send_ring: Mutex<SendRing>,
    send_in_flight: Box<[AtomicBool]>,
    outstanding_sends: AtomicUsize,
    send_failure: AtomicI32,
    closed: AtomicBool,
    finalized: AtomicBool,
}

impl Connection {
    /// Takes the connection's segments from the reactor's pool, registers it
    /// and posts every receive slot.
    pub fn accept(
        stream: TcpStream,
        id: u32,
        reactor: Arc<Reactor>,
    ) -> Result<Arc<Connection>, IoFault> {
        // On exhaustion the segments taken so far drop straight back into the pool.
        let receive_slots = (0..MAX_PENDING_RECEIVES)
            .map(|_| reactor.pool().get_segment().map(ReceiveSlot::new))
            .collect::<Result<Vec<_>, _>>()?
            .into_boxed_slice();
        let send_segments = (0..MAX_PENDING_SENDS)
            .map(|_| reactor.pool().get_segment())
            .collect::<Result<Vec<_>, _>>()?;

        let connection = Arc::new(Connection {
            id,
            socket: OwnedFd::from(stream),
            reactor: Arc::clone(&reactor),
            receive_slots,
            receives: AtomicUsize::new(0),
            chain: Mutex::new(ReceiveChain {
                cursor: 0,
                busy: false,
                terminal: None,
            }),
            send_ring: Mutex::new(SendRing::new(send_segments)),
            send_in_flight: (0..MAX_PENDING_SENDS).map(|_| AtomicBool::new(false)).collect(),
            outstanding_sends: AtomicUsize::new(0),
            send_failure: AtomicI32::new(0),
            closed: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
        });
        // Registered before anything is posted: the first completion must find us.
        reactor.register(Arc::clone(&connection));
        for index in 0..MAX_PENDING_RECEIVES {
            if let Err(fault) = connection.post_receive(index) {
                connection.close();
                return Err(fault);
            }
        }
        debug!("Connection {} up on reactor {}", id, reactor.id());
        Ok(connection)
    }

    #[inline(always)]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline(always)]
    pub fn reactor(&self) -> &Arc<Reactor> {
        &self.reactor
    }

    #[inline(always)]
    fn fd(&self) -> RawFd {
        self.socket.as_raw_fd()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reactor thread: a receive for slot `request` finished with `result`.
    pub(crate) fn complete_receive(&self, request: i32, result: i32) {
        let index = request as usize & RECEIVE_MASK;
        trace!("Connection {}: receive {} -> {}", self.id, index, result);
        let mut chain = self.chain.lock();
        chain.busy = false;
        if result <= 0 {
            chain.terminal.get_or_insert(result);
        }
        self.receive_slots[index].complete(result, request);
        if let Err(fault) = self.advance(&mut chain) {
            debug!("Connection {}: receive re-post failed: {}", self.id, fault);
        }
        drop(chain);
        self.try_finalize();
    }

    /// Reactor thread: a ring or cached send finished with `result`.
    pub(crate) fn complete_send(&self, request: i32, result: i32) {
        let correlation = Correlation {
            connection_id: self.id,
            request,
        };
        if let Some(slot) = correlation.send_slot() {
            self.send_in_flight[slot & SEND_MASK].store(false, Ordering::Release);
        }
        if result < 0 {
            // Linked successors of a failed send report ECANCELED; keep the root cause.
            let _ = self
                .send_failure
                .compare_exchange(0, -result, Ordering::AcqRel, Ordering::Acquire);
            debug!(
                "Connection {}: send failed: {}",
                self.id,
                IoFault::from_code(result)
            );
        }
        self.outstanding_sends.fetch_sub(1, Ordering::SeqCst);
        self.try_finalize();
    }

    fn advance(&self, chain: &mut ReceiveChain) -> Result<(), IoFault> {
        if chain.terminal.is_none() && self.is_closed() {
            chain.terminal = Some(-libc::ECANCELED);
        }
        while !chain.busy {
            let index = chain.cursor;
            let slot = &self.receive_slots[index];
            if !slot.is_armed() {
                break;
            }
            chain.cursor = (index + 1) & RECEIVE_MASK;
            if let Some(result) = chain.terminal {
                slot.complete(result, index as i32);
                continue;
            }
            slot.begin();
            chain.busy = true;
            if let Err(fault) = self.submit_receive(slot, index) {
                chain.busy = false;
                let result = -fault.code().unwrap_or(libc::EIO);
                chain.terminal = Some(result);
                slot.complete(result, index as i32);
                return Err(fault);
            }
        }
        Ok(())
    }

    fn submit_receive(&self, slot: &ReceiveSlot, index: usize) -> Result<(), IoFault> {
        let segment = slot.segment();
        let user_data = Correlation::receive(self.id, index).pack_user_data();
        let entry = unsafe {
            match segment.buf_index() {
                Some(buf_index) => recv_fixed(
                    self.fd(),
                    user_data,
                    segment.as_ptr(),
                    segment.len() as u32,
                    buf_index,
                ),
                None => recv(self.fd(), user_data, segment.as_ptr(), segment.len() as u32),
            }
        };
        let ring = self.reactor.ring();
        ring.push(&entry)?;
        // Once queued the reactor's next wait submits it regardless.
        if let Err(fault) = ring.commit() {
            debug!("Connection {}: receive commit deferred: {}", self.id, fault);
        }
        Ok(())
    }

    /// Pushes one run as a single linked chain: every send but the last
    /// carries MSG_MORE and links to the next. The run goes in under one
    /// submit lock hold, so the chain never reaches another connection's SQEs.
    fn issue_run(&self, parts: &[SendPart]) -> Result<(), IoFault> {
        let ring = self.reactor.ring();
        if parts.is_empty() {
            return ring.commit();
        }
        let last = parts.len() - 1;
        let entries: Vec<squeue::Entry> = parts
            .iter()
            .enumerate()
            .map(|(at, part)| {
                let user_data = Correlation::send(self.id, part.slot).pack_user_data();
                unsafe { send(self.fd(), user_data, part.data, part.len as u32, at != last) }
            })
            .collect();
        for part in parts {
            self.send_in_flight[part.slot].store(true, Ordering::Release);
        }
        self.outstanding_sends.fetch_add(parts.len(), Ordering::SeqCst);
        if let Err(fault) = ring.push_run(&entries) {
            for part in parts {
                self.send_in_flight[part.slot].store(false, Ordering::Release);
            }
            self.outstanding_sends.fetch_sub(parts.len(), Ordering::SeqCst);
            return Err(fault);
        }
        ring.commit()
    }

    fn send_cached(&self, response: &CachedResponse) -> Result<(), IoFault> {
        self.check_send_failure()?;
        let ring = self.reactor.ring();
        let user_data = Correlation {
            connection_id: self.id,
            request: CACHED_SEND,
        }
        .pack_user_data();
        self.outstanding_sends.fetch_add(1, Ordering::SeqCst);
        // The reactor, and with it the cached segment, outlives this connection.
        let entry = unsafe {
            send(self.fd(), user_data, response.as_ptr(), response.len() as u32, false)
        };
        if let Err(fault) = ring.push(&entry) {
            self.outstanding_sends.fetch_sub(1, Ordering::SeqCst);
            return Err(fault);
        }
        ring.commit()
    }

    fn check_send_failure(&self) -> Result<(), IoFault> {
        match self.send_failure.load(Ordering::Acquire) {
            0 => Ok(()),
            code => Err(IoFault::from_code(code)),
        }
    }

    /// Leaves the reactor's map once closed and drained. The socket and the
    /// segments go when the last `Arc` does.
    fn try_finalize(&self) {
        if !self.is_closed() {
            return;
        }
        if self.chain.lock().busy || self.outstanding_sends.load(Ordering::SeqCst) != 0 {
            return;
        }
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reactor.deregister(self.id);
        debug!("Connection {} drained and deregistered", self.id);
    }
}

impl RequestQueue for Connection {
    #[inline(always)]
    fn receive_slot(&self, index: usize) -> &ReceiveSlot {
        &self.receive_slots[index & RECEIVE_MASK]
    }

    #[inline(always)]
    fn next_receive_index(&self) -> usize {
        self.receives.fetch_add(1, Ordering::AcqRel) & RECEIVE_MASK
    }

    fn post_receive(&self, index: usize) -> Result<(), IoFault> {
        self.receive_slots[index & RECEIVE_MASK].arm();
        let mut chain = self.chain.lock();
        self.advance(&mut chain)
    }

    fn queue_send(&self, data: &[u8], is_end: bool) -> Result<(), IoFault> {
        self.check_send_failure()?;
        let mut ring = self.send_ring.lock();
        ring.queue(data, is_end, &self.send_in_flight, |parts| self.issue_run(parts))
    }

    fn flush_sends(&self) -> Result<(), IoFault> {
        self.check_send_failure()?;
        let mut ring = self.send_ring.lock();
        ring.flush(|parts| self.issue_run(parts))
    }

    fn send_cached_bad(&self) -> Result<(), IoFault> {
        self.send_cached(self.reactor.cached_bad())
    }

    fn send_cached_busy(&self) -> Result<(), IoFault> {
        self.send_cached(self.reactor.cached_busy())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("Connection {} closing", self.id);
        // Staged segments go out before the FIN.
        if let Err(fault) = self.flush_sends() {
            debug!("Connection {}: final flush failed: {}", self.id, fault);
        }
        if let Err(err) = shutdown_socket(&self.socket) {
            trace!("Connection {}: shutdown: {}", self.id, err);
        }
        {
            let mut chain = self.chain.lock();
            // Poisons the chain; armed slots complete locally from here on.
            let _ = self.advance(&mut chain);
        }
        self.try_finalize();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        trace!("Connection {} released", self.id);
    }
}
