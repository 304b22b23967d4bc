use crate::library::{
    responses::{BAD_REQUEST, BUSY, HeaderCache},
    rio::{
        MAX_RESULTS, PACKET_SIZE,
        buffer_pool::{BufferPool, Segment},
        connection::Connection,
        error::IoFault,
        pool_segments,
    },
    server_internals::Correlation,
    uring::{Completion, Ring, is_transient},
    utils::kernel::abort_on_fault,
};
use core_affinity::CoreId;
use dashmap::DashMap;
use std::{
    convert::Infallible,
    io,
    sync::Arc,
    thread::{self, JoinHandle},
};
use thread_priority::{ThreadBuilderExt, ThreadPriority};
use tracing::{error, info, trace, warn};

/// A canned response living in a reactor-owned segment, written once.
pub struct CachedResponse {
    segment: Segment,
    len: usize,
}

impl CachedResponse {
    fn write(mut segment: Segment, bytes: &[u8]) -> Result<Self, IoFault> {
        if bytes.len() > segment.len() {
            return Err(IoFault::from_code(libc::EMSGSIZE));
        }
        // Fresh from the pool, nobody else has seen it.
        let slice = unsafe { segment.as_mut_slice() };
        slice[..bytes.len()].copy_from_slice(bytes);
        Ok(Self {
            segment,
            len: bytes.len(),
        })
    }

    #[inline(always)]
    pub fn as_ptr(&self) -> *const u8 {
        self.segment.as_ptr()
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn as_bytes(&self) -> &[u8] {
        // Only ever read by the kernel after construction.
        unsafe { &self.segment.as_slice()[..self.len] }
    }
}

/// Work bundle of one reactor thread: its ring, the pool registered with that
/// ring, every connection it owns, and its per-worker response state.
pub struct Reactor {
    id: usize,
    // Field order is drop order: the ring (and its buffer registration) goes
    // before the arena it points into.
    ring: Ring,
    connections: DashMap<u32, Arc<Connection>>,
    cached_bad: CachedResponse,
    cached_busy: CachedResponse,
    headers: HeaderCache,
    pool: BufferPool,
}

impl Reactor {
    pub fn new(id: usize, ring: Ring, max_sockets: usize) -> Result<Arc<Reactor>, IoFault> {
        let pool = BufferPool::new(PACKET_SIZE, pool_segments(max_sockets))?;
        pool.initialize(&ring);
        let cached_bad = CachedResponse::write(pool.get_segment()?, BAD_REQUEST)?;
        let cached_busy = CachedResponse::write(pool.get_segment()?, BUSY)?;
        info!(
            "Reactor {}: {} segments for {} sockets (registered: {})",
            id,
            pool.capacity(),
            max_sockets,
            pool.is_registered()
        );
        Ok(Arc::new(Reactor {
            id,
            ring,
            connections: DashMap::new(),
            cached_bad,
            cached_busy,
            headers: HeaderCache::new(),
            pool,
        }))
    }

    #[inline(always)]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline(always)]
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    #[inline(always)]
    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    #[inline(always)]
    pub fn headers(&self) -> &HeaderCache {
        &self.headers
    }

    #[inline(always)]
    pub fn cached_bad(&self) -> &CachedResponse {
        &self.cached_bad
    }

    #[inline(always)]
    pub fn cached_busy(&self) -> &CachedResponse {
        &self.cached_busy
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub(crate) fn register(&self, connection: Arc<Connection>) {
        self.connections.insert(connection.id(), connection);
    }

    pub(crate) fn deregister(&self, id: u32) {
        self.connections.remove(&id);
    }

    /// Starts the completion thread. It never returns; a broken ring takes the
    /// process down with it.
    pub fn spawn(self: &Arc<Self>, realtime: bool, core: Option<CoreId>) -> io::Result<JoinHandle<()>> {
        let reactor = Arc::clone(self);
        let builder = thread::Builder::new().name(format!("Tachyon-RIO-{}", self.id));
        let body = move || {
            if let Some(core) = core {
                if core_affinity::set_for_current(core) {
                    info!("Reactor {} pinned to {:?}", reactor.id, core);
                } else {
                    error!("Failed to set core affinity");
                }
            }
            reactor.run()
        };
        if realtime {
            builder.spawn_with_priority(ThreadPriority::Max, move |priority| {
                if let Err(err) = priority {
                    warn!("Max thread priority refused: {:?}", err);
                }
                body()
            })
        } else {
            builder.spawn(body)
        }
    }

    fn run(&self) {
        info!("Reactor {} online", self.id);
        match self.process() {
            Ok(never) => match never {},
            Err(fault) => abort_on_fault(&format!(
                "reactor {}: completion wait failed: {}",
                self.id, fault
            )),
        }
    }

    fn process(&self) -> Result<Infallible, IoFault> {
        let mut batch: [Completion; MAX_RESULTS] = [Completion::default(); MAX_RESULTS];
        loop {
            // Sleep until the kernel has something for us. Pending SQEs ride along.
            if let Err(err) = self.ring.wait() {
                if !is_transient(&err) {
                    return Err(err.into());
                }
                trace!("Reactor {}: wait interrupted: {}", self.id, err);
            }
            loop {
                // CQ space is handed back before dispatch, so nothing posted
                // meanwhile can be lost.
                let count = unsafe { self.ring.drain(&mut batch) };
                if count == 0 {
                    break;
                }
                for completion in &batch[..count] {
                    self.dispatch(*completion);
                }
            }
        }
    }

    fn dispatch(&self, completion: Completion) {
        let correlation = Correlation::unpack_user_data(completion.user_data);
        // Clone out of the map: no shard lock is held while the connection works.
        let connection = self
            .connections
            .get(&correlation.connection_id)
            .map(|entry| Arc::clone(entry.value()));
        let Some(connection) = connection else {
            trace!(
                "Reactor {}: completion for gone connection {}",
                self.id, correlation.connection_id
            );
            return;
        };
        if correlation.request >= 0 {
            connection.complete_receive(correlation.request, completion.result);
        } else {
            connection.complete_send(correlation.request, completion.result);
        }
    }
}
