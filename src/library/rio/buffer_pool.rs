use crate::library::{rio::error::IoFault, uring::Ring};
use crossbeam::queue::ArrayQueue;
use std::{
    io,
    ptr::{self, NonNull},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};
use tracing::{debug, info, warn};

/// Registered buffers are capped at 1 GiB each by the kernel.
const MAX_REGISTERED_LEN: usize = 1 << 30;

/// Anonymous, page-aligned mapping that stays pinned for as long as it lives.
struct Arena {
    base: NonNull<u8>,
    len: usize,
    locked: bool,
}

// The arena is plain memory; who may touch which byte is decided by segment ownership.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    fn map(len: usize) -> Result<Arena, IoFault> {
        let raw = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_POPULATE,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        let base = NonNull::new(raw.cast::<u8>()).ok_or(IoFault::from_code(libc::ENOMEM))?;
        // Pinning is best effort: an unprivileged process usually has a tiny
        // RLIMIT_MEMLOCK, and the arena still works, it just may be paged.
        let locked = unsafe { libc::mlock(raw, len) } == 0;
        if !locked {
            warn!(
                "mlock of {} byte arena refused ({}), running unpinned",
                len,
                io::Error::last_os_error()
            );
        }
        Ok(Arena { base, len, locked })
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        unsafe {
            if self.locked {
                libc::munlock(self.base.as_ptr().cast(), self.len);
            }
            libc::munmap(self.base.as_ptr().cast(), self.len);
        }
    }
}

struct PoolShared {
    arena: Arena,
    chunk_size: usize,
    capacity: usize,
    free: ArrayQueue<u32>,
    registered: AtomicBool,
}

impl PoolShared {
    fn release(&self, index: u32) {
        // The queue holds exactly `capacity` slots and every index is handed
        // out at most once, so there is always room to give it back.
        if self.free.push(index).is_err() {
            warn!("segment {} released into a full pool", index);
        }
    }
}

/// Fixed-capacity pool of equally sized segments carved out of one pinned arena.
///
/// There is no growth: once every segment is out, `get_segment` fails with
/// [`IoFault::PoolExhausted`] and the caller has to size the pool properly.
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(chunk_size: usize, segment_count: usize) -> Result<BufferPool, IoFault> {
        let len = chunk_size
            .checked_mul(segment_count)
            .filter(|len| *len > 0 && *len <= u32::MAX as usize)
            .ok_or(IoFault::from_code(libc::EINVAL))?;
        let arena = Arena::map(len)?;
        let free = ArrayQueue::new(segment_count);
        for index in 0..segment_count as u32 {
            let _ = free.push(index);
        }
        debug!(
            "Buffer pool: {} segments x {} bytes ({} bytes pinned: {})",
            segment_count, chunk_size, len, arena.locked
        );
        Ok(BufferPool {
            shared: Arc::new(PoolShared {
                arena,
                chunk_size,
                capacity: segment_count,
                free,
                registered: AtomicBool::new(false),
            }),
        })
    }

    /// Registers the whole arena with `ring` as fixed buffer 0. Safe to call
    /// more than once; only the first call talks to the kernel.
    ///
    /// A refused registration is not fatal: receives fall back to plain `recv`
    /// into the same memory.
    pub fn initialize(&self, ring: &Ring) {
        let shared = &self.shared;
        if shared.registered.load(Ordering::Acquire) {
            return;
        }
        if shared.arena.len > MAX_REGISTERED_LEN {
            warn!(
                "arena of {} bytes is over the registration limit, using plain receives",
                shared.arena.len
            );
            return;
        }
        let iovec = libc::iovec {
            iov_base: shared.arena.base.as_ptr().cast(),
            iov_len: shared.arena.len,
        };
        // The arena outlives the registration: dispose() unregisters first, and
        // the reactor holding the ring also holds this pool.
        match unsafe { ring.register_buffers(&[iovec]) } {
            Ok(()) => {
                shared.registered.store(true, Ordering::Release);
                info!("Registered {} byte arena with the ring", shared.arena.len);
            }
            Err(err) => warn!("buffer registration refused ({}), using plain receives", err),
        }
    }

    pub fn get_segment(&self) -> Result<Segment, IoFault> {
        let index = self.shared.free.pop().ok_or(IoFault::PoolExhausted {
            capacity: self.shared.capacity,
        })?;
        Ok(Segment {
            pool: Arc::clone(&self.shared),
            index,
            offset: index * self.shared.chunk_size as u32,
            length: self.shared.chunk_size as u32,
        })
    }

    /// Returns a segment early. Dropping it does the same.
    pub fn release(&self, segment: Segment) {
        debug_assert!(Arc::ptr_eq(&self.shared, &segment.pool));
        drop(segment);
    }

    /// Unregisters the arena. Every segment must be back in the pool first;
    /// unpinning happens when the last owner of the arena goes away.
    pub fn dispose(&self, ring: &Ring) -> Result<(), IoFault> {
        let outstanding = self.outstanding();
        if outstanding != 0 {
            return Err(IoFault::SegmentsOutstanding { outstanding });
        }
        if self.shared.registered.swap(false, Ordering::AcqRel) {
            ring.unregister_buffers()?;
        }
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn chunk_size(&self) -> usize {
        self.shared.chunk_size
    }

    pub fn available(&self) -> usize {
        self.shared.free.len()
    }

    pub fn outstanding(&self) -> usize {
        self.shared.capacity - self.shared.free.len()
    }

    pub fn is_registered(&self) -> bool {
        self.shared.registered.load(Ordering::Acquire)
    }
}

/// One fixed-size window into the pool's arena. Goes back to the free list on drop.
pub struct Segment {
    pool: Arc<PoolShared>,
    index: u32,
    offset: u32,
    length: u32,
}

impl Segment {
    #[inline(always)]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline(always)]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.length as usize
    }

    /// Address handed to the kernel in SQEs.
    #[inline(always)]
    pub fn as_ptr(&self) -> *mut u8 {
        unsafe { self.pool.arena.base.as_ptr().add(self.offset as usize) }
    }

    /// Fixed-buffer index to use with `READ_FIXED`, if the arena is registered.
    #[inline(always)]
    pub fn buf_index(&self) -> Option<u16> {
        self.pool.registered.load(Ordering::Acquire).then_some(0)
    }

    /// # Safety
    /// No kernel operation may be writing into this segment.
    #[inline(always)]
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.as_ptr(), self.len())
    }

    /// # Safety
    /// No kernel operation may be reading from or writing into this segment.
    #[inline(always)]
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.as_ptr(), self.len())
    }

    pub fn dispose(self) {
        drop(self);
    }
}

impl Drop for Segment {
    fn drop(&mut self) {
        self.pool.release(self.index);
    }
}
