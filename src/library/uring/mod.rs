pub mod kernel_cmds;

use crate::library::rio::error::IoFault;
use io_uring::{Builder, IoUring, Probe, cqueue, opcode, squeue}; // The magic portal to kernel-space IO wizardry.
use parking_lot::Mutex;
use std::{io, thread};
use tracing::{info, trace};

/// Submit attempts while waiting for SQ space before giving up on a push.
const SUBMIT_RETRIES: usize = 1024;

/// One completion record copied out of the CQ.
#[derive(Debug, Clone, Copy, Default)]
pub struct Completion {
    pub user_data: u64,
    pub result: i32,
}

/// A reactor-owned ring. Any thread may push and submit; only the reactor
/// thread may wait on and drain the completion side.
pub struct Ring {
    uring: IoUring<squeue::Entry, cqueue::Entry>,
    // Tokio workers and the reactor all push SQEs, so the submission side
    // cannot be single issuer. One lock, held for a push and nothing else.
    submit_lock: Mutex<()>,
}

// Submission goes through `submit_lock`; completion is only touched by the owning reactor.
unsafe impl Send for Ring {}
unsafe impl Sync for Ring {}

impl Ring {
    pub fn new(size: u32) -> io::Result<Ring> {
        let mut builder: Builder = IoUring::builder();
        // Every connection can have one receive and a full send ring in
        // flight, give completions twice the room submissions get.
        builder.setup_cqsize(size.saturating_mul(2));
        // Keep submitting the rest of a batch when one SQE fails.
        builder.setup_submit_all();
        let uring: IoUring<squeue::Entry, cqueue::Entry> = builder.build(size)?;
        info!("Ring ready: {} SQ entries", size);
        Ok(Ring {
            uring,
            submit_lock: Mutex::new(()),
        })
    }

    /// Queues an SQE without entering the kernel. Nothing happens until
    /// someone commits.
    pub fn push(&self, entry: &squeue::Entry) -> Result<(), IoFault> {
        self.push_run(std::slice::from_ref(entry))
    }

    /// Queues `entries` back to back, with no other thread's SQE in between.
    /// A linked chain pushed this way can only ever link its own entries.
    pub fn push_run(&self, entries: &[squeue::Entry]) -> Result<(), IoFault> {
        let _guard = self.submit_lock.lock();
        unsafe {
            let mut sq = self.uring.submission_shared();
            if entries.len() > sq.capacity() {
                return Err(IoFault::from_code(libc::EINVAL));
            }
            if sq.capacity() - sq.len() < entries.len() {
                drop(sq);
                self.make_room(entries.len())?;
                sq = self.uring.submission_shared();
            }
            sq.push_multiple(entries)
                .map_err(|_| IoFault::from_code(libc::EBUSY))?;
            sq.sync();
        }
        Ok(())
    }

    /// Submits until `needed` SQ entries are free. The kernel may refuse with
    /// EBUSY while the reactor catches up on completions, so keep asking.
    fn make_room(&self, needed: usize) -> Result<(), IoFault> {
        for _ in 0..SUBMIT_RETRIES {
            match self.uring.submit() {
                Ok(_) => {}
                Err(err) if is_transient(&err) => {
                    trace!("SQ full, kernel busy: {}", err);
                    thread::yield_now();
                }
                Err(err) => return Err(err.into()),
            }
            let sq = unsafe { self.uring.submission_shared() };
            if sq.capacity() - sq.len() >= needed {
                return Ok(());
            }
        }
        Err(IoFault::from_code(libc::EBUSY))
    }

    pub fn push_and_commit(&self, entry: &squeue::Entry) -> Result<(), IoFault> {
        self.push(entry)?;
        self.commit()
    }

    /// Submits whatever is queued. Busy or interrupted submissions are not
    /// failures: the entries stay queued and the reactor's next wait takes them.
    pub fn commit(&self) -> Result<(), IoFault> {
        match self.uring.submit() {
            Ok(_) => Ok(()),
            Err(err) if is_transient(&err) => {
                trace!("Deferred commit: {}", err);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Submits pending entries and blocks until at least one completion lands.
    pub fn wait(&self) -> io::Result<usize> {
        self.uring.submit_and_wait(1)
    }

    /// Copies up to `batch.len()` completions and releases their CQ slots right
    /// away, so the kernel can post new ones while we dispatch these.
    ///
    /// # Safety
    /// Only the thread that owns this ring's completion side may call this.
    pub unsafe fn drain(&self, batch: &mut [Completion]) -> usize {
        let mut cq = self.uring.completion_shared();
        let mut count: usize = 0;
        while count < batch.len() {
            match cq.next() {
                Some(cqe) => {
                    batch[count] = Completion {
                        user_data: cqe.user_data(),
                        result: cqe.result(),
                    };
                    count += 1;
                }
                None => break,
            }
        }
        cq.sync();
        count
    }

    /// # Safety
    /// Every iovec must stay valid until `unregister_buffers` or ring drop.
    pub unsafe fn register_buffers(&self, iovecs: &[libc::iovec]) -> io::Result<()> {
        self.uring.submitter().register_buffers(iovecs)
    }

    pub fn unregister_buffers(&self) -> io::Result<()> {
        self.uring.submitter().unregister_buffers()
    }

    /// Whether the running kernel knows every opcode the server issues.
    pub fn supports_socket_io(&self) -> bool {
        let mut probe = Probe::new();
        if self.uring.submitter().register_probe(&mut probe).is_err() {
            return false;
        }
        probe.is_supported(opcode::Recv::CODE)
            && probe.is_supported(opcode::ReadFixed::CODE)
            && probe.is_supported(opcode::Send::CODE)
    }
}

/// Errors a wait or submit may return without anything being wrong with the ring.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY) | Some(libc::ETIME)
    )
}
