//! In-memory request queue for exercising consumers without a ring.

use crate::library::rio::{
    MAX_PENDING_RECEIVES, RECEIVE_MASK,
    buffer_pool::BufferPool,
    error::IoFault,
    receive::ReceiveSlot,
    request_queue::RequestQueue,
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
};

const SEGMENT_SIZE: usize = 8192 + 128;

/// What the "kernel" hands to the next posted slot.
pub(crate) enum Read {
    Data(Vec<u8>),
    Eof,
    Fault(i32),
}

impl Read {
    pub(crate) fn data(bytes: &[u8]) -> Read {
        Read::Data(bytes.to_vec())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SentChunk {
    pub bytes: Vec<u8>,
    pub is_end: bool,
}

#[derive(Default)]
struct Script {
    reads: VecDeque<Read>,
    posted: VecDeque<usize>,
    last_posted: Option<usize>,
    sends: Vec<SentChunk>,
    flushes: usize,
    bad_responses: usize,
    closed: usize,
    events: Vec<&'static str>,
}

/// Posted slots are served strictly in the order they were posted, one
/// scripted read each.
pub(crate) struct ScriptedQueue {
    slots: Vec<ReceiveSlot>,
    receives: AtomicUsize,
    script: Mutex<Script>,
}

impl ScriptedQueue {
    pub(crate) fn new(reads: impl IntoIterator<Item = Read>) -> ScriptedQueue {
        let pool = BufferPool::new(SEGMENT_SIZE, MAX_PENDING_RECEIVES).unwrap();
        let slots = (0..MAX_PENDING_RECEIVES)
            .map(|_| ReceiveSlot::new(pool.get_segment().unwrap()))
            .collect();
        let queue = ScriptedQueue {
            slots,
            receives: AtomicUsize::new(0),
            script: Mutex::new(Script {
                reads: reads.into_iter().collect(),
                ..Script::default()
            }),
        };
        for index in 0..MAX_PENDING_RECEIVES {
            queue.post_receive(index).unwrap();
        }
        queue
    }

    pub(crate) fn feed(&self, read: Read) {
        self.feed_many([read]);
    }

    pub(crate) fn feed_many(&self, reads: impl IntoIterator<Item = Read>) {
        let mut script = self.script.lock();
        script.reads.extend(reads);
        self.pump(&mut script);
    }

    fn pump(&self, script: &mut Script) {
        while !script.reads.is_empty() && !script.posted.is_empty() {
            let (Some(read), Some(index)) = (script.reads.pop_front(), script.posted.pop_front())
            else {
                break;
            };
            let slot = &self.slots[index];
            let result = match read {
                Read::Data(bytes) => {
                    let count = bytes.len().min(slot.segment().len());
                    unsafe {
                        std::ptr::copy_nonoverlapping(bytes.as_ptr(), slot.segment().as_ptr(), count)
                    };
                    count as i32
                }
                Read::Eof => 0,
                Read::Fault(code) => -code,
            };
            slot.complete(result, index as i32);
        }
    }

    pub(crate) fn sends(&self) -> Vec<SentChunk> {
        self.script.lock().sends.clone()
    }

    pub(crate) fn sent_bytes(&self) -> Vec<u8> {
        self.script
            .lock()
            .sends
            .iter()
            .flat_map(|chunk| chunk.bytes.iter().copied())
            .collect()
    }

    pub(crate) fn flushes(&self) -> usize {
        self.script.lock().flushes
    }

    pub(crate) fn bad_responses(&self) -> usize {
        self.script.lock().bad_responses
    }

    pub(crate) fn closed(&self) -> usize {
        self.script.lock().closed
    }

    /// Calls into the queue in order: "send", "flush", "bad", "busy", "close".
    pub(crate) fn events(&self) -> Vec<&'static str> {
        self.script.lock().events.clone()
    }

    pub(crate) fn posted_last(&self) -> Option<usize> {
        self.script.lock().last_posted
    }
}

impl RequestQueue for ScriptedQueue {
    fn receive_slot(&self, index: usize) -> &ReceiveSlot {
        &self.slots[index & RECEIVE_MASK]
    }

    fn next_receive_index(&self) -> usize {
        self.receives.fetch_add(1, Ordering::AcqRel) & RECEIVE_MASK
    }

    fn post_receive(&self, index: usize) -> Result<(), IoFault> {
        let mut script = self.script.lock();
        self.slots[index].arm();
        script.posted.push_back(index);
        script.last_posted = Some(index);
        self.pump(&mut script);
        Ok(())
    }

    fn queue_send(&self, data: &[u8], is_end: bool) -> Result<(), IoFault> {
        let mut script = self.script.lock();
        script.sends.push(SentChunk {
            bytes: data.to_vec(),
            is_end,
        });
        script.events.push("send");
        Ok(())
    }

    fn flush_sends(&self) -> Result<(), IoFault> {
        let mut script = self.script.lock();
        script.flushes += 1;
        script.events.push("flush");
        Ok(())
    }

    fn send_cached_bad(&self) -> Result<(), IoFault> {
        let mut script = self.script.lock();
        script.bad_responses += 1;
        script.events.push("bad");
        Ok(())
    }

    fn send_cached_busy(&self) -> Result<(), IoFault> {
        let mut script = self.script.lock();
        script.events.push("busy");
        Ok(())
    }

    fn close(&self) {
        let mut script = self.script.lock();
        script.closed += 1;
        script.events.push("close");
    }
}
