use crate::library::{
    responses::{BODY, HeaderCache},
    rio::{connection::Connection, error::IoFault, request_queue::RequestQueue},
    utils::http::{TERMINATOR, scan_terminators, trailing_partial},
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Receive buffers handed to the queue, two of them in rotation.
pub const RECEIVE_BUFFER_SIZE: usize = 8192 + 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseMode {
    /// Last read ended exactly on a request boundary.
    #[default]
    StartLine,
    /// Last read ended inside a request's header block.
    Headers,
}

/// What carries over from one read to the next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingRequestState {
    pub mode: ParseMode,
    /// Bytes (0..=3) of a terminator the previous read ended with.
    pub overflow: usize,
}

/// Counts complete requests per read, carrying a split `\r\n\r\n` across reads.
#[derive(Debug, Default)]
pub struct PipelineParser {
    state: PendingRequestState,
}

impl PipelineParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> PendingRequestState {
        self.state
    }

    /// Number of requests completed by `buffer`.
    pub fn scan(&mut self, buffer: &[u8]) -> usize {
        let mut count: usize = 0;
        let mut start: usize = 0;
        let overflow = self.state.overflow;
        if overflow > 0 {
            // The partial terminator from the previous read goes first.
            let needed = &TERMINATOR[overflow..];
            let available = needed.len().min(buffer.len());
            if buffer[..available] == needed[..available] {
                if available == needed.len() {
                    count += 1;
                    start = available;
                } else {
                    // Still not whole: the read was shorter than the rest of it.
                    self.state.overflow += available;
                    return 0;
                }
            }
            self.state.overflow = 0;
        }
        let scan = scan_terminators(buffer, start);
        count += scan.count;
        let tail = &buffer[scan.resume..];
        self.state.overflow = trailing_partial(tail);
        self.state.mode = if tail.is_empty() {
            ParseMode::StartLine
        } else {
            ParseMode::Headers
        };
        trace!("Pipeline: {} requests, state {:?}", count, self.state);
        count
    }
}

/// How a serve loop ended when nothing went wrong.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Peer sent FIN. `flushed` is set when buffered sends were pushed out first.
    PeerClosed { flushed: bool },
    /// A read carried no complete request; the cached 400 went out.
    Malformed,
}

/// Reads pipelined requests from `queue` and answers each with the canned 200.
///
/// The next receive is claimed before the current buffer is processed, so its
/// completion state tells whether more pipelined data is already waiting; the
/// batch is only committed when it is not. Does not close the queue.
pub async fn serve<Q: RequestQueue>(queue: &Q, headers: &HeaderCache) -> Result<ServeOutcome, IoFault> {
    let mut parser = PipelineParser::new();
    let mut spare: Vec<u8> = vec![0; RECEIVE_BUFFER_SIZE];
    let mut pending = queue.receive_async(vec![0u8; RECEIVE_BUFFER_SIZE]);
    let mut reads: usize = 0;
    loop {
        let (filled, result) = pending.await;
        let received = result?;
        pending = queue.receive_async(spare);

        if received == 0 {
            if reads > 0 {
                queue.flush_sends()?;
                return Ok(ServeOutcome::PeerClosed { flushed: true });
            }
            return Ok(ServeOutcome::PeerClosed { flushed: false });
        }

        let requests = parser.scan(&filled[..received]);
        if requests == 0 {
            // A held batch goes out ahead of the 400, never behind it.
            if reads > 0 {
                queue.flush_sends()?;
            }
            queue.send_cached_bad()?;
            return Ok(ServeOutcome::Malformed);
        }

        let header = headers.header();
        for _ in 1..requests {
            queue.queue_send(&header, false)?;
            queue.queue_send(BODY, false)?;
        }
        queue.queue_send(&header, false)?;
        // More pipelined data already here: skip the commit, the next batch carries it.
        queue.queue_send(BODY, !pending.is_completed())?;

        reads += 1;
        spare = filled;
    }
}

/// Owns a connection for its whole life: serves it, then closes it on every path.
pub async fn serve_connection(connection: Arc<Connection>) {
    let headers = connection.reactor().headers();
    match serve(connection.as_ref(), headers).await {
        Ok(outcome) => debug!("Connection {}: {:?}", connection.id(), outcome),
        Err(fault) => debug!("Connection {}: {}", connection.id(), fault),
    }
    connection.close();
}
