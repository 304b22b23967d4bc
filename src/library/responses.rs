use bytes::{BufMut, Bytes, BytesMut};
use nano_clock::nano_http_date;
use parking_lot::RwLock;

pub const BODY: &[u8] = b"Hello, World!";
/// "Date: Sun, 06 Nov 1994 08:49:37 GMT"
pub const DATE_LEN: usize = 35;

const SUCCESS_HEAD: &[u8] = b"HTTP/1.1 200 OK\r\n\
Server: Tachyon\r\n\
Content-Type: text/plain\r\n\
Content-Length: 13\r\n";

pub const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\
Server: Tachyon\r\n\
Connection: keep-alive\r\n\
Content-Length: 0\r\n\
\r\n";

pub const BUSY: &[u8] = b"HTTP/1.1 503 Service Unavailable\r\n\
Server: Tachyon\r\n\
Content-Type: text/plain\r\n\
Content-Length: 4\r\n\
\r\n\
Busy";

pub fn http_date() -> [u8; DATE_LEN] {
    let mut date: [u8; DATE_LEN] = [0; DATE_LEN];
    #[allow(unused_unsafe)]
    unsafe {
        nano_http_date(&mut date, false)
    };
    date
}

/// Status line and headers of the canned 200, up to and including the blank line.
pub fn render_header(date: &[u8; DATE_LEN]) -> Bytes {
    let mut block = BytesMut::with_capacity(SUCCESS_HEAD.len() + DATE_LEN + 4);
    block.put_slice(SUCCESS_HEAD);
    block.put_slice(date);
    block.put_slice(b"\r\n\r\n");
    block.freeze()
}

/// A reactor's copy of the 200 header block.
///
/// One timer renders the block once a second and publishes it to every
/// reactor; the write lock makes the new block visible to the next reader.
pub struct HeaderCache {
    current: RwLock<Bytes>,
}

impl HeaderCache {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(render_header(&http_date())),
        }
    }

    #[inline(always)]
    pub fn header(&self) -> Bytes {
        self.current.read().clone()
    }

    pub fn publish(&self, block: Bytes) {
        *self.current.write() = block;
    }
}

impl Default for HeaderCache {
    fn default() -> Self {
        Self::new()
    }
}
