#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::{
    __m128i, _mm_and_si128, _mm_cmpeq_epi8, _mm_loadu_si128, _mm_movemask_epi8, _mm_set1_epi8,
};

// Welcome to the hot path. Every pipelined request on every connection goes
// through here, so it counts terminators and nothing else.

pub const TERMINATOR: &[u8; 4] = b"\r\n\r\n";

/// Bytes skipped past the start of a terminator before scanning resumes.
///
/// A request is at least a request line (`GET / HTTP/1.1` is 14 bytes) plus
/// its own terminator, so no second terminator can start within 16 bytes of
/// the first. Inherited assumption, not a checked invariant: a client that
/// sends a shorter "request" gets fewer responses than terminators.
pub const MIN_REQUEST_GAP: usize = 16;

#[cfg(target_arch = "x86_64")]
const LANES: usize = 16;

/// Terminators found in one pass and where the last one ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminatorScan {
    pub count: usize,
    /// Offset right after the last terminator, or the start offset if none.
    pub resume: usize,
}

#[inline(always)]
pub fn scan_terminators(buffer: &[u8], start: usize) -> TerminatorScan {
    let mut scan = TerminatorScan {
        count: 0,
        resume: start,
    };
    #[cfg(target_arch = "x86_64")]
    let position = unsafe { scan_sse2(buffer, start, &mut scan) };
    #[cfg(not(target_arch = "x86_64"))]
    let position = start;
    scan_scalar(buffer, position, &mut scan);
    scan
}

/// SSE2 is part of the x86_64 baseline, so no runtime detection is needed.
///
/// Four loads at offsets 0..3 line every candidate start position up with
/// `\r \n \r \n`; the AND of the four compares has a bit set exactly where a
/// full terminator starts. Returns where the vector loop stopped.
#[cfg(target_arch = "x86_64")]
#[inline(always)]
unsafe fn scan_sse2(buffer: &[u8], mut i: usize, scan: &mut TerminatorScan) -> usize {
    let len = buffer.len();
    let ptr = buffer.as_ptr();
    let cr = _mm_set1_epi8(b'\r' as i8);
    let lf = _mm_set1_epi8(b'\n' as i8);
    // The offset-3 load reads up to i + 19.
    while i + LANES + 3 <= len {
        let v0 = _mm_loadu_si128(ptr.add(i) as *const __m128i);
        let v1 = _mm_loadu_si128(ptr.add(i + 1) as *const __m128i);
        let pairs = _mm_movemask_epi8(_mm_and_si128(
            _mm_cmpeq_epi8(v0, cr),
            _mm_cmpeq_epi8(v1, lf),
        )) as u32;
        // No "\r\n" anywhere in this stride. The common case inside headers.
        if pairs == 0 {
            i += LANES;
            continue;
        }
        let v2 = _mm_loadu_si128(ptr.add(i + 2) as *const __m128i);
        let v3 = _mm_loadu_si128(ptr.add(i + 3) as *const __m128i);
        let hits = pairs
            & _mm_movemask_epi8(_mm_and_si128(
                _mm_cmpeq_epi8(v2, cr),
                _mm_cmpeq_epi8(v3, lf),
            )) as u32;
        if hits == 0 {
            i += LANES;
            continue;
        }
        let at = i + hits.trailing_zeros() as usize;
        scan.count += 1;
        scan.resume = at + TERMINATOR.len();
        i = at + MIN_REQUEST_GAP;
    }
    i
}

/// Leftover tail, and everything on targets without SSE2.
#[inline(always)]
fn scan_scalar(buffer: &[u8], mut i: usize, scan: &mut TerminatorScan) {
    let len = buffer.len();
    while i + TERMINATOR.len() <= len {
        let Some(offset) = memchr::memchr(b'\r', &buffer[i..len - 3]) else {
            break;
        };
        let at = i + offset;
        if &buffer[at..at + 4] == TERMINATOR {
            scan.count += 1;
            scan.resume = at + TERMINATOR.len();
            i = at + MIN_REQUEST_GAP;
        } else {
            i = at + 1;
        }
    }
}

/// Length of the longest terminator prefix the buffer ends with (0..=3).
#[inline(always)]
pub fn trailing_partial(tail: &[u8]) -> usize {
    (1..TERMINATOR.len())
        .rev()
        .find(|&k| tail.ends_with(&TERMINATOR[..k]))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] = b"GET /plaintext HTTP/1.1\r\nHost: localhost\r\nAccept: */*\r\n\r\n";

    fn scalar_only(buffer: &[u8]) -> TerminatorScan {
        let mut scan = TerminatorScan { count: 0, resume: 0 };
        scan_scalar(buffer, 0, &mut scan);
        scan
    }

    #[test]
    fn counts_every_pipelined_request() {
        for n in 0..40 {
            let buffer = REQUEST.repeat(n);
            let scan = scan_terminators(&buffer, 0);
            assert_eq!(scan.count, n, "{n} requests");
            assert_eq!(scan.resume, buffer.len());
        }
    }

    #[test]
    fn vector_and_scalar_paths_agree() {
        let mut buffer = Vec::new();
        for pad in 0..24 {
            buffer.extend_from_slice(&b"GET /a HTTP/1.1\r\nX-Pad: "[..]);
            buffer.extend(std::iter::repeat_n(b'p', pad));
            buffer.extend_from_slice(b"\r\n\r\n");
        }
        for cut in 0..buffer.len() {
            let slice = &buffer[..cut];
            assert_eq!(scan_terminators(slice, 0), scalar_only(slice), "cut at {cut}");
        }
    }

    #[test]
    fn lone_line_breaks_are_not_terminators() {
        let buffer = b"GET / HTTP/1.1\r\nHost: a\r\nX: \r\r\n\n\r\n\rjunk";
        assert_eq!(scan_terminators(buffer, 0).count, 0);
    }

    #[test]
    fn terminator_at_every_lane_position() {
        for at in 0..48 {
            let mut buffer = vec![b'a'; 64];
            buffer[at..at + 4].copy_from_slice(TERMINATOR);
            let scan = scan_terminators(&buffer, 0);
            assert_eq!(scan.count, 1, "terminator at {at}");
            assert_eq!(scan.resume, at + 4);
        }
    }

    #[test]
    fn terminators_closer_than_the_gap_count_once() {
        // Two terminators 8 bytes apart: shorter than any real request.
        let buffer = b"GET\r\n\r\nGET\r\n\r\n________________________";
        assert_eq!(scan_terminators(buffer, 0).count, 1);
    }

    #[test]
    fn start_offset_is_honoured() {
        let mut buffer = REQUEST.to_vec();
        buffer.extend_from_slice(REQUEST);
        let scan = scan_terminators(&buffer, REQUEST.len());
        assert_eq!(scan.count, 1);
        assert_eq!(scan.resume, buffer.len());
    }

    #[test]
    fn trailing_prefixes() {
        assert_eq!(trailing_partial(b"abc"), 0);
        assert_eq!(trailing_partial(b"abc\r"), 1);
        assert_eq!(trailing_partial(b"abc\r\n"), 2);
        assert_eq!(trailing_partial(b"abc\r\n\r"), 3);
        assert_eq!(trailing_partial(b"\n"), 0);
        assert_eq!(trailing_partial(b""), 0);
    }
}
