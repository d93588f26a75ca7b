//! Orion2 frame reassembly.
//!
//! Frames are delimited by the marker byte `0xFF`. Literal `0xFF`/`0xFE`
//! payload bytes are byte-stuffed on the wire as the two-byte escapes
//! `FE 01` and `FE 02`, so between markers the marker byte is unambiguous.

/// Frame delimiter.
pub const MARKER: u8 = 0xff;
/// Escape prefix for byte-stuffed payload bytes.
pub const ESCAPE: u8 = 0xfe;

/// Substitute byte-stuffing escapes: `FE 01` becomes `FF`, `FE 02` becomes
/// `FE`. An escape prefix followed by anything else is passed through
/// unchanged.
#[must_use]
pub fn unstuff(dat: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(dat.len());
    let mut i = 0;
    while i < dat.len() {
        if dat[i] == ESCAPE && i + 1 < dat.len() {
            match dat[i + 1] {
                0x01 => {
                    out.push(MARKER);
                    i += 2;
                    continue;
                }
                0x02 => {
                    out.push(ESCAPE);
                    i += 2;
                    continue;
                }
                _ => {}
            }
        }
        out.push(dat[i]);
        i += 1;
    }
    out
}

/// Accumulates byte chunks and carves off one frame at a time.
///
/// A frame candidate is everything up to the next occurrence of [MARKER] at
/// an offset of at least 2; the first two bytes of a pending frame are its
/// own leading marker and the address byte and must not terminate it. Frames
/// handed out have already been unstuffed, and a zero-length frame is never
/// produced.
///
/// Bytes already emitted as part of a frame are never re-read.
#[derive(Default)]
pub struct Reassembler {
    buf: Vec<u8>,
}

impl Reassembler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk of raw stream bytes.
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Carve the next complete frame off the front of the buffer, or `None`
    /// if no frame boundary is present yet (more data is needed).
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        let start = if self.buf.len() > 2 { 2 } else { 0 };
        let pos = self.buf[start..]
            .iter()
            .position(|&b| b == MARKER)
            .map(|p| p + start)?;
        if pos == 0 {
            // Buffer starts at a marker with nothing before it; the frame is
            // still accumulating.
            return None;
        }
        let frame: Vec<u8> = self.buf.drain(..pos).collect();
        Some(unstuff(&frame))
    }

    /// Number of buffered bytes not yet carved into a frame.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Discard any partially-accumulated frame.
    pub fn clear(&mut self) {
        self.buf.clear();
    }
}
