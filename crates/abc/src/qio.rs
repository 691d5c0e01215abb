use crate::buf::BufId;

/// A queued async I/O request, drained one at a time by the background
/// worker thread. At most one `Qio` per buf is ever outstanding — enforced
/// by the `busy` flag set when the request is queued.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Qio {
    /// Read whatever sectors are missing to make the whole extent valid.
    FillBuf(BufId),
    /// Write dirty sectors back (whole extent, or just sector 0 if that is
    /// all that was ever dirtied).
    FlushBuf(BufId),
}

/// Depth of the QIO channel. An enqueue blocks once this many requests are
/// outstanding, mirroring the original's fixed-size ring.
pub const QIO_RING_DEPTH: usize = 32;
