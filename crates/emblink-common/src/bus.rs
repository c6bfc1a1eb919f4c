//! The narrow byte-transport contract a data-link driver must satisfy.
//!
//! `emblink` never talks to a UART, a radio or a USB endpoint directly; it
//! is handed a [`ByteSink`] and pushed received bytes one at a time by
//! the caller. This mirrors the collaborator boundary in the host test
//! harness, where a `serial2::SerialPort` is wrapped to satisfy the same
//! kind of narrow trait rather than being used directly by the protocol
//! code.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The sink cannot accept any more bytes right now; try again later.
    WouldBlock,
}

/// A destination for outgoing frame bytes.
///
/// Implementors are expected to be non-blocking: `send` either accepts the
/// whole buffer or fails with [`SendError::WouldBlock`] without having
/// written a partial frame.
pub trait ByteSink {
    fn send(&mut self, bytes: &[u8]) -> Result<(), SendError>;

    /// Upper bound on the number of bytes that could be accepted by a call
    /// to `send` right now. Used to decide whether to attempt a send at
    /// all before building the frame.
    fn send_available(&self) -> usize;
}
