mod bounded_index;
mod ringbuffer;

pub use bounded_index::*;
pub use ringbuffer::*;
