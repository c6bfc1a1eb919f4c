//! The tagged-union value type carried by every publish and every retained
//! node, plus the RETAIN/CONST flags that govern its storage.

use bitflags::bitflags;

bitflags! {
    /// `RETAIN` asks the node to remember this value for future subscribers.
    /// `CONST` tells `PubSub` the payload lives in memory the caller
    /// guarantees stays valid for as long as the `PubSub` instance itself --
    /// see [`crate::PubSub::publish_const`]. The combination of `RETAIN`
    /// without `CONST` on a `Str`/`Json`/`Bin` value is rejected: a non-CONST
    /// payload is copied into the circular arena and that span is freed the
    /// moment `process` finishes delivering it, so retaining a pointer into
    /// it would outlive its backing storage.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ValueFlags: u8 {
        const RETAIN = 0b01;
        const CONST  = 0b10;
    }
}

/// A published or retained value.
///
/// `Str`/`Json`/`Bin` borrow their bytes: when passed to
/// [`crate::PubSub::publish`] the borrow only needs to last for that call
/// (the bytes are copied into the arena before it returns); when passed to
/// [`crate::PubSub::publish_const`] the borrow must last as long as the
/// `PubSub` instance, since a `CONST | RETAIN` value is handed back to
/// future subscribers directly from the caller's own memory.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Value<'a> {
    Null,
    U32(u32),
    Str(&'a [u8]),
    Json(&'a [u8]),
    Bin(&'a [u8]),
}

impl<'a> Value<'a> {
    pub fn is_bytes(&self) -> bool {
        matches!(self, Value::Str(_) | Value::Json(_) | Value::Bin(_))
    }
}
