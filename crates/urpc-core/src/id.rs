//! Identifier types
//!
//! - [`HandleId`] names a pollable handle inside one event loop. It is an
//!   index into the loop's handle table plus a generation, so an id kept
//!   past its handle's retirement never resolves to whatever reuses the slot.
//! - [`CorrelationId`] ties a request frame to its response on one transport.

use core::fmt;

/// Stable id of a handle in an event loop's handle table
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HandleId {
    index: u32,
    generation: u32,
}

impl HandleId {
    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        HandleId { index, generation }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.index as usize
    }

    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }

    /// Pack into the 64-bit token carried by the readiness multiplexer.
    #[inline]
    pub const fn to_token(self) -> u64 {
        ((self.generation as u64) << 32) | self.index as u64
    }

    #[inline]
    pub const fn from_token(token: u64) -> Self {
        HandleId {
            index: token as u32,
            generation: (token >> 32) as u32,
        }
    }
}

impl fmt::Debug for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleId({}v{})", self.index, self.generation)
    }
}

/// Client-assigned request id, unique per transport
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct CorrelationId(u64);

impl CorrelationId {
    /// First id a transport hands out.
    pub const FIRST: CorrelationId = CorrelationId(1);

    #[inline]
    pub const fn new(id: u64) -> Self {
        CorrelationId(id)
    }

    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn next(self) -> Self {
        CorrelationId(self.0 + 1)
    }
}

impl From<u64> for CorrelationId {
    #[inline]
    fn from(id: u64) -> Self {
        CorrelationId(id)
    }
}

impl fmt::Debug for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
