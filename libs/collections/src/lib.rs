//! Primitive containers for the scrap runtime.
//!
//! Everything here is allocator-explicit: containers borrow a
//! [`mem::Allocator`] (or a fixed caller buffer) at construction and never
//! touch a global heap. The types are deliberately POD-oriented; they are the
//! vocabulary the scheduler and every resource cache are built from.

pub mod array;
pub mod atomic_pool;
pub mod blob;
pub mod cache_padded;
pub mod handle;
pub mod table;

pub use array::{Array, StaticArray};
pub use atomic_pool::AtomicPool;
pub use blob::{Blob, GrowPolicy, RingBlob};
pub use cache_padded::CachePadded;
pub use handle::{Handle, HandlePool};
pub use table::{HashTable, INVALID_INDEX};
