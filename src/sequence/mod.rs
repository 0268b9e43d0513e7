//! Sequence Module
//!
//! Crash-safe monotonic sequence numbers stamped on every mutation and
//! snapshot.
//!
//! ## Responsibilities
//! - Hand out strictly increasing numbers for the lifetime of the store
//! - Persist a ceiling ahead of the numbers handed out
//! - Hand reservation blocks to calling contexts
//!
//! ## Ceiling Policy
//! ```text
//!   persisted ceiling ──────────────────────────────┐
//!                                                   ▼
//!   ... ───[ granted ]───[ block ]── cursor ─────── C ─── ... ── C + interval
//!
//!   cursor + block > C  ⇒  C := C + interval, persisted before granting
//!   restart             ⇒  cursor := C + 1 (numbers up to C are skipped)
//! ```

mod allocator;

pub use allocator::{SequenceAllocator, SequenceContext};
