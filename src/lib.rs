//! Purpose: Disk-backed object swap cache with first-fit allocation and background eviction.
//! Exports: `core` (store, handles, allocation table, codecs, monitor, errors).
//! Role: Library crate; callers construct a `SwapStore` and hold `SwapHandle`s.
//! Invariants: The backing file is anonymous and store-private; nothing else reads it.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod core;
