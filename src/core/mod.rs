// Core modules implementing swap storage, allocation bookkeeping, and error modeling.
pub mod alloc;
pub mod codec;
pub mod error;
pub mod handle;
pub(crate) mod monitor;
pub mod store;
