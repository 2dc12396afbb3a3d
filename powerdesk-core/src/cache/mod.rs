//! Client-side request cache: expiring store plus per-key accessors

pub mod accessor;
pub mod fetcher;
pub mod focus;
pub mod store;

pub use accessor::{AccessorOptions, AccessorState, CacheAccessor};
pub use fetcher::Fetcher;
pub use focus::FocusSignal;
pub use store::{CacheEntry, CacheStore};
