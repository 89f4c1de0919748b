//! Fetch engine
//!
//! - Strategy selection and the default HTTP strategy
//! - Per-attempt transfer context with a file-backed buffer
//! - Debounced JSON persistence index

mod buffer;
mod http;
mod persistence;
mod strategy;
mod transfer;

pub use buffer::*;
pub use http::*;
pub use persistence::*;
pub use strategy::FetchStrategy;
pub(crate) use strategy::StrategyList;
pub use transfer::*;
