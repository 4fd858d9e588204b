pub mod catalog;
pub mod core;
pub mod providers;
pub mod runtime;
pub mod transport;

pub use core::types::*;
pub use providers::zhipu::{ApiGeneration, ZhipuAdaptor, ZhipuConfig};
pub use runtime::RelayRuntime;
