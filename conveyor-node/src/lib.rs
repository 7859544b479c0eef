#![cfg_attr(not(test), warn(clippy::unwrap_used))]

pub mod child;
pub mod gateway;
pub mod runtime;
pub mod signals;
pub mod supervisor;
pub mod wire;
pub mod worker;

pub use runtime::Runtime;
