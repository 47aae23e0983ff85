//! Flutter-facing front end of the hive bridge.

pub mod api;
mod dispatch;

pub use dispatch::{envelope, Dispatcher};
