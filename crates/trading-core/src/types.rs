//! Core domain types for the tradeguard system.

pub mod bar;
pub mod order;
pub mod position;
pub mod trade;

pub use bar::*;
pub use order::*;
pub use position::*;
pub use trade::*;
