//! Change-block-tracking engine (C6): prepare/finish a per-volume
//! bitmap, zero the affected slots in the two HashStore files, and merge
//! bitmaps reported by other consumers.

pub mod bitmap;
pub mod driver;
pub mod engine;
pub mod error;
pub mod hashstore;

pub use bitmap::CbtBitmap;
pub use driver::CbtDriver;
pub use engine::CbtEngine;
pub use error::CbtError;
