//! Pure interpretation of probe details. Nothing here performs I/O.

pub mod congestion;
pub mod hops;
