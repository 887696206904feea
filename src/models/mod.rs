//! Data models for the offline sync core.
//!
//! Everything here serializes as camelCase so the host UI can consume it directly.

mod area;
mod queue;
mod record;
mod sync;
mod tile;

pub use area::*;
pub use queue::*;
pub use record::*;
pub use sync::*;
pub use tile::*;
