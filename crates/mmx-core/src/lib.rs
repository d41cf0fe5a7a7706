pub mod bbox;
pub mod descriptor;
pub mod errors;
pub mod fsutil;
pub mod presence;

pub use bbox::BoundingBox;
pub use descriptor::{Corner, RunDescriptor, RunState};
pub use errors::{MmxError, Result};
pub use fsutil::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir, has_extension};
pub use presence::PresencePoints;
