//! Transactional application of compiled patches to live memory.

mod inject;
mod page;
mod shared;

pub use inject::{inject_restrict, restrict_command_32, restrict_command_64};
pub use page::{ApplyOutcome, apply_to_page};
pub use shared::{SharedSlide, apply_to_shared_region, parse_map_addresses};
