pub mod error;
mod mover;
mod path;

pub use crate::mover::{MAX_SUFFIX, Moved, Mover, Strategy};
pub use crate::path::sanitize_segment;
pub use crate::path::validate as validate_path;
