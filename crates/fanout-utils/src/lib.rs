mod paths;

pub use paths::{ensure_dir, sanitize_component};
