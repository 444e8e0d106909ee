mod error_handler;
mod gatekeeper;

pub use error_handler::log_errors;
pub use gatekeeper::{Gatekeeper, check_quota};
