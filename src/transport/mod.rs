/// Filesystem line and file transports.
pub mod fs;
