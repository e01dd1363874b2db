//! The `utils` module provides the pieces shared across the `propel`
//! application: the error taxonomy and logging setup.

pub mod error;
pub mod logging;

pub use error::{Code, PushError, Result};

#[cfg(test)]
mod tests {
    use super::logging;

    #[test]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }
}
