mod tracing;

pub use self::tracing::{LogFormat, init, init_with};
