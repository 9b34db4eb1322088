//! Application startup utilities module.

mod logging;
mod shutdown;
mod standalone;

pub use logging::{LogRotation, LoggingConfig, LoggingGuard, init_logging};
pub use shutdown::{ShutdownSignal, wait_for_shutdown_signal};
pub use standalone::StandaloneMaster;
