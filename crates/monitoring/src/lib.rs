pub mod logging;

pub use logging::{build_filter, setup_logging};
pub use tracing_appender::non_blocking::WorkerGuard;

pub mod prelude {
    pub use super::{setup_logging, WorkerGuard};
}
