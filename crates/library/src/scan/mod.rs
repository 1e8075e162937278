//! Directory scans.
//!
//! [`scan`] walks the monitored directory and yields a
//! [`MonitoredEvent`](crate::MonitoredEvent) per candidate file. It is lazy,
//! finite and restartable: calling it again simply walks again.
//!
//! [`organize`] runs every scanned file through the
//! [`Pipeline`](crate::Pipeline) with bounded concurrency, and
//! [`ScanCoordinator`] makes sure only one such run is active at a time.

mod coordinator;
mod stream;
mod walk;

pub use self::coordinator::{ScanCoordinator, ScanHandle};
pub use self::stream::{ScanEvent, ScanSummary, organize};
pub use self::walk::scan;
