//! The watch, resolve and move pipeline.
//!
//! [`Service`] is the entry point for long-running use; [`Pipeline`] and
//! [`scan::organize`] can be driven directly for one-off runs.

pub mod error;
mod event;
mod filter;
mod inflight;
mod journal;
mod pipeline;
pub mod scan;
mod service;
mod stability;
mod template;
pub mod watch;

pub use crate::event::{EventKind, MonitoredEvent};
pub use crate::filter::Filter;
pub use crate::inflight::{InFlight, InFlightGuard};
pub use crate::journal::{Journal, MoveRecord, Outcome};
pub use crate::pipeline::{Effects, Notifier, Pipeline, Quiet, ResolutionCache, ResolverFactory};
pub use crate::scan::{ScanCoordinator, ScanEvent, ScanHandle, ScanSummary};
pub use crate::service::{Mode, Service, Status};
pub use crate::stability::{Readiness, wait_until_stable};
pub use crate::template::PathGenerator;
