//! Konverge engine: dependency-ordered change-set execution and the
//! convergence loop that drives it.

#![forbid(unsafe_code)]

pub mod cancel;
pub mod executor;
pub mod reconcile;

pub use cancel::{cancel_channel, CancelHandle, CancelToken};
pub use executor::{execute, ExecMode, ExecOutcome, ExecReport, ExecutorConfig};
pub use reconcile::{plan, reconcile, ReconcileConfig, ReconcileMode};
