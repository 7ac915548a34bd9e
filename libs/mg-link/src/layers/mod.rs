//! Tower layers of the operation pipeline
//!
//! Stacked outermost first:
//!
//! - [`InstrumentLayer`] - times each caller request and reports slow ones
//! - [`RetryLayer`] - re-dispatches failed attempts per [`RetryPolicy`]
//! - [`ReportLayer`] - classifies every failed attempt and emits a `LinkEvent`

mod instrument;
mod report;
mod retry;

pub use instrument::{InstrumentLayer, InstrumentService};
pub use report::{ReportLayer, ReportService, Reporter};
pub use retry::{RetryDecision, RetryLayer, RetryPolicy, RetryService, calculate_backoff, is_retryable};
