pub mod diagnostics;
pub mod event;
pub mod record;

pub use diagnostics::{Diagnostic, DiagnosticsReport, Severity};
pub use event::{EventKind, JobEvent};
pub use record::{FailureKind, JobId, JobRecord, JobSpec, JobState};
