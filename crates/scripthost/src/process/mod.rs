//! Script process management.
//!
//! Scripts run as detached children in their own session. The registry owns
//! each child handle; the supervisor decides when a child is signalled and
//! when its record is dropped.

mod kind;
pub mod reaper;
pub mod registry;
pub mod supervisor;

pub use kind::{ARCHIVE_EXTENSION, Interpreters, ScriptKind, UploadKind};
pub use registry::{InstanceRecord, InstanceSummary, Registry};
pub use supervisor::{CascadeOutcome, Stats, Supervisor};
