//! Small substrate shared by long-lived components: lifecycle bookkeeping,
//! shutdown-barrier synchronization, a validated percentage type, and a
//! ready-made `tracing` subscriber for binaries/tests that want one.

pub mod completion;
pub mod lifecycle;
pub mod logging;
pub mod percent;
