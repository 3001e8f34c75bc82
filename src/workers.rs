pub mod inbox_worker;

pub use inbox_worker::{CycleReport, InboxError, InboxWorker};
