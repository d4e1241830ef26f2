pub mod error;
pub mod mock;
pub mod objectmodel;
pub mod options;
pub mod runtime;
pub mod sync;
pub mod utils;

pub use error::{Status, ThreadError, WaitResult};
pub use objectmodel::{header::Synchronized, ObjectRef, SyncObject, WeakObjectRef};
pub use options::ThreadingOptions;
pub use runtime::{
    deadlock::CycleEdge,
    registry::{current_thread, ThreadCounters},
    threads::{StateBits, ThreadId, ThreadInfo, ThreadRecord},
    NoopRuntime, SafepointPollable, Threading, ThreadingBuilder,
};
pub use sync::{monitor_table::RawMonitorHandle, MonitorRef};
