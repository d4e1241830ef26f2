use crate::{
    define_flag,
    utils::flags::{self, FlagError},
};

pub struct ThreadsFlags;

define_flag!(ThreadsFlags =>
    usize,
    thin_lock_spins,
    64,
    "Failed CAS attempts before a contended thin lock is inflated. (default: 64)"
);

define_flag!(ThreadsFlags =>
    usize,
    max_monitors,
    1 << 20,
    "Upper bound on heavyweight monitor slots. (default: 1048576)"
);

define_flag!(ThreadsFlags =>
    usize,
    suspend_poll_interval,
    1,
    "Yields between safepoint polls of a thread waiting for a suspend acknowledgement. (default: 1)"
);

define_flag!(ThreadsFlags =>
    bool,
    trace_monitors,
    false,
    "Log every inflation and raw monitor operation. (default: false)"
);

/// Parse `--threads:<name>=<value>` arguments and `VMKIT_THREADS_<NAME>` variables.
pub fn parse_flags(
    args: impl Iterator<Item = String>,
    env: impl Iterator<Item = (String, String)>,
) -> Result<(), FlagError> {
    flags::parse_with_prefix::<ThreadsFlags>("threads", args, env)
}

/// Knobs of a [`Threading`](crate::Threading) instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadingOptions {
    pub thin_lock_spins: usize,
    pub max_monitors: usize,
    pub suspend_poll_interval: usize,
    pub trace_monitors: bool,
}

impl ThreadingOptions {
    /// Snapshot of the current flag values.
    pub fn from_flags() -> Self {
        Self {
            thin_lock_spins: threadsflags_thin_lock_spins(),
            max_monitors: threadsflags_max_monitors(),
            suspend_poll_interval: threadsflags_suspend_poll_interval().max(1),
            trace_monitors: threadsflags_trace_monitors(),
        }
    }
}

impl Default for ThreadingOptions {
    fn default() -> Self {
        Self {
            thin_lock_spins: 64,
            max_monitors: 1 << 20,
            suspend_poll_interval: 1,
            trace_monitors: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_snapshot() {
        set_threadsflags_thin_lock_spins(8);
        let options = ThreadingOptions::from_flags();
        assert_eq!(options.thin_lock_spins, 8);
        assert_eq!(options.max_monitors, 1 << 20);
        assert!(!options.trace_monitors);
        set_threadsflags_thin_lock_spins(64);
    }
}
