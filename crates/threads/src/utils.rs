use std::time::Duration;

pub mod flags;

/// Native handle of the calling OS thread, used to query its CPU clock later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NativeHandle(
    #[cfg(unix)] libc::pthread_t,
    #[cfg(not(unix))] (),
);

impl NativeHandle {
    pub fn current() -> Self {
        cfg_if::cfg_if! {
            if #[cfg(unix)] {
                Self(unsafe { libc::pthread_self() })
            } else {
                Self(())
            }
        }
    }

    /// CPU time consumed by the thread, `None` when the platform cannot tell or
    /// the thread is gone.
    pub fn cpu_time(&self) -> Option<Duration> {
        cfg_if::cfg_if! {
            if #[cfg(all(unix, not(target_os = "macos")))] {
                unsafe {
                    let mut clock: libc::clockid_t = 0;
                    if libc::pthread_getcpuclockid(self.0, &mut clock) != 0 {
                        return None;
                    }
                    let mut ts = std::mem::zeroed::<libc::timespec>();
                    if libc::clock_gettime(clock, &mut ts) != 0 {
                        return None;
                    }
                    Some(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
                }
            } else {
                None
            }
        }
    }
}

/// Give up the rest of the time slice. Spin loops call this between attempts.
pub fn yield_now() {
    cfg_if::cfg_if! {
        if #[cfg(unix)] {
            unsafe {
                libc::sched_yield();
            }
        } else {
            std::thread::yield_now();
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_time_advances() {
        let handle = NativeHandle::current();
        if let Some(before) = handle.cpu_time() {
            let mut x = 0u64;
            for i in 0..2_000_000u64 {
                x = x.wrapping_add(i * i);
            }
            std::hint::black_box(x);
            let after = handle.cpu_time().unwrap();
            assert!(after >= before);
        }
    }
}
