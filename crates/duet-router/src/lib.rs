mod cooldown;
mod lock;
mod oom;
mod router;

pub use cooldown::{CooldownGate, CooldownRecord, CooldownState, COOLDOWN_MINUTES};
pub use lock::{lock_for_platform, NoopLock, SystemLock};
#[cfg(unix)]
pub use lock::FileLock;
pub use oom::{is_oom_error, OOM_INDICATORS};
pub use router::{
    retry_delay, RouteOutcome, SystemStatus, TaskRouter, LOCK_POLL_INTERVAL, LOCK_TIMEOUT,
    MAX_CONSECUTIVE_OOM, RETRY_AFTER_BUSY, RETRY_DELAY_BASE, RETRY_DELAY_CAP,
};
