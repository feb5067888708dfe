use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::SigId;
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook::flag;
use signal_hook::low_level::unregister;

/// Exit status used when a second signal arrives while the worker is still
/// finishing its current job.
const FORCED_EXIT_CODE: i32 = 130;

/// SIGINT/SIGTERM latch polled by the work loop between passes.
///
/// The first signal only sets the flag, letting the running job finish. A
/// second one terminates the process immediately.
pub struct ShutdownHooks {
    triggered: Arc<AtomicBool>,
    sig_ids: Vec<SigId>,
}

impl ShutdownHooks {
    pub fn install() -> io::Result<Self> {
        let triggered = Arc::new(AtomicBool::new(false));
        let mut sig_ids = Vec::with_capacity(4);

        for signal in [SIGINT, SIGTERM] {
            // order matters: the conditional exit must observe the flag
            // before this signal sets it
            sig_ids.push(flag::register_conditional_shutdown(
                signal,
                FORCED_EXIT_CODE,
                Arc::clone(&triggered),
            )?);
            sig_ids.push(flag::register(signal, Arc::clone(&triggered))?);
        }

        Ok(Self { triggered, sig_ids })
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Requests shutdown as if a signal had arrived.
    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
    }
}

impl Drop for ShutdownHooks {
    fn drop(&mut self) {
        for id in self.sig_ids.drain(..) {
            unregister(id);
        }
    }
}
