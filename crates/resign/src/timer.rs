//! Wall-clock timers reported in the log.

use log::{error, info};
use std::time::{Duration, Instant};

/// Observational timer. Never consulted for control flow.
#[derive(Debug, Clone, Copy)]
pub struct Stopwatch {
    start: Instant,
}

impl Stopwatch {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Log the outcome of the timed step and return its duration.
    pub fn finish(&self, ok: bool) -> Duration {
        let elapsed = self.elapsed();
        if ok {
            info!(">>> Signed OK! ({:.3}s)", elapsed.as_secs_f64());
        } else {
            error!(">>> Signed Failed! ({:.3}s)", elapsed.as_secs_f64());
        }
        elapsed
    }

    /// Log the total time of the invocation and return it.
    pub fn print_total(&self) -> Duration {
        let elapsed = self.elapsed();
        info!(">>> Done. ({:.3}s)", elapsed.as_secs_f64());
        elapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inner_timer_within_total() {
        let total = Stopwatch::start();
        std::thread::sleep(Duration::from_millis(10));
        let sign = Stopwatch::start();
        std::thread::sleep(Duration::from_millis(10));
        let signed = sign.finish(false);
        assert!(signed >= Duration::from_millis(10));
        assert!(total.print_total() > signed);
    }
}
