use std::io::{self, Write};
use std::time::Instant;

/// Elapsed-stamped progress lines on stderr. Cheap enough to call from
/// concurrent batch tasks.
pub struct ConsoleProgress {
    enabled: bool,
    t0: Instant,
}

impl ConsoleProgress {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            t0: Instant::now(),
        }
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        if self.enabled {
            self.emit("", msg.as_ref());
        }
    }

    /// Warnings ignore the quiet flag; a dropped batch should never be
    /// silent.
    pub fn warn(&self, msg: impl AsRef<str>) {
        self.emit("WARN ", msg.as_ref());
    }

    pub fn progress(&self, label: &str, current: usize, total: usize) {
        if !self.enabled {
            return;
        }
        let total = total.max(1);
        let current = current.min(total);
        let pct = (current as f64 / total as f64) * 100.0;
        self.emit("", &format!("{label} {current}/{total} ({pct:5.1}%)"));
    }

    fn emit(&self, level: &str, msg: &str) {
        let elapsed = self.t0.elapsed().as_secs();
        let (h, m, s) = (elapsed / 3600, (elapsed % 3600) / 60, elapsed % 60);
        let mut stderr = io::stderr().lock();
        let _ = if h > 0 {
            writeln!(stderr, "[{h:02}:{m:02}:{s:02}] {level}{msg}")
        } else {
            writeln!(stderr, "[{m:02}:{s:02}] {level}{msg}")
        };
    }
}
