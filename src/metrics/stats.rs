use serde::Serialize;

/// Online aggregate for one metric. All times are in seconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Stats {
    pub call_count: u64,
    pub total_call_time: f64,
    pub total_exclusive_time: f64,
    pub min_call_time: f64,
    pub max_call_time: f64,
    pub sum_of_squares: f64,
}

impl Stats {
    /// Fold one observation in. `exclusive` is the part of `duration` not
    /// spent in child segments.
    pub fn record(&mut self, duration: f64, exclusive: f64) {
        if self.call_count == 0 {
            self.min_call_time = duration;
            self.max_call_time = duration;
        } else {
            self.min_call_time = self.min_call_time.min(duration);
            self.max_call_time = self.max_call_time.max(duration);
        }
        self.call_count += 1;
        self.total_call_time += duration;
        self.total_exclusive_time += exclusive;
        self.sum_of_squares += duration * duration;
    }

    pub fn average(&self) -> f64 {
        if self.call_count == 0 {
            0.0
        } else {
            self.total_call_time / self.call_count as f64
        }
    }

    pub fn is_empty(&self) -> bool {
        self.call_count == 0
    }
}

// ─── Apdex ───────────────────────────────────────────────────────

/// Which apdex bucket a transaction lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApdexZone {
    Satisfied,
    Tolerating,
    Failing,
}

impl ApdexZone {
    /// Pure classification against threshold `t` (seconds).
    ///
    /// Errors always fail. Otherwise `d <= t` satisfies, `d <= 4t` is
    /// tolerated and anything slower fails.
    pub fn classify(duration: f64, is_error: bool, t: f64) -> Self {
        if is_error {
            ApdexZone::Failing
        } else if duration <= t {
            ApdexZone::Satisfied
        } else if duration <= 4.0 * t {
            ApdexZone::Tolerating
        } else {
            ApdexZone::Failing
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApdexStats {
    pub satisfied: u64,
    pub tolerating: u64,
    pub failing: u64,
}

impl ApdexStats {
    pub fn record(&mut self, zone: ApdexZone) {
        match zone {
            ApdexZone::Satisfied => self.satisfied += 1,
            ApdexZone::Tolerating => self.tolerating += 1,
            ApdexZone::Failing => self.failing += 1,
        }
    }

    pub fn count(&self) -> u64 {
        self.satisfied + self.tolerating + self.failing
    }

    /// Standard apdex score; an empty bucket set scores a perfect 1.0.
    pub fn score(&self) -> f64 {
        let n = self.count();
        if n == 0 {
            return 1.0;
        }
        (self.satisfied as f64 + self.tolerating as f64 / 2.0) / n as f64
    }
}
