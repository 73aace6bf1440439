use std::time::Duration;

/// An iterator that forever yields backoff durations, growing by a fixed factor up to a cap.
#[derive(Clone, Copy, Debug)]
pub struct ExpDecay {
    duration: Duration,
    multiplier: u32,
    max: Duration,
    start: Duration,
}

impl ExpDecay {
    pub const fn constant(duration: Duration) -> Self {
        Self {
            duration,
            multiplier: 1,
            max: duration,
            start: duration,
        }
    }

    /// Doubles on every step, starting at `starting`, never exceeding `max`.
    pub const fn quadratic(starting: Duration, max: Duration) -> Self {
        Self {
            duration: starting,
            multiplier: 2,
            max,
            start: starting,
        }
    }

    pub fn next_duration(&mut self) -> Duration {
        let duration = self.duration;
        self.duration = std::cmp::min(self.max, self.duration * self.multiplier);
        duration
    }

    /// Goes back to the starting duration, e.g. after the awaited thing made progress.
    pub fn reset(&mut self) {
        self.duration = self.start;
    }
}

impl Iterator for ExpDecay {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_duration())
    }
}
