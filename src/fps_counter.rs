use std::time::Instant;

use log::info;

const WINDOW: usize = 128;

/// Rolling frame-time average over the last 128 frames, logged at a fixed
/// interval.
#[derive(Debug)]
pub struct FpsCounter {
    frame_times: [f32; WINDOW], // ms
    index: usize,
    last_instant: Instant,
    last_log: Instant,
    log_interval: f32,
}

impl FpsCounter {
    /// `log_interval` in seconds; 0 disables logging.
    pub fn new(log_interval: f32) -> Self {
        let now = Instant::now();
        Self {
            frame_times: [0.0; WINDOW],
            index: 0,
            last_instant: now,
            last_log: now,
            log_interval,
        }
    }

    /// Record one frame and return its duration in seconds.
    pub fn tick(&mut self) -> f32 {
        let now = Instant::now();
        let dt = now.duration_since(self.last_instant).as_secs_f32();
        self.last_instant = now;
        self.record(dt * 1000.0);
        dt
    }

    fn record(&mut self, ms: f32) {
        self.frame_times[self.index] = ms;
        self.index = (self.index + 1) % WINDOW;
    }

    /// Averaged (fps, frame time in ms) over the recorded frames.
    pub fn averaged(&self) -> (f32, f32) {
        let (sum, count) = self
            .frame_times
            .iter()
            .filter(|&&v| v > 0.0)
            .fold((0.0f32, 0usize), |(s, c), &v| (s + v, c + 1));
        if count == 0 {
            return (0.0, 0.0);
        }
        let avg_ms = sum / count as f32;
        (1000.0 / avg_ms, avg_ms)
    }

    /// Log the average once per interval, with the last frame's draw counts.
    pub fn maybe_log(&mut self, draw_calls: u32, instances: u32) {
        if self.log_interval <= 0.0 || self.last_log.elapsed().as_secs_f32() < self.log_interval {
            return;
        }
        self.last_log = Instant::now();
        let (fps, ms) = self.averaged();
        info!("FPS: {fps:.1}, frame time: {ms:.3} ms, {draw_calls} draws, {instances} instances");
    }
}
