use crate::core::InputStats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// 运行中累加的计数器，由输入线程、es_out 与解码线程共同写入
#[derive(Debug, Default)]
pub struct StatsCounters {
    pub demux_read_packets: AtomicU64,
    pub demux_read_bytes: AtomicU64,
    pub decoded_video: AtomicU64,
    pub decoded_audio: AtomicU64,
    pub decoded_sub: AtomicU64,
    pub displayed_pictures: AtomicU64,
    pub lost_pictures: AtomicU64,
    pub played_abuffers: AtomicU64,
    pub lost_abuffers: AtomicU64,
    pub decode_errors: AtomicU64,
}

impl StatsCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> InputStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        InputStats {
            demux_read_packets: get(&self.demux_read_packets),
            demux_read_bytes: get(&self.demux_read_bytes),
            demux_bitrate: 0.0,
            decoded_video: get(&self.decoded_video),
            decoded_audio: get(&self.decoded_audio),
            decoded_sub: get(&self.decoded_sub),
            displayed_pictures: get(&self.displayed_pictures),
            lost_pictures: get(&self.lost_pictures),
            played_abuffers: get(&self.played_abuffers),
            lost_abuffers: get(&self.lost_abuffers),
            decode_errors: get(&self.decode_errors),
        }
    }
}

/// 周期性计算码率（约每秒一次）
pub struct StatsSampler {
    last_bytes: u64,
    last_at: Instant,
    bitrate: f64,
}

impl StatsSampler {
    pub fn new() -> Self {
        Self {
            last_bytes: 0,
            last_at: Instant::now(),
            bitrate: 0.0,
        }
    }

    pub fn compute(&mut self, counters: &StatsCounters) -> InputStats {
        let mut stats = counters.snapshot();
        let elapsed = self.last_at.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let bytes = stats.demux_read_bytes.saturating_sub(self.last_bytes);
            self.bitrate = bytes as f64 / elapsed;
        }
        self.last_bytes = stats.demux_read_bytes;
        self.last_at = Instant::now();
        stats.demux_bitrate = self.bitrate;
        stats
    }
}

impl Default for StatsSampler {
    fn default() -> Self {
        Self::new()
    }
}
