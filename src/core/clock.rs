use crate::core::{InputError, Result, Tick, CLOCK_FREQ, RATE_DEFAULT};
use log::warn;
use parking_lot::Mutex;
use std::sync::OnceLock;
use std::time::Instant;

/// 单调系统时间（微秒），进程内第一次调用时从 1 秒起步
pub fn now() -> Tick {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    CLOCK_FREQ + epoch.elapsed().as_micros() as Tick
}

/// 流时间跳变超过该值视为不连续，重建参考点
const CR_MAX_GAP: Tick = 60 * CLOCK_FREQ;

/// 重建参考点时与已输出最大时间戳之间保留的间隔
const CR_MEAN_PTS_GAP: Tick = 300_000;

/// 额外缓冲：按 48/256 的比例多读，直到 100ms
const CR_BUFFERING_RATE: Tick = 48;
const CR_BUFFERING_TARGET: Tick = 100_000;

/// 迟到统计环的大小
const LATE_COUNT: usize = 3;

/// 漂移估计的更新间隔
const DRIFT_UPDATE_INTERVAL: Tick = CLOCK_FREQ / 5;

/// 带余数的滑动平均
#[derive(Debug, Clone)]
struct Average {
    value: Tick,
    residue: Tick,
    count: i64,
    divider: i64,
}

impl Average {
    fn new(divider: i64) -> Self {
        Self {
            value: 0,
            residue: 0,
            count: 0,
            divider,
        }
    }

    fn reset(&mut self) {
        self.value = 0;
        self.residue = 0;
        self.count = 0;
    }

    fn update(&mut self, sample: Tick) {
        let f0 = (self.divider - 1).min(self.count);
        let f1 = self.divider - f0;
        let tmp = f0 * self.value + f1 * sample + self.residue;
        self.value = tmp / self.divider;
        self.residue = tmp % self.divider;
        self.count += 1;
    }

    fn rescale(&mut self, divider: i64) {
        let tmp = self.value * self.divider + self.residue;
        self.divider = divider;
        self.value = tmp / divider;
        self.residue = tmp % divider;
    }

    fn get(&self) -> Tick {
        self.value
    }
}

/// 流时间与系统时间的对应点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ClockPoint {
    stream: Tick,
    system: Tick,
}

/// 时钟状态快照（参考点与累计时长）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockState {
    pub stream_start: Tick,
    pub system_start: Tick,
    pub stream_duration: Tick,
    pub system_duration: Tick,
}

/// 时间戳转换结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Converted {
    pub rate: i32,
    pub ts0: Tick,
    pub ts1: Option<Tick>,
}

struct ClockInner {
    /// 最近一次收到的采样
    last: Option<ClockPoint>,
    /// 参考点（None 表示尚未同步）
    reference: Option<ClockPoint>,
    /// convert 输出过的最大系统时间
    ts_max: Option<Tick>,
    /// 额外缓冲（流时间单位）
    buffering_duration: Tick,
    next_drift_update: Option<Tick>,
    drift: Average,
    late: [Tick; LATE_COUNT],
    late_index: usize,
    /// 相对模式改变系统原点时的外部参考
    external_clock: Option<Tick>,
    paused: bool,
    pause_date: Option<Tick>,
    rate: i32,
    pts_delay: Tick,
}

impl ClockInner {
    fn stream_to_system(&self, stream: Tick) -> Option<Tick> {
        let reference = self.reference?;
        Some((stream - reference.stream) * self.rate as Tick / RATE_DEFAULT as Tick + reference.system)
    }

    fn system_to_stream(&self, system: Tick) -> Option<Tick> {
        let reference = self.reference?;
        Some((system - reference.system) * RATE_DEFAULT as Tick / self.rate as Tick + reference.stream)
    }

    /// 变速时由 pts_delay 引入的额外偏移
    fn ts_offset(&self) -> Tick {
        self.pts_delay * (self.rate as Tick - RATE_DEFAULT as Tick) / RATE_DEFAULT as Tick
    }
}

/// 节目时钟
///
/// 把节目的参考时钟采样（PCR）映射为系统时间的线性关系，
/// 同时估计漂移、记录迟到情况。由 es_out 与解码线程共享。
pub struct ProgramClock {
    inner: Mutex<ClockInner>,
}

impl ProgramClock {
    pub fn new(rate: i32) -> Self {
        Self {
            inner: Mutex::new(ClockInner {
                last: None,
                reference: None,
                ts_max: None,
                buffering_duration: 0,
                next_drift_update: None,
                drift: Average::new(10),
                late: [0; LATE_COUNT],
                late_index: 0,
                external_clock: None,
                paused: false,
                pause_date: None,
                rate: rate.max(1),
                pts_delay: 0,
            }),
        }
    }

    /// 输入一个 (PCR, 系统时间) 采样，返回该采样是否已经迟到
    pub fn update(&self, stream: Tick, system: Tick, can_pace_control: bool, buffering_allowed: bool) -> bool {
        let mut c = self.inner.lock();

        let mut reset_reference = c.reference.is_none();
        if let Some(last) = c.last {
            if !reset_reference && (last.stream - stream).abs() > CR_MAX_GAP {
                warn!("⏱️ 时钟跳变 {}ms，重建参考点", (stream - last.stream) / 1000);
                c.ts_max = None;
                reset_reference = true;
            }
        }

        if reset_reference {
            c.next_drift_update = None;
            c.drift.reset();
            let floor = c.ts_max.map(|t| t + CR_MEAN_PTS_GAP).unwrap_or(system);
            c.reference = Some(ClockPoint {
                stream,
                system: floor.max(system),
            });
            c.external_clock = None;
        }

        // 无法控制读取节奏时估计流时钟相对系统时钟的漂移
        if !can_pace_control && c.next_drift_update.map_or(true, |t| t < system) {
            if let Some(converted) = c.system_to_stream(system) {
                c.drift.update(converted - stream);
            }
            c.next_drift_update = Some(system + DRIFT_UPDATE_INTERVAL);
        }

        if !can_pace_control || reset_reference {
            c.buffering_duration = 0;
        } else if buffering_allowed {
            let previous = c.last.map(|l| l.stream).unwrap_or(stream);
            let duration = (stream - previous).max(0);
            c.buffering_duration += (duration * CR_BUFFERING_RATE + 255) / 256;
            if c.buffering_duration > CR_BUFFERING_TARGET {
                c.buffering_duration = CR_BUFFERING_TARGET;
            }
        }

        c.last = Some(ClockPoint { stream, system });

        let drift = c.drift.get();
        let expected = c.stream_to_system(stream + drift).unwrap_or(system);
        let late = (system - c.pts_delay) - expected;
        if late > 0 {
            let index = c.late_index;
            c.late[index] = late;
            c.late_index = (index + 1) % LATE_COUNT;
        }
        late > 0
    }

    /// 丢弃参考点与漂移估计，保留迟到历史（jitter）
    pub fn reset(&self) {
        let mut c = self.inner.lock();
        c.reference = None;
        c.external_clock = None;
        c.ts_max = None;
    }

    /// 下一次应当唤醒输入线程的系统时间，未同步时返回 0
    pub fn wakeup(&self) -> Tick {
        let c = self.inner.lock();
        match c.last {
            Some(last) if c.reference.is_some() => c
                .stream_to_system(last.stream + c.drift.get() - c.buffering_duration)
                .unwrap_or(0),
            _ => 0,
        }
    }

    /// 改变速率：参考点按新速率重新推算，使已播放部分保持连续
    pub fn change_rate(&self, rate: i32) {
        let mut c = self.inner.lock();
        let rate = rate.max(1);
        if let (Some(mut reference), Some(last)) = (c.reference, c.last) {
            reference.system =
                last.system - (last.system - reference.system) * rate as Tick / c.rate as Tick;
            c.reference = Some(reference);
        }
        c.rate = rate;
    }

    /// 暂停/恢复；恢复时把暂停时长加到系统时间上
    pub fn change_pause(&self, paused: bool, date: Tick) {
        let mut c = self.inner.lock();
        if c.paused == paused {
            return;
        }
        if c.paused {
            let duration = c.pause_date.map(|p| date - p).unwrap_or(0);
            if duration > 0 {
                if let Some(reference) = c.reference.as_mut() {
                    reference.system += duration;
                }
                if let Some(last) = c.last.as_mut() {
                    last.system += duration;
                }
            }
        }
        c.pause_date = Some(date);
        c.paused = paused;
    }

    /// 返回 (系统原点, pts_delay)
    pub fn system_origin(&self) -> Option<(Tick, Tick)> {
        let c = self.inner.lock();
        c.reference.map(|r| (r.system, c.pts_delay))
    }

    /// 平移系统原点
    ///
    /// absolute 为真时把原点移到 system；否则相对第一次调用时记录的外部时钟平移
    pub fn change_system_origin(&self, absolute: bool, system: Tick) {
        let mut c = self.inner.lock();
        let Some(reference) = c.reference else {
            return;
        };
        let offset = if absolute {
            system - reference.system - c.ts_offset()
        } else {
            let external = *c.external_clock.get_or_insert(system);
            system - external
        };
        if let Some(r) = c.reference.as_mut() {
            r.system += offset;
        }
        if let Some(l) = c.last.as_mut() {
            l.system += offset;
        }
    }

    /// 把流时间戳转换为系统时间
    ///
    /// ts0 超过 `now + 延迟 + bound` 时失败；bound 为 `Tick::MAX` 表示不检查
    pub fn convert(&self, ts0: Tick, ts1: Option<Tick>, bound: Tick) -> Result<Converted> {
        self.convert_at(now(), ts0, ts1, bound)
    }

    /// 同 convert，但使用调用方给出的当前时间
    pub fn convert_at(&self, current: Tick, ts0: Tick, ts1: Option<Tick>, bound: Tick) -> Result<Converted> {
        let mut c = self.inner.lock();
        if c.reference.is_none() {
            return Err(InputError::NoReference);
        }

        let ts_buffering = c.buffering_duration * c.rate as Tick / RATE_DEFAULT as Tick;
        let ts_delay = c.pts_delay + c.ts_offset();
        let drift = c.drift.get();

        let system0 = c.stream_to_system(ts0 + drift).ok_or(InputError::NoReference)?;
        if c.ts_max.map_or(true, |m| system0 > m) {
            c.ts_max = Some(system0);
        }
        let out0 = system0 + ts_delay;

        // ts1 不更新 ts_max
        let out1 = match ts1 {
            Some(t) => Some(c.stream_to_system(t + drift).ok_or(InputError::NoReference)? + ts_delay),
            None => None,
        };

        if bound != Tick::MAX && out0 >= current + ts_delay + ts_buffering + bound {
            return Err(InputError::TooLate);
        }

        Ok(Converted {
            rate: c.rate,
            ts0: out0,
            ts1: out1,
        })
    }

    pub fn rate(&self) -> i32 {
        self.inner.lock().rate
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    pub fn has_reference(&self) -> bool {
        self.inner.lock().reference.is_some()
    }

    /// 参考点与自参考点以来累计的流/系统时长
    pub fn state(&self) -> Result<ClockState> {
        let c = self.inner.lock();
        match (c.reference, c.last) {
            (Some(reference), Some(last)) => Ok(ClockState {
                stream_start: reference.stream,
                system_start: reference.system,
                stream_duration: last.stream - reference.stream,
                system_duration: last.system - reference.system,
            }),
            _ => Err(InputError::NoReference),
        }
    }

    /// 更新延迟预算与漂移平均窗口
    pub fn set_jitter(&self, pts_delay: Tick, cr_average: i32) {
        let mut c = self.inner.lock();

        // 迟到记录按延迟的变化量修正，仍为正的才保留
        let delta = pts_delay - c.pts_delay;
        let mut corrected = [0; LATE_COUNT];
        for (i, slot) in corrected.iter_mut().enumerate() {
            *slot = (c.late[(c.late_index + 1 + i) % LATE_COUNT] - delta).max(0);
        }
        c.late = [0; LATE_COUNT];
        c.late_index = 0;
        for value in corrected.into_iter().filter(|v| *v > 0) {
            let index = c.late_index;
            c.late[index] = value;
            c.late_index = (index + 1) % LATE_COUNT;
        }

        c.pts_delay = pts_delay;

        let cr_average = cr_average.max(10) as i64;
        if c.drift.divider != cr_average {
            c.drift.rescale(cr_average);
        }
    }

    /// 延迟预算加上最近迟到值的中位数
    pub fn jitter(&self) -> Tick {
        let c = self.inner.lock();
        let mut late = c.late;
        late.sort_unstable();
        c.pts_delay + late[LATE_COUNT / 2]
    }
}

impl Default for ProgramClock {
    fn default() -> Self {
        Self::new(RATE_DEFAULT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    const T0: Tick = 10 * CLOCK_FREQ;

    fn synced_clock(rate: i32) -> ProgramClock {
        let clock = ProgramClock::new(rate);
        clock.update(0, T0, true, false);
        clock
    }

    #[test]
    fn convert_fails_without_reference() {
        let clock = ProgramClock::default();
        assert!(matches!(clock.convert_at(T0, 0, None, Tick::MAX), Err(InputError::NoReference)));
        assert!(clock.state().is_err());
    }

    #[rstest]
    #[case(RATE_DEFAULT)]
    #[case(RATE_DEFAULT * 2)]
    #[case(RATE_DEFAULT / 2)]
    fn convert_is_strictly_monotonic(#[case] rate: i32) {
        let clock = synced_clock(rate);
        let mut previous = None;
        for i in 1..200 {
            let pts = i * 40_000;
            let out = clock.convert_at(T0, pts, None, Tick::MAX).unwrap().ts0;
            if let Some(p) = previous {
                assert!(out > p, "rate {} pts {} gave {} <= {}", rate, pts, out, p);
            }
            previous = Some(out);
        }
    }

    #[test]
    fn rate_doubles_mapping_slope() {
        let clock = synced_clock(RATE_DEFAULT);
        clock.change_rate(RATE_DEFAULT * 2);
        let a = clock.convert_at(T0, CLOCK_FREQ, None, Tick::MAX).unwrap().ts0;
        let b = clock.convert_at(T0, 2 * CLOCK_FREQ, None, Tick::MAX).unwrap().ts0;
        assert_eq!(b - a, 2 * CLOCK_FREQ);
    }

    #[test]
    fn pause_shifts_origin_by_pause_duration() {
        let clock = synced_clock(RATE_DEFAULT);
        let (origin, _) = clock.system_origin().unwrap();
        clock.change_pause(true, T0 + 100);
        clock.change_pause(false, T0 + 100 + 500_000);
        let (shifted, _) = clock.system_origin().unwrap();
        assert_eq!(shifted - origin, 500_000);
    }

    #[test]
    fn gap_resets_reference() {
        let clock = synced_clock(RATE_DEFAULT);
        clock.update(CLOCK_FREQ, T0 + CLOCK_FREQ, true, false);
        clock.update(CLOCK_FREQ + CR_MAX_GAP + 1, T0 + 2 * CLOCK_FREQ, true, false);
        let state = clock.state().unwrap();
        assert_eq!(state.stream_start, CLOCK_FREQ + CR_MAX_GAP + 1);
        assert_eq!(state.stream_duration, 0);
    }

    #[test]
    fn reset_drops_reference_but_keeps_jitter() {
        let clock = synced_clock(RATE_DEFAULT);
        clock.set_jitter(300_000, 40);
        // 连续三个迟到 200ms 的采样
        for k in 1..=3 {
            clock.update(k * CLOCK_FREQ, T0 + k * CLOCK_FREQ + 300_000 + 200_000, true, false);
        }
        let jitter = clock.jitter();
        assert_eq!(jitter, 500_000);
        clock.reset();
        assert!(!clock.has_reference());
        assert_eq!(clock.jitter(), jitter);
    }

    #[test]
    fn bound_rejects_far_future_timestamps() {
        let clock = synced_clock(RATE_DEFAULT);
        assert!(clock.convert_at(T0, 100_000, None, CLOCK_FREQ).is_ok());
        assert!(matches!(
            clock.convert_at(T0, 5 * CLOCK_FREQ, None, CLOCK_FREQ),
            Err(InputError::TooLate)
        ));
    }

    #[test]
    fn absolute_origin_change_moves_reference() {
        let clock = synced_clock(RATE_DEFAULT);
        clock.change_system_origin(true, T0 + 1_000_000);
        let (origin, _) = clock.system_origin().unwrap();
        assert_eq!(origin, T0 + 1_000_000);
    }

    #[test]
    fn average_converges_to_constant_sample() {
        let mut avg = Average::new(10);
        for _ in 0..50 {
            avg.update(1000);
        }
        assert_eq!(avg.get(), 1000);
    }
}
