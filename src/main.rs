use anyhow::Result;
use log::info;
use myy_input::core::{
    EsCategory, EsFormat, Frame, InputConfig, InputEvent, InputState, Meta, Packet, Tick, CLOCK_FREQ,
};
use myy_input::player::{
    Capabilities, Codec, CodecFactory, Demux, DemuxStatus, EsOut, InputResources, InputThread, ResourceBroker,
    Sink, SinkFactory, SinkKind, Source, SourceOpener, TrackHandle,
};
use std::sync::Arc;
use std::time::Duration;

/// 演示用时长
const DEMO_LENGTH: Tick = 3 * CLOCK_FREQ;
const FRAME_DURATION: Tick = 40_000;

/// 合成源：一路视频、一路音频，每 40ms 一帧
struct SyntheticDemux {
    video: Option<TrackHandle>,
    audio: Option<TrackHandle>,
    time: Tick,
}

impl SyntheticDemux {
    fn open(out: &EsOut) -> myy_input::Result<Self> {
        let video = out.add(
            &EsFormat::new(EsCategory::Video, "h264")
                .with_id(1)
                .with_video(1280, 720),
        )?;
        let audio = out.add(
            &EsFormat::new(EsCategory::Audio, "mp4a")
                .with_id(2)
                .with_language("zh")
                .with_audio(48_000, 2),
        )?;
        Ok(Self {
            video: Some(video),
            audio: Some(audio),
            time: 0,
        })
    }
}

impl Demux for SyntheticDemux {
    fn demux(&mut self, out: &EsOut) -> myy_input::Result<DemuxStatus> {
        if self.time >= DEMO_LENGTH {
            return Ok(DemuxStatus::Eof);
        }
        let ts = self.time;
        out.set_pcr(ts)?;
        for handle in [self.video, self.audio].into_iter().flatten() {
            let mut packet = Packet::new(vec![0u8; 188], Some(ts), Some(ts));
            packet.duration = FRAME_DURATION;
            out.send(handle, packet)?;
        }
        self.time += FRAME_DURATION;
        Ok(DemuxStatus::More)
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            can_pause: true,
            can_pace_control: true,
            can_rate_control: false,
            can_seek: true,
        }
    }

    fn position(&self) -> Option<f64> {
        Some(self.time as f64 / DEMO_LENGTH as f64)
    }

    fn time(&self) -> Option<Tick> {
        Some(self.time)
    }

    fn length(&self) -> Option<Tick> {
        Some(DEMO_LENGTH)
    }

    fn meta(&self) -> Option<Meta> {
        Some(Meta {
            title: Some("合成测试源".to_string()),
            ..Default::default()
        })
    }

    fn set_position(&mut self, position: f64) -> myy_input::Result<()> {
        self.time = (DEMO_LENGTH as f64 * position) as Tick;
        Ok(())
    }

    fn set_time(&mut self, time: Tick) -> myy_input::Result<()> {
        self.time = time.clamp(0, DEMO_LENGTH);
        Ok(())
    }

    fn set_pause_state(&mut self, _paused: bool) -> myy_input::Result<()> {
        Ok(())
    }
}

struct SyntheticOpener;

impl SourceOpener for SyntheticOpener {
    fn open(&self, location: &str, _hint: Option<&str>, out: &EsOut) -> myy_input::Result<Source> {
        Ok(Source::new(location, Box::new(SyntheticDemux::open(out)?)))
    }
}

/// 原样把数据包变成帧
struct PassthroughCodec(EsCategory);

impl Codec for PassthroughCodec {
    fn decode(&mut self, packet: &Packet) -> myy_input::Result<Vec<Frame>> {
        Ok(vec![Frame {
            category: self.0,
            pts: packet.date().unwrap_or(0),
            duration: packet.duration,
            data: packet.data.clone(),
        }])
    }
}

struct PassthroughCodecs;

impl CodecFactory for PassthroughCodecs {
    fn create(&self, fmt: &EsFormat) -> myy_input::Result<Box<dyn Codec>> {
        Ok(Box::new(PassthroughCodec(fmt.category)))
    }
}

/// 只打日志的渲染端
struct LogSink {
    kind: SinkKind,
    rendered: u64,
}

impl Sink for LogSink {
    fn kind(&self) -> SinkKind {
        self.kind
    }

    fn is_compatible(&self, _fmt: &EsFormat) -> bool {
        true
    }

    fn render(&mut self, frame: Frame, deadline: Tick, rate: i32) {
        self.rendered += 1;
        if self.rendered % 25 == 0 {
            info!(
                "🖼️ {:?} 渲染第 {} 帧 pts={}ms deadline={} rate={}",
                self.kind,
                self.rendered,
                frame.pts / 1000,
                deadline,
                rate
            );
        }
    }

    fn flush(&mut self) {}
}

struct LogSinks;

impl SinkFactory for LogSinks {
    fn create(&self, kind: SinkKind, _fmt: &EsFormat) -> myy_input::Result<Box<dyn Sink>> {
        Ok(Box::new(LogSink { kind, rendered: 0 }))
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    info!("🎬 MYY Input 演示启动");

    // 可选：第一个参数为 JSON 配置文件
    let config = match std::env::args().nth(1) {
        Some(path) => InputConfig::from_json_file(&path)?,
        None => InputConfig::new("synthetic://demo").with_pts_delay_ms(200),
    };

    let resources = InputResources {
        opener: Arc::new(SyntheticOpener),
        codecs: Arc::new(PassthroughCodecs),
        broker: Arc::new(ResourceBroker::new(Arc::new(LogSinks), None)),
    };

    let mut input = InputThread::new(config, resources)?;
    let events = input.subscribe();
    input.start()?;

    loop {
        match events.recv_timeout(Duration::from_secs(10)) {
            Ok(InputEvent::State(state)) => {
                info!("📣 状态: {:?}", state);
                if matches!(state, InputState::End | InputState::Error) {
                    break;
                }
            }
            Ok(InputEvent::Statistics(stats)) => {
                info!("📊 已读 {} 包, {:.0} B/s", stats.demux_read_packets, stats.demux_bitrate);
            }
            Ok(_) => {}
            Err(e) => {
                info!("⏱️ 等待事件超时: {}", e);
                break;
            }
        }
    }

    let snapshot = input.snapshot();
    info!("{}", serde_json::to_string_pretty(&snapshot)?);
    input.stop();
    info!("👋 演示结束");
    Ok(())
}
