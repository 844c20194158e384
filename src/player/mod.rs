// 输入引擎模块

pub mod control;
pub mod decoder;
pub mod es_out;
pub mod es_select;
pub mod input;
pub mod resource;
pub mod source;
pub mod stats;

pub use control::{ControlQueue, ControlRequest};
pub use decoder::{Codec, CodecFactory, DecoderContext, DecoderHost, DecoderOutput};
pub use es_out::{EsOut, EsOutControl, EsOutMode, TrackHandle};
pub use input::{InputResources, InputThread};
pub use resource::{MuxFactory, MuxOutput, ResourceBroker, SharedMux, SharedSink, Sink, SinkFactory, SinkKind, SinkLease};
pub use source::{Access, Capabilities, Demux, DemuxStatus, Group, Source, SourceOpener, SourceUpdates};
pub use stats::{StatsCounters, StatsSampler};

use std::process;
use std::thread;

/// 日志前缀：进程与线程
pub(crate) fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", process::id(), thread::current().id())
}
