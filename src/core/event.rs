use crate::core::{EsCategory, Epg, InputState, InputStats, Meta, Tick};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// 输入引擎对外发出的事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum InputEvent {
    State(InputState),
    /// 输入线程已结束
    Dead,
    Rate(i32),
    Times { position: f64, time: Tick, length: Tick },
    Length(Tick),
    Title(usize),
    Seekpoint { title: usize, seekpoint: usize },
    /// 缓冲进度 0.0 - 1.0
    Cache(f64),
    ItemMeta(Meta),
    AudioDelay(Tick),
    SubtitleDelay(Tick),
    Record(bool),
    Statistics(InputStats),
    ProgramAdd { id: i32, name: String },
    ProgramDel { id: i32 },
    ProgramSelect { id: i32 },
    ProgramUpdated { id: i32 },
    ProgramScrambled { id: i32, scrambled: bool },
    ProgramEpg { id: i32, epg: Epg },
    /// 当前节目正在播出的内容（来自 EPG）
    NowPlaying(Option<String>),
    EsAdd { category: EsCategory, id: i32, name: String },
    EsDel { category: EsCategory, id: i32 },
    EsUpdated { category: EsCategory, id: i32 },
    /// id 为 None 表示该类别取消选择
    EsSelect { category: EsCategory, id: Option<i32> },
    /// page 为初始页号，如 "100"
    TeletextAdd { id: i32, page: Option<String> },
    /// id 为 None 表示全部移除
    TeletextDel { id: Option<i32> },
    TeletextSelect { id: Option<i32> },
}

/// 事件总线
///
/// 每个订阅者拥有一条无界通道；订阅者丢弃接收端后自动移除
#[derive(Clone, Default)]
pub struct EventBus {
    subscribers: Arc<Mutex<Vec<Sender<InputEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<InputEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: InputEvent) {
        let mut subscribers = self.subscribers.lock();
        if subscribers.is_empty() {
            return;
        }
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_reaches_every_subscriber() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        let b = bus.subscribe();
        bus.publish(InputEvent::Rate(2000));
        assert_eq!(a.try_recv().unwrap(), InputEvent::Rate(2000));
        assert_eq!(b.try_recv().unwrap(), InputEvent::Rate(2000));
    }

    #[test]
    fn dropped_subscriber_is_removed() {
        let bus = EventBus::new();
        let a = bus.subscribe();
        drop(bus.subscribe());
        bus.publish(InputEvent::Dead);
        assert_eq!(bus.subscriber_count(), 1);
        assert_eq!(a.try_recv().unwrap(), InputEvent::Dead);
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_string(&InputEvent::Cache(0.5)).unwrap();
        assert!(json.contains("\"type\":\"cache\""));
    }
}
