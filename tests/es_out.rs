mod common;

use common::{drain, es_out_fixture, eventually, EsOutFixture, CC_VIDEO_CODEC, FRAME};
use myy_input::core::{
    now, Epg, EpgEvent, EsCategory, EsFormat, InputConfig, InputError, InputEvent, Packet, Tick, TELETEXT_CODEC,
};
use myy_input::player::{EsOutControl, EsOutMode};
use rstest::rstest;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

fn video(id: i32) -> EsFormat {
    EsFormat::new(EsCategory::Video, "h264").with_id(id).with_video(640, 360)
}

fn audio(id: i32, language: &str) -> EsFormat {
    EsFormat::new(EsCategory::Audio, "mp4a")
        .with_id(id)
        .with_language(language)
        .with_audio(48_000, 2)
}

fn packet(pts: Tick) -> Packet {
    let mut packet = Packet::new(vec![0u8; 32], Some(pts), Some(pts));
    packet.duration = FRAME;
    packet
}

/// 结束初始缓冲，让解码器直接输出
fn playing(fx: &EsOutFixture) {
    fx.es_out.set_jitter(100_000, 40);
    for step in 0..5 {
        fx.es_out.set_pcr(step * FRAME).unwrap();
    }
    assert!(!fx.es_out.is_buffering());
}

// ========== 缓冲 ==========

#[test]
fn buffering_ends_once_stream_covers_latency_budget() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    fx.es_out.set_jitter(1_000_000, 40);
    fx.es_out.add(&video(1)).unwrap();
    fx.es_out.add(&audio(2, "en")).unwrap();
    assert!(fx.es_out.is_buffering());

    let mut origins = Vec::new();
    for step in 0..=12 {
        let pcr = step * 100_000;
        fx.es_out.set_pcr(pcr).unwrap();
        if pcr <= 1_000_000 {
            assert!(fx.es_out.is_buffering(), "pcr={} 时应仍在缓冲", pcr);
        } else {
            assert!(!fx.es_out.is_buffering(), "pcr={} 时缓冲应已结束", pcr);
        }
        let clock = fx.es_out.program_clock(0).unwrap();
        origins.push(clock.system_origin().unwrap().0);
    }

    // 参考点建立后只被平移一次
    let changes = origins.windows(2).filter(|w| w[0] != w[1]).count();
    assert_eq!(changes, 1);
}

#[test]
fn cache_level_never_decreases_while_buffering() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    fx.es_out.set_jitter(500_000, 40);
    fx.es_out.add(&video(1)).unwrap();

    for step in 0..10 {
        fx.es_out.set_pcr(step * 80_000).unwrap();
    }

    let levels: Vec<f64> = drain(&fx.events)
        .into_iter()
        .filter_map(|e| match e {
            InputEvent::Cache(level) => Some(level),
            _ => None,
        })
        .collect();
    assert!(!levels.is_empty());
    assert!(levels.windows(2).all(|w| w[0] <= w[1]), "缓冲进度回退: {:?}", levels);
    assert_eq!(levels.last().copied(), Some(1.0));
}

#[test]
fn seek_restarts_buffering() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    fx.es_out.set_jitter(100_000, 40);
    fx.es_out.add(&video(1)).unwrap();
    for step in 0..5 {
        fx.es_out.set_pcr(step * 40_000).unwrap();
    }
    assert!(!fx.es_out.is_buffering());

    drain(&fx.events);
    fx.es_out.change_position();
    assert!(fx.es_out.is_buffering());
    assert!(drain(&fx.events).contains(&InputEvent::Cache(0.0)));
}

#[test]
fn empty_check_forces_end_of_buffering() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    fx.es_out.set_jitter(1_000_000, 40);
    fx.es_out.add(&video(1)).unwrap();
    fx.es_out.set_pcr(0).unwrap();
    assert!(fx.es_out.is_buffering());

    assert!(fx.es_out.is_empty());
    assert!(!fx.es_out.is_buffering());
}

#[test]
fn frame_step_while_paused_buffers_again() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    fx.es_out.set_jitter(100_000, 40);
    fx.es_out.add(&video(1)).unwrap();
    for step in 0..5 {
        fx.es_out.set_pcr(step * 40_000).unwrap();
    }
    assert!(!fx.es_out.is_buffering());

    fx.es_out.change_pause(true, myy_input::core::now());
    assert!(fx.es_out.is_paused());
    fx.es_out.frame_next();
    assert!(fx.es_out.is_buffering());
}

#[test]
fn invalid_pcr_and_group_are_rejected() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    assert!(matches!(fx.es_out.set_pcr(-1), Err(InputError::InvalidPcr(-1))));
    assert!(matches!(fx.es_out.set_group_pcr(-2, 0), Err(InputError::InvalidGroup(-2))));
    assert!(matches!(
        fx.es_out.add(&video(1).with_group(-1)),
        Err(InputError::InvalidGroup(-1))
    ));
    assert!(matches!(fx.es_out.set_group(42), Err(InputError::InvalidGroup(42))));
}

// ========== 轨道选择 ==========

#[test]
fn track_requested_before_it_exists_is_selected_on_arrival() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    fx.es_out.set_es_by_id(5);

    fx.es_out.add(&audio(3, "en")).unwrap();
    assert_eq!(fx.es_out.selected(EsCategory::Audio), Some(3));

    let handle = fx.es_out.add(&audio(5, "de")).unwrap();
    assert!(fx.es_out.es_state(handle));
    assert_eq!(fx.es_out.selected(EsCategory::Audio), Some(5));

    let events = drain(&fx.events);
    assert!(events.contains(&InputEvent::EsSelect {
        category: EsCategory::Audio,
        id: Some(5)
    }));
}

#[rstest]
#[case("", 1)]
#[case("en", 1)]
#[case("fr", 2)]
#[case("de,fr", 2)]
#[case("ja,en", 1)]
fn audio_language_preference_picks_track(#[case] languages: &str, #[case] expected: i32) {
    let config = InputConfig::new("test://a").with_audio_language(languages);
    let fx = es_out_fixture(&config);
    fx.es_out.add(&audio(1, "en")).unwrap();
    fx.es_out.add(&audio(2, "fr")).unwrap();
    assert_eq!(fx.es_out.selected(EsCategory::Audio), Some(expected));
}

#[test]
fn configured_audio_track_id_wins() {
    let config = InputConfig::new("test://a").with_audio_track_id(2);
    let fx = es_out_fixture(&config);
    let first = fx.es_out.add(&audio(1, "en")).unwrap();
    let second = fx.es_out.add(&audio(2, "fr")).unwrap();
    assert!(!fx.es_out.es_state(first));
    assert!(fx.es_out.es_state(second));
}

#[test]
fn repeated_selection_is_idempotent() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    let handle = fx.es_out.add(&video(1)).unwrap();
    assert!(fx.es_out.es_state(handle));
    assert_eq!(fx.es_out.decoder_count(), 1);

    fx.es_out.control(EsOutControl::SetEs(handle)).unwrap();
    fx.es_out.control(EsOutControl::SetEs(handle)).unwrap();
    fx.es_out
        .control(EsOutControl::SetEsState {
            es: handle,
            selected: true,
        })
        .unwrap();
    assert!(fx.es_out.es_state(handle));
    assert_eq!(fx.es_out.decoder_count(), 1);
}

#[test]
fn negative_priority_needs_explicit_selection() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    let handle = fx.es_out.add(&video(1).with_priority(-1)).unwrap();
    assert!(!fx.es_out.es_state(handle));

    fx.es_out.control(EsOutControl::SetEs(handle)).unwrap();
    assert!(fx.es_out.es_state(handle));
}

#[test]
fn disabled_category_is_never_selected() {
    let mut config = InputConfig::new("test://a");
    config.video = false;
    let fx = es_out_fixture(&config);
    let v = fx.es_out.add(&video(1)).unwrap();
    let a = fx.es_out.add(&audio(2, "en")).unwrap();
    assert!(!fx.es_out.es_state(v));
    assert!(fx.es_out.es_state(a));
}

#[test]
fn deleting_main_audio_promotes_another() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    let first = fx.es_out.add(&audio(1, "en")).unwrap();
    let second = fx.es_out.add(&audio(2, "en")).unwrap();
    assert!(fx.es_out.es_state(first));
    assert!(!fx.es_out.es_state(second));

    fx.es_out.del(first);
    assert!(fx.es_out.es_state(second));
    assert_eq!(fx.es_out.selected(EsCategory::Audio), Some(2));
    assert_eq!(fx.es_out.tracks().len(), 1);
}

#[test]
fn inactive_output_selects_nothing_until_activated() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    fx.es_out.set_active(false);
    let handle = fx.es_out.add(&video(1)).unwrap();
    assert!(!fx.es_out.es_state(handle));

    fx.es_out.set_active(true);
    fx.es_out.set_mode(EsOutMode::Auto);
    assert!(fx.es_out.es_state(handle));
}

#[test]
fn mode_none_unselects_everything() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    let v = fx.es_out.add(&video(1)).unwrap();
    let a = fx.es_out.add(&audio(2, "en")).unwrap();
    fx.es_out.set_mode(EsOutMode::None);
    assert!(!fx.es_out.es_state(v));
    assert!(!fx.es_out.es_state(a));
    assert_eq!(fx.es_out.decoder_count(), 0);
}

// ========== 节目 ==========

#[test]
fn switching_program_keeps_a_single_selected_program() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    let v1 = fx.es_out.add(&video(10).with_group(1)).unwrap();
    let v2 = fx.es_out.add(&video(20).with_group(2)).unwrap();
    assert_eq!(fx.es_out.current_program(), Some(1));
    assert!(fx.es_out.es_state(v1));
    assert!(!fx.es_out.es_state(v2));

    fx.es_out.set_group(2).unwrap();
    assert_eq!(fx.es_out.current_program(), Some(2));
    assert!(!fx.es_out.es_state(v1));
    assert!(fx.es_out.es_state(v2));

    let selected: Vec<i32> = fx
        .es_out
        .programs()
        .iter()
        .filter(|p| p.selected)
        .map(|p| p.id)
        .collect();
    assert_eq!(selected, vec![2]);
}

#[test]
fn configured_program_is_selected_when_it_appears() {
    let config = InputConfig::new("test://a").with_program(7);
    let fx = es_out_fixture(&config);
    fx.es_out.add(&video(1).with_group(3)).unwrap();
    assert_eq!(fx.es_out.current_program(), Some(3));
    let handle = fx.es_out.add(&video(2).with_group(7)).unwrap();
    assert_eq!(fx.es_out.current_program(), Some(7));
    assert!(fx.es_out.es_state(handle));
}

#[test]
fn busy_program_cannot_be_deleted() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    let handle = fx.es_out.add(&video(1).with_group(4)).unwrap();
    assert!(matches!(
        fx.es_out.control(EsOutControl::DelGroup(4)),
        Err(InputError::ProgramBusy(4))
    ));
    fx.es_out.del(handle);
    fx.es_out.control(EsOutControl::DelGroup(4)).unwrap();
    assert!(fx.es_out.programs().is_empty());
}

#[test]
fn scrambled_track_marks_its_program() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    let handle = fx.es_out.add(&video(1).with_group(1)).unwrap();
    fx.es_out
        .control(EsOutControl::SetEsScrambledState {
            es: handle,
            scrambled: true,
        })
        .unwrap();
    assert!(fx.es_out.programs()[0].scrambled);
    assert!(drain(&fx.events).contains(&InputEvent::ProgramScrambled {
        id: 1,
        scrambled: true
    }));
}

// ========== 删除 ==========

#[test]
fn deleting_a_track_behind_a_paused_decoder_returns() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    let handle = fx.es_out.add(&video(1)).unwrap();
    playing(&fx);

    fx.es_out.change_pause(true, now());
    for i in 5..25 {
        fx.es_out.send(handle, packet(i * FRAME)).unwrap();
    }
    assert!(!fx.es_out.is_empty());

    let started = Instant::now();
    fx.es_out.del(handle);
    assert!(started.elapsed() < Duration::from_secs(2), "删除被暂停的解码器阻塞");
    assert!(fx.es_out.tracks().is_empty());
}

#[test]
fn deleting_while_dying_skips_the_drain() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    let handle = fx.es_out.add(&video(1)).unwrap();
    playing(&fx);

    // 解码线程看到退出标志后不再消费
    fx.die.store(true, Ordering::SeqCst);
    std::thread::sleep(Duration::from_millis(60));
    for i in 5..10 {
        fx.es_out.send(handle, packet(i * FRAME)).unwrap();
    }

    let started = Instant::now();
    fx.es_out.del(handle);
    assert!(started.elapsed() < Duration::from_millis(500));
    assert!(fx.es_out.tracks().is_empty());
}

// ========== 隐藏字幕 ==========

#[test]
fn closed_captions_in_video_add_a_child_track() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    let fmt = EsFormat::new(EsCategory::Video, CC_VIDEO_CODEC).with_id(1).with_video(720, 480);
    let handle = fx.es_out.add(&fmt).unwrap();

    let mut pts = 0;
    let found = eventually(Duration::from_secs(2), || {
        fx.es_out.send(handle, packet(pts)).unwrap();
        pts += FRAME;
        fx.es_out.tracks().iter().any(|t| t.codec == "cc1")
    });
    assert!(found, "没有出现隐藏字幕轨道");

    let captions: Vec<_> = fx
        .es_out
        .tracks()
        .into_iter()
        .filter(|t| t.category == EsCategory::Subtitle)
        .collect();
    assert_eq!(captions.len(), 1);
    assert_eq!(captions[0].group, 0);

    // 父轨道被删除时子轨道一起删除
    fx.es_out.del(handle);
    assert!(fx.es_out.tracks().is_empty());
}

// ========== 节目指南与图文电视 ==========

fn epg_event(start: i64, name: &str) -> EpgEvent {
    EpgEvent {
        start,
        duration: 600,
        name: name.to_string(),
        short_description: None,
    }
}

#[test]
fn program_epg_drives_now_playing() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    fx.es_out.add(&video(1).with_group(3)).unwrap();
    drain(&fx.events);

    let epg = Epg {
        name: None,
        events: vec![epg_event(1_000, "新闻"), epg_event(1_600, "天气")],
        current: Some(1_000),
    };
    fx.es_out.control(EsOutControl::SetGroupEpg { group: 3, epg }).unwrap();
    assert_eq!(fx.es_out.programs()[0].now_playing.as_deref(), Some("新闻"));
    let events = drain(&fx.events);
    assert!(events.iter().any(|e| matches!(e, InputEvent::ProgramEpg { id: 3, .. })));
    assert!(events.contains(&InputEvent::NowPlaying(Some("新闻".to_string()))));

    // 增量表：只带下一个事件并把它标为当前
    let update = Epg {
        name: None,
        events: vec![epg_event(1_600, "天气预报")],
        current: Some(1_600),
    };
    fx.es_out
        .control(EsOutControl::SetGroupEpg { group: 3, epg: update })
        .unwrap();
    let merged = fx.es_out.program_epg(3).unwrap();
    assert_eq!(merged.events.len(), 2);
    assert_eq!(merged.current_event().map(|e| e.name.as_str()), Some("天气预报"));
    assert_eq!(fx.es_out.programs()[0].now_playing.as_deref(), Some("天气预报"));
}

#[test]
fn epg_of_a_background_program_is_stored_quietly() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    fx.es_out.add(&video(1).with_group(1)).unwrap();
    fx.es_out.add(&video(2).with_group(2)).unwrap();
    assert_eq!(fx.es_out.current_program(), Some(1));
    drain(&fx.events);

    let epg = Epg {
        name: None,
        events: vec![epg_event(0, "电影")],
        current: Some(0),
    };
    fx.es_out.control(EsOutControl::SetGroupEpg { group: 2, epg }).unwrap();
    let events = drain(&fx.events);
    assert!(!events.iter().any(|e| matches!(e, InputEvent::NowPlaying(_))));
    assert!(events.contains(&InputEvent::ProgramUpdated { id: 2 }));

    // 切换过去时带上它的正在播出
    fx.es_out.set_group(2).unwrap();
    assert!(drain(&fx.events).contains(&InputEvent::NowPlaying(Some("电影".to_string()))));
}

#[test]
fn epg_for_missing_program_is_ignored() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    fx.es_out
        .control(EsOutControl::SetGroupEpg {
            group: 9,
            epg: Epg::default(),
        })
        .unwrap();
    assert!(fx.es_out.programs().is_empty());
    assert!(matches!(
        fx.es_out.control(EsOutControl::SetGroupEpg {
            group: -1,
            epg: Epg::default(),
        }),
        Err(InputError::InvalidGroup(-1))
    ));
}

#[test]
fn teletext_track_lifecycle_is_announced() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    fx.es_out.add(&video(1)).unwrap();
    let fmt = EsFormat::new(EsCategory::Subtitle, TELETEXT_CODEC)
        .with_id(5)
        .with_teletext(8, 0x88);
    let handle = fx.es_out.add(&fmt).unwrap();
    let mut events = drain(&fx.events);
    assert!(events.contains(&InputEvent::TeletextAdd {
        id: 5,
        page: Some("888".to_string())
    }));

    fx.es_out.control(EsOutControl::SetEs(handle)).unwrap();
    assert!(fx.es_out.es_state(handle));
    fx.es_out.control(EsOutControl::UnsetEs(Some(EsCategory::Subtitle))).unwrap();
    events.extend(drain(&fx.events));
    assert!(events.contains(&InputEvent::TeletextSelect { id: Some(5) }));
    assert!(events.contains(&InputEvent::TeletextSelect { id: None }));

    fx.es_out.del(handle);
    assert!(drain(&fx.events).contains(&InputEvent::TeletextDel { id: Some(5) }));
}

#[test]
fn plain_subtitles_raise_no_teletext_add() {
    let fx = es_out_fixture(&InputConfig::new("test://a"));
    fx.es_out
        .add(&EsFormat::new(EsCategory::Subtitle, "subt").with_id(7))
        .unwrap();
    assert!(!drain(&fx.events)
        .iter()
        .any(|e| matches!(e, InputEvent::TeletextAdd { .. })));
}
