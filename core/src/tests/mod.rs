
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::config::EngineConfig;
use crate::credentials::StaticCredentials;
use crate::engine::DownloadEngine;
use crate::error::{CoreError, ErrorKind};
use crate::events::TaskEvent;
use crate::resolver::{MediaDescriptor, StreamKind, StreamVariant};
use crate::task::{TaskId, TaskState};

use self::support::*;

const WAIT: Duration = Duration::from_secs(10);

fn failure_kind(harness: &Harness, id: &TaskId) -> Option<ErrorKind> {
    harness
        .engine
        .task(id)
        .unwrap()
        .failure
        .map(|failure| failure.kind)
}

#[test]
fn test_single_item_is_downloaded_merged_and_promoted() {
    let harness = Harness::new(3);
    harness.post(
        "https://media.example/p/1",
        "Sunset clip",
        Resource::sized(300, b'v'),
        Resource::sized(100, b'a'),
    );
    let id = harness
        .engine
        .submit(harness.request("https://media.example/p/1"))
        .unwrap();
    assert_eq!(
        harness.engine.wait_for(&id, WAIT).unwrap(),
        Some(TaskState::Completed)
    );

    let view = harness.engine.task(&id).unwrap();
    let output = view.primary_output().unwrap().to_path_buf();
    assert_eq!(output, harness.target.path().join("Sunset clip.mp4"));
    let bytes = std::fs::read(&output).unwrap();
    assert_eq!(bytes.len(), 400);
    assert!(bytes[..300].iter().all(|b| *b == b'v'));
    assert_eq!(harness.target_entries(), vec!["Sunset clip.mp4".to_string()]);
    assert_eq!(view.item_count, 1);
    assert_eq!(harness.muxer.merges.load(Ordering::SeqCst), 1);

    let snapshot = harness.engine.snapshot(&id).unwrap();
    assert_eq!(snapshot.state, TaskState::Completed);
    assert_eq!(snapshot.bytes_received, 400);
    assert_eq!(snapshot.bytes_total, Some(400));
}

#[test]
fn test_events_are_ordered_and_progress_never_decreases() {
    let harness = Harness::new(2);
    harness.post(
        "https://media.example/p/2",
        "clip",
        Resource::sized(2000, 1).slow(64, Duration::from_millis(1)),
        Resource::sized(500, 2).slow(32, Duration::from_millis(1)),
    );
    let id = harness
        .engine
        .submit(harness.request("https://media.example/p/2"))
        .unwrap();
    harness.engine.wait_for(&id, WAIT).unwrap();

    let events = harness.sink.for_task(id);
    assert!(matches!(events.first(), Some(TaskEvent::TaskCreated { .. })));
    assert!(matches!(events.last(), Some(TaskEvent::TaskCompleted { .. })));
    assert_eq!(events.iter().filter(|event| event.is_terminal()).count(), 1);

    let snapshots: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            TaskEvent::TaskProgress { snapshot, .. } => Some(snapshot.clone()),
            _ => None,
        })
        .collect();
    let mut last = 0;
    for snapshot in &snapshots {
        assert!(snapshot.bytes_received >= last, "progress went backwards");
        last = snapshot.bytes_received;
    }
    let states: Vec<TaskState> = snapshots.iter().map(|snapshot| snapshot.state).collect();
    let first_of = |state: TaskState| states.iter().position(|s| *s == state).unwrap();
    assert!(first_of(TaskState::Resolving) < first_of(TaskState::Downloading));
    assert!(first_of(TaskState::Downloading) < first_of(TaskState::Merging));
    assert_eq!(snapshots.last().unwrap().bytes_received, 2500);
}

#[test]
fn test_five_tasks_with_limit_three() {
    let harness = Harness::new(3);
    let gate = Arc::new(Gate::default());
    let urls: Vec<String> = (0..5).map(|i| format!("https://media.example/q/{}", i)).collect();
    for url in &urls {
        harness.post(
            url,
            "clip",
            Resource::sized(64, 0).gated(gate.clone()),
            Resource::sized(32, 1).gated(gate.clone()),
        );
    }
    let ids: Vec<TaskId> = urls
        .iter()
        .map(|url| harness.engine.submit(harness.request(url)).unwrap())
        .collect();

    let downloading = || {
        ids.iter()
            .filter(|id| harness.engine.task(id).unwrap().state == TaskState::Downloading)
            .count()
    };
    assert!(wait_until(WAIT, || downloading() == 3));
    for id in &ids[..3] {
        assert_eq!(harness.engine.task(id).unwrap().state, TaskState::Downloading);
    }
    for id in &ids[3..] {
        assert_eq!(harness.engine.task(id).unwrap().state, TaskState::Queued);
    }
    assert_eq!(harness.engine.queue_position(&ids[3]), Some(0));
    assert_eq!(harness.engine.queue_position(&ids[4]), Some(1));
    assert_eq!(harness.resolver.calls().len(), 3);

    gate.open();
    harness.engine.wait_all().unwrap();
    for id in &ids {
        assert_eq!(harness.engine.task(id).unwrap().state, TaskState::Completed);
    }
    let listed: Vec<TaskId> = harness.engine.list().iter().map(|view| view.id).collect();
    assert_eq!(listed, ids);
}

#[test]
fn test_active_tasks_never_exceed_the_limit() {
    let harness = Harness::new(2);
    let urls: Vec<String> = (0..8).map(|i| format!("https://media.example/b/{}", i)).collect();
    for url in &urls {
        harness.post(
            url,
            "burst",
            Resource::sized(256, 0).slow(64, Duration::from_millis(2)),
            Resource::sized(64, 1),
        );
    }
    for url in &urls {
        harness.engine.submit(harness.request(url)).unwrap();
    }
    harness.engine.wait_all().unwrap();

    let mut active: HashSet<TaskId> = HashSet::new();
    let mut peak = 0;
    for event in harness.sink.events() {
        match &event {
            TaskEvent::TaskProgress { id, snapshot } if snapshot.state.is_active() => {
                active.insert(*id);
            }
            event if event.is_terminal() => {
                active.remove(&event.task_id());
            }
            _ => {}
        }
        peak = peak.max(active.len());
    }
    assert_eq!(peak, 2);
    assert!(harness
        .engine
        .list()
        .iter()
        .all(|view| view.state == TaskState::Completed));
}

#[test]
fn test_admission_is_fifo() {
    let harness = Harness::new(1);
    let urls: Vec<String> = (0..4).map(|i| format!("https://media.example/f/{}", i)).collect();
    for url in &urls {
        harness.post(url, "clip", Resource::sized(40, 0), Resource::sized(8, 1));
    }
    for url in &urls {
        harness.engine.submit(harness.request(url)).unwrap();
    }
    harness.engine.wait_all().unwrap();
    assert_eq!(harness.resolver.calls(), urls);
    // Same title four times: the later ones get numbered names.
    assert_eq!(
        harness.target_entries(),
        vec!["clip (1).mp4", "clip (2).mp4", "clip (3).mp4", "clip.mp4"]
    );
}

#[test]
fn test_cancel_queued_task_never_resolves() {
    let harness = Harness::new(1);
    let gate = Arc::new(Gate::default());
    harness.post(
        "https://media.example/c/1",
        "first",
        Resource::sized(32, 0).gated(gate.clone()),
        Resource::sized(32, 1).gated(gate.clone()),
    );
    harness.post(
        "https://media.example/c/2",
        "second",
        Resource::sized(32, 0),
        Resource::sized(32, 1),
    );
    let first = harness
        .engine
        .submit(harness.request("https://media.example/c/1"))
        .unwrap();
    let second = harness
        .engine
        .submit(harness.request("https://media.example/c/2"))
        .unwrap();
    assert_eq!(harness.engine.task(&second).unwrap().state, TaskState::Queued);

    assert!(harness.engine.cancel(&second));
    assert_eq!(harness.engine.task(&second).unwrap().state, TaskState::Cancelled);
    assert!(harness.engine.cancel(&second));

    gate.open();
    assert_eq!(
        harness.engine.wait_for(&first, WAIT).unwrap(),
        Some(TaskState::Completed)
    );
    harness.engine.wait_all().unwrap();
    assert_eq!(harness.resolver.calls_for("https://media.example/c/2"), 0);
    assert!(!harness.engine.cancel(&first));
    assert!(!harness.engine.cancel(&uuid::Uuid::new_v4()));
    let events = harness.sink.for_task(second);
    assert_eq!(events.len(), 2);
    assert!(matches!(events[1], TaskEvent::TaskCancelled { .. }));
}

#[test]
fn test_cancel_mid_download_removes_temp_files() {
    let harness = Harness::new(1);
    harness.post(
        "https://media.example/m/1",
        "long",
        Resource::sized(8000, 0).slow(8, Duration::from_millis(5)),
        Resource::sized(8000, 1).slow(8, Duration::from_millis(5)),
    );
    let id = harness
        .engine
        .submit(harness.request("https://media.example/m/1"))
        .unwrap();
    assert!(wait_until(WAIT, || {
        harness.engine.snapshot(&id).unwrap().bytes_received > 0
    }));
    assert!(harness.target_entries()[0].starts_with(".mediagrab-"));

    assert!(harness.engine.cancel(&id));
    assert_eq!(
        harness.engine.wait_for(&id, WAIT).unwrap(),
        Some(TaskState::Cancelled)
    );
    assert!(harness.target_entries().is_empty());
    let events = harness.sink.for_task(id);
    assert!(matches!(events.last(), Some(TaskEvent::TaskCancelled { .. })));
    assert!(harness.engine.snapshot(&id).unwrap().bytes_received < 16_000);
}

#[test]
fn test_failed_audio_stream_fails_the_task() {
    let harness = Harness::new(1);
    harness.post(
        "https://media.example/a/1",
        "clip",
        Resource::sized(4000, 0).slow(16, Duration::from_millis(2)),
        Resource::sized(10, 1).status(404),
    );
    let id = harness
        .engine
        .submit(harness.request("https://media.example/a/1"))
        .unwrap();
    assert_eq!(
        harness.engine.wait_for(&id, WAIT).unwrap(),
        Some(TaskState::Failed)
    );
    assert_eq!(failure_kind(&harness, &id), Some(ErrorKind::StreamFetchError));
    let detail = harness.engine.task(&id).unwrap().failure.unwrap().detail;
    assert!(detail.starts_with("audio stream failed"), "{}", detail);
    assert!(harness.target_entries().is_empty());
    assert_eq!(harness.muxer.checks.load(Ordering::SeqCst), 0);
}

#[test]
fn test_transient_errors_are_retried() {
    let harness = Harness::new(1);
    harness.post(
        "https://media.example/r/1",
        "clip",
        Resource::sized(100, 0).failing(2),
        Resource::sized(50, 1),
    );
    let id = harness
        .engine
        .submit(harness.request("https://media.example/r/1"))
        .unwrap();
    assert_eq!(
        harness.engine.wait_for(&id, WAIT).unwrap(),
        Some(TaskState::Completed)
    );
    assert_eq!(harness.net.opens("https://media.example/r/1/video"), 3);
    assert_eq!(harness.net.opens("https://media.example/r/1/audio"), 1);
}

#[test]
fn test_multi_item_post_yields_one_file_per_item() {
    let harness = Harness::new(1);
    let url = "https://media.example/album/9";
    let mut descriptors = Vec::new();
    for index in 0..3u8 {
        let locator = format!("{}/item{}", url, index);
        harness
            .net
            .serve(&locator, Resource::sized(20 + index as usize, index));
        descriptors.push(
            MediaDescriptor::new("album")
                .with_variant(StreamVariant::new(StreamKind::Muxed, locator).with_height(480)),
        );
    }
    harness.resolver.answer(url, descriptors);
    let id = harness.engine.submit(harness.request(url)).unwrap();
    assert_eq!(
        harness.engine.wait_for(&id, WAIT).unwrap(),
        Some(TaskState::Completed)
    );
    let view = harness.engine.task(&id).unwrap();
    assert_eq!(view.item_count, 3);
    assert_eq!(view.outputs.len(), 3);
    assert_eq!(
        harness.target_entries(),
        vec!["album (1 of 3).mp4", "album (2 of 3).mp4", "album (3 of 3).mp4"]
    );
    assert_eq!(std::fs::read(&view.outputs[2]).unwrap(), vec![2u8; 22]);
    // Single muxed streams pass through without the toolchain.
    assert_eq!(harness.muxer.checks.load(Ordering::SeqCst), 0);
}

#[test]
fn test_missing_toolchain_fails_before_merging() {
    let harness = Harness::with(test_config(), ConcatMuxer::missing());
    harness.post(
        "https://media.example/t/1",
        "clip",
        Resource::sized(64, 0),
        Resource::sized(64, 1),
    );
    let id = harness
        .engine
        .submit(harness.request("https://media.example/t/1"))
        .unwrap();
    assert_eq!(
        harness.engine.wait_for(&id, WAIT).unwrap(),
        Some(TaskState::Failed)
    );
    assert_eq!(failure_kind(&harness, &id), Some(ErrorKind::ToolchainUnavailable));
    assert_eq!(harness.muxer.merges.load(Ordering::SeqCst), 0);
    assert!(harness.target_entries().is_empty());
}

#[test]
fn test_post_without_media_is_not_found() {
    let harness = Harness::new(1);
    harness.resolver.answer("https://media.example/e/1", Vec::new());
    harness
        .resolver
        .fail("https://media.example/e/2", || CoreError::AuthRequired("private post".to_string()));
    let empty = harness
        .engine
        .submit(harness.request("https://media.example/e/1"))
        .unwrap();
    let private = harness
        .engine
        .submit(harness.request("https://media.example/e/2"))
        .unwrap();
    harness.engine.wait_all().unwrap();
    assert_eq!(failure_kind(&harness, &empty), Some(ErrorKind::NotFound));
    assert_eq!(failure_kind(&harness, &private), Some(ErrorKind::AuthRequired));
    assert_eq!(harness.resolver.calls_for("https://media.example/e/2"), 1);
}

#[test]
fn test_unavailable_credentials_fail_before_resolving() {
    let net = Arc::new(MemoryNet::default());
    let resolver = Arc::new(ScriptedResolver::default());
    let target = tempfile::tempdir().unwrap();
    let engine = DownloadEngine::builder(test_config())
        .with_net_client(net)
        .with_resolver(resolver.clone())
        .with_credentials(Arc::new(StaticCredentials::new()))
        .build()
        .unwrap();
    let request = crate::task::DownloadRequest::new("https://media.example/x/1", target.path())
        .with_credential_source("firefox");
    let id = engine.submit(request).unwrap();
    assert_eq!(engine.wait_for(&id, WAIT).unwrap(), Some(TaskState::Failed));
    assert_eq!(
        engine.task(&id).unwrap().failure.unwrap().kind,
        ErrorKind::CredentialsUnavailable
    );
    assert!(resolver.calls().is_empty());
}

#[test]
fn test_invalid_requests_are_rejected_synchronously() {
    let harness = Harness::new(1);
    let err = harness.engine.submit(harness.request("   ")).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
    let missing_dir = crate::task::DownloadRequest::new(
        "https://media.example/p/1",
        harness.target.path().join("nope"),
    );
    assert!(harness.engine.submit(missing_dir).is_err());
    assert!(harness.engine.list().is_empty());
    assert!(harness.sink.events().is_empty());
    assert!(matches!(
        harness.engine.snapshot(&uuid::Uuid::new_v4()),
        Err(CoreError::TaskNotFound(_))
    ));
}

#[test]
fn test_shutdown_cancels_everything() {
    let harness = Harness::with(
        EngineConfig {
            max_concurrent_tasks: 1,
            ..test_config()
        },
        ConcatMuxer::default(),
    );
    harness.post(
        "https://media.example/s/1",
        "running",
        Resource::sized(8000, 0).slow(8, Duration::from_millis(5)),
        Resource::sized(80, 1),
    );
    harness.post(
        "https://media.example/s/2",
        "waiting",
        Resource::sized(8, 0),
        Resource::sized(8, 1),
    );
    let running = harness
        .engine
        .submit(harness.request("https://media.example/s/1"))
        .unwrap();
    let waiting = harness
        .engine
        .submit(harness.request("https://media.example/s/2"))
        .unwrap();
    assert!(wait_until(WAIT, || {
        harness.engine.snapshot(&running).unwrap().bytes_received > 0
    }));

    harness.engine.shutdown();
    assert_eq!(harness.engine.task(&running).unwrap().state, TaskState::Cancelled);
    assert_eq!(harness.engine.task(&waiting).unwrap().state, TaskState::Cancelled);
    assert!(harness.target_entries().is_empty());
    assert!(harness
        .engine
        .submit(harness.request("https://media.example/s/2"))
        .is_err());
    harness.engine.shutdown();
}

#[test]
fn test_sweep_during_download_keeps_live_temp_dir() {
    let harness = Harness::new(1);
    harness.post(
        "https://media.example/w/1",
        "clip",
        Resource::sized(800, 0).slow(8, Duration::from_millis(2)),
        Resource::sized(80, 1),
    );
    let leftover = harness.target.path().join(".mediagrab-leftover");
    std::fs::create_dir(&leftover).unwrap();
    let id = harness
        .engine
        .submit(harness.request("https://media.example/w/1"))
        .unwrap();
    assert!(wait_until(WAIT, || {
        harness.engine.snapshot(&id).unwrap().bytes_received > 0
    }));

    assert_eq!(harness.engine.sweep_stale_temp(harness.target.path()).unwrap(), 1);
    assert!(!leftover.exists());
    assert!(harness
        .target_entries()
        .iter()
        .any(|name| name.starts_with(".mediagrab-") && !name.ends_with(".lock")));

    assert_eq!(
        harness.engine.wait_for(&id, WAIT).unwrap(),
        Some(TaskState::Completed)
    );
    assert_eq!(harness.target_entries(), vec!["clip.mp4".to_string()]);
    assert_eq!(std::fs::read(harness.target.path().join("clip.mp4")).unwrap().len(), 880);
}

/// Serves `count` video+audio items under `url` and returns their descriptors.
fn album(harness: &Harness, url: &str, count: u8) -> Vec<MediaDescriptor> {
    (0..count)
        .map(|index| {
            let video = format!("{}/{}/video", url, index);
            let audio = format!("{}/{}/audio", url, index);
            harness.net.serve(&video, Resource::sized(30, b'a' + index));
            harness.net.serve(&audio, Resource::sized(10, b'A' + index));
            MediaDescriptor::new("album")
                .with_variant(StreamVariant::new(StreamKind::Video, video).with_height(720))
                .with_variant(StreamVariant::new(StreamKind::Audio, audio).with_bitrate(128))
        })
        .collect()
}

#[test]
fn test_multi_item_post_merges_every_item() {
    let harness = Harness::new(1);
    let url = "https://media.example/album/3";
    let descriptors = album(&harness, url, 3);
    harness.resolver.answer(url, descriptors);
    let id = harness.engine.submit(harness.request(url)).unwrap();
    assert_eq!(
        harness.engine.wait_for(&id, WAIT).unwrap(),
        Some(TaskState::Completed)
    );
    assert_eq!(harness.muxer.merges.load(Ordering::SeqCst), 3);
    assert_eq!(harness.muxer.checks.load(Ordering::SeqCst), 1);
    assert_eq!(
        harness.target_entries(),
        vec!["album (1 of 3).mp4", "album (2 of 3).mp4", "album (3 of 3).mp4"]
    );
    let view = harness.engine.task(&id).unwrap();
    for (index, output) in view.outputs.iter().enumerate() {
        let mut expected = vec![b'a' + index as u8; 30];
        expected.extend(vec![b'A' + index as u8; 10]);
        assert_eq!(std::fs::read(output).unwrap(), expected);
    }
}

#[test]
fn test_failed_merge_leaves_nothing_behind() {
    let harness = Harness::with(test_config(), ConcatMuxer::failing_on(1));
    let url = "https://media.example/album/4";
    let descriptors = album(&harness, url, 3);
    harness.resolver.answer(url, descriptors);
    let id = harness.engine.submit(harness.request(url)).unwrap();
    assert_eq!(
        harness.engine.wait_for(&id, WAIT).unwrap(),
        Some(TaskState::Failed)
    );
    assert_eq!(failure_kind(&harness, &id), Some(ErrorKind::MergeFailed));
    let detail = harness.engine.task(&id).unwrap().failure.unwrap().detail;
    assert!(detail.contains("item 2"), "{}", detail);
    assert_eq!(harness.muxer.merges.load(Ordering::SeqCst), 2);
    assert!(harness.target_entries().is_empty());
}

#[test]
fn test_cancel_while_merging() {
    let gate = Arc::new(Gate::default());
    let harness = Harness::with(test_config(), ConcatMuxer::gated(gate.clone()));
    harness.post(
        "https://media.example/g/1",
        "clip",
        Resource::sized(64, 0),
        Resource::sized(16, 1),
    );
    let id = harness
        .engine
        .submit(harness.request("https://media.example/g/1"))
        .unwrap();
    assert!(wait_until(WAIT, || {
        harness.engine.task(&id).unwrap().state == TaskState::Merging
    }));

    assert!(harness.engine.cancel(&id));
    assert_eq!(
        harness.engine.wait_for(&id, WAIT).unwrap(),
        Some(TaskState::Cancelled)
    );
    assert_eq!(harness.muxer.merges.load(Ordering::SeqCst), 0);
    assert!(harness.target_entries().is_empty());
    gate.open();
}

#[test]
fn test_cancel_while_resolving() {
    let harness = Harness::new(1);
    let gate = Arc::new(Gate::default());
    harness.resolver.hold(gate.clone());
    harness.post(
        "https://media.example/h/0",
        "clip",
        Resource::sized(64, 0),
        Resource::sized(16, 1),
    );
    let id = harness
        .engine
        .submit(harness.request("https://media.example/h/0"))
        .unwrap();
    assert!(wait_until(WAIT, || {
        harness.resolver.calls_for("https://media.example/h/0") == 1
    }));
    assert_eq!(harness.engine.task(&id).unwrap().state, TaskState::Resolving);

    assert!(harness.engine.cancel(&id));
    gate.open();
    assert_eq!(
        harness.engine.wait_for(&id, WAIT).unwrap(),
        Some(TaskState::Cancelled)
    );
    assert_eq!(harness.net.opens("https://media.example/h/0/video"), 0);
    assert_eq!(harness.net.opens("https://media.example/h/0/audio"), 0);
    assert!(harness.target_entries().is_empty());
}

const MASTER_PLAYLIST: &str = "#EXTM3U
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2400000,RESOLUTION=1280x720
high/index.m3u8
";

const MEDIA_PLAYLIST: &str = "#EXTM3U
#EXT-X-VERSION:3
#EXT-X-TARGETDURATION:4
#EXT-X-MEDIA-SEQUENCE:0
#EXTINF:4.0,
seg0.ts
#EXTINF:4.0,
seg1.ts
#EXTINF:4.0,
seg2.ts
#EXT-X-ENDLIST
";

/// Serves a master playlist whose best variant has three segments.
fn hls_post(harness: &Harness, url: &str) -> String {
    let master = format!("{}/master.m3u8", url);
    harness
        .net
        .serve(&master, Resource::new(MASTER_PLAYLIST.as_bytes().to_vec()));
    harness.net.serve(
        &format!("{}/high/index.m3u8", url),
        Resource::new(MEDIA_PLAYLIST.as_bytes().to_vec()),
    );
    for index in 0..3u8 {
        harness.net.serve(
            &format!("{}/high/seg{}.ts", url, index),
            Resource::sized(40, b'0' + index).slow(16, Duration::ZERO),
        );
    }
    harness.resolver.answer(
        url,
        vec![MediaDescriptor::new("stream")
            .with_variant(StreamVariant::new(StreamKind::Muxed, master).with_height(720))],
    );
    format!("{}/high/index.m3u8", url)
}

#[test]
fn test_hls_stream_is_joined_in_segment_order() {
    let harness = Harness::new(1);
    let url = "https://media.example/live/1";
    hls_post(&harness, url);
    let id = harness.engine.submit(harness.request(url)).unwrap();
    assert_eq!(
        harness.engine.wait_for(&id, WAIT).unwrap(),
        Some(TaskState::Completed)
    );
    let mut expected = vec![b'0'; 40];
    expected.extend(vec![b'1'; 40]);
    expected.extend(vec![b'2'; 40]);
    let output = harness.target.path().join("stream.mp4");
    assert_eq!(std::fs::read(&output).unwrap(), expected);
    assert_eq!(harness.net.opens(&format!("{}/low/index.m3u8", url)), 0);
    assert_eq!(harness.engine.snapshot(&id).unwrap().bytes_received, 120);
}

#[test]
fn test_missing_hls_segment_is_not_retried() {
    let harness = Harness::new(1);
    let url = "https://media.example/live/2";
    let playlist = hls_post(&harness, url);
    harness.net.serve(
        &format!("{}/high/seg1.ts", url),
        Resource::sized(40, 0).status(404),
    );
    let id = harness.engine.submit(harness.request(url)).unwrap();
    assert_eq!(
        harness.engine.wait_for(&id, WAIT).unwrap(),
        Some(TaskState::Failed)
    );
    assert_eq!(failure_kind(&harness, &id), Some(ErrorKind::StreamFetchError));
    let detail = harness.engine.task(&id).unwrap().failure.unwrap().detail;
    assert!(detail.contains("media not found"), "{}", detail);
    assert_eq!(harness.net.opens(&playlist), 1);
    assert_eq!(harness.net.opens(&format!("{}/high/seg2.ts", url)), 0);
    assert!(harness.target_entries().is_empty());
}
