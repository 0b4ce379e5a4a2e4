use std::{sync::Arc, time::Duration};

use iori_dash::{
    ChannelSink, DashConfig, DashError, DashPlayer, FixedSelector, PlayerEvent,
    RepresentationSelector, SinkData, StreamType,
};
use tokio::sync::mpsc::UnboundedReceiver;
use url::Url;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::common::{
    collect, drain_events, init_tracing, live_mpd, next_chunk, segment_number, serve_manifest, serve_segments,
    wait_for_event,
};

const IDLE: Duration = Duration::from_millis(500);
const READY: Duration = Duration::from_secs(5);

fn av_mpd() -> String {
    r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT20S" minBufferTime="PT2S">
  <Period id="p0">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate media="$RepresentationID$-$Number$.m4s" initialization="$RepresentationID$-init.mp4" duration="4" startNumber="0"/>
      <Representation id="v480" bandwidth="800000" width="854" height="480"/>
      <Representation id="v1080" bandwidth="5000000" width="1920" height="1080"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="ja">
      <SegmentTemplate media="$RepresentationID$-$Number$.m4s" initialization="$RepresentationID$-init.mp4" duration="4" startNumber="0"/>
      <Representation id="ja" bandwidth="96000"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4" lang="en">
      <SegmentTemplate media="$RepresentationID$-$Number$.m4s" initialization="$RepresentationID$-init.mp4" duration="4" startNumber="0"/>
      <Representation id="en" bandwidth="128000"/>
    </AdaptationSet>
  </Period>
</MPD>"#
        .to_string()
}

struct TestPlayer {
    player: DashPlayer,
    events: iori_dash::EventReceiver,
    audio: UnboundedReceiver<SinkData>,
    video: UnboundedReceiver<SinkData>,
}

fn player(url: Url, config: DashConfig) -> TestPlayer {
    init_tracing();
    let (audio_sink, audio) = ChannelSink::new();
    let (video_sink, video) = ChannelSink::new();
    let (player, events) = DashPlayer::builder(url)
        .config(config)
        .build(Arc::new(audio_sink), Arc::new(video_sink));
    TestPlayer {
        player,
        events,
        audio,
        video,
    }
}

fn deep_buffer() -> DashConfig {
    DashConfig::default()
        .with_time_buffer_depth(Duration::from_secs(100))
        .with_manifest_retries(1, Duration::from_millis(10))
}

#[tokio::test]
async fn plays_static_presentation_to_the_end() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    serve_segments(&server, Duration::ZERO).await;
    let url = serve_manifest(&server, av_mpd()).await;

    let mut test = player(url, deep_buffer());
    test.player.start();
    let ready = wait_for_event(&mut test.events, READY, |e| *e == PlayerEvent::PlayReady).await;
    assert!(ready.is_some());
    assert!(test.player.is_seeking_supported());

    let (video, video_eos) = collect(&mut test.video, IDLE).await;
    let (audio, audio_eos) = collect(&mut test.audio, IDLE).await;
    assert!(video_eos && audio_eos);
    // lowest bitrate first, English audio by default
    assert_eq!(video.first().map(String::as_str), Some("/v480-init.mp4"));
    let numbers: Vec<u64> = video.iter().filter_map(|c| segment_number(c)).collect();
    assert_eq!(numbers, [0, 1, 2, 3, 4]);
    assert_eq!(audio.first().map(String::as_str), Some("/en-init.mp4"));
    assert_eq!(audio.len(), 6);

    let events = drain_events(&mut test.events);
    assert!(events.contains(&PlayerEvent::ClipDurationChanged(Duration::from_secs(20))));
    assert!(events.contains(&PlayerEvent::EndOfStream(StreamType::Audio)));
    assert!(!events.iter().any(|e| matches!(e, PlayerEvent::StreamError(_))));

    test.player.stop().await;
    Ok(())
}

#[tokio::test]
async fn streams_start_together_at_later_first_segment() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    serve_segments(&server, Duration::ZERO).await;
    let mpd = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" type="static" mediaPresentationDuration="PT20S" minBufferTime="PT2S">
  <Period id="p0" start="PT0S">
    <AdaptationSet contentType="video" mimeType="video/mp4">
      <SegmentTemplate media="$RepresentationID$-$Time$.m4s" timescale="1000">
        <SegmentTimeline>
          <S t="0" d="4000" r="4"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="v" bandwidth="800000"/>
    </AdaptationSet>
    <AdaptationSet contentType="audio" mimeType="audio/mp4">
      <SegmentTemplate media="$RepresentationID$-$Time$.m4s" timescale="1000">
        <SegmentTimeline>
          <S t="8000" d="4000" r="2"/>
        </SegmentTimeline>
      </SegmentTemplate>
      <Representation id="a" bandwidth="128000"/>
    </AdaptationSet>
  </Period>
</MPD>"#;
    let url = serve_manifest(&server, mpd.to_string()).await;

    let mut test = player(url, deep_buffer());
    test.player.start();
    wait_for_event(&mut test.events, READY, |e| *e == PlayerEvent::PlayReady).await;

    let (video, video_eos) = collect(&mut test.video, IDLE).await;
    let (audio, audio_eos) = collect(&mut test.audio, IDLE).await;
    assert!(video_eos && audio_eos);
    // audio has nothing before 8 s, so video skips its first two segments
    assert_eq!(video, ["/v-8000.m4s", "/v-12000.m4s", "/v-16000.m4s"]);
    assert_eq!(audio, ["/a-8000.m4s", "/a-12000.m4s", "/a-16000.m4s"]);

    test.player.stop().await;
    Ok(())
}

#[tokio::test]
async fn lists_and_pins_streams() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    serve_segments(&server, Duration::from_millis(100)).await;
    let url = serve_manifest(&server, av_mpd()).await;

    let config = DashConfig::default().with_time_buffer_depth(Duration::from_secs(100));
    let mut test = player(url, config);
    test.player.start();
    wait_for_event(&mut test.events, READY, |e| *e == PlayerEvent::PlayReady).await;

    let groups = test.player.get_stream_groups();
    let video = groups
        .iter()
        .find(|g| g.stream_type == StreamType::Video)
        .unwrap();
    let ids: Vec<_> = video.streams.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["v1080", "v480"]);

    // pin the lowest bitrate, away from what throughput would pick
    let pin: Arc<dyn RepresentationSelector> = Arc::new(FixedSelector(1));
    test.player
        .set_stream_groups(std::slice::from_ref(video), vec![pin])
        .await?;

    let (chunks, eos) = collect(&mut test.video, IDLE).await;
    assert!(eos);
    assert_eq!(chunks.last().map(String::as_str), Some("/v480-4.m4s"));

    // no segment repeated or skipped backwards across the change
    let numbers: Vec<u64> = chunks.iter().filter_map(|c| segment_number(c)).collect();
    assert!(numbers.windows(2).all(|pair| pair[0] < pair[1]), "{chunks:?}");

    let groups = test.player.get_stream_groups();
    let video = groups
        .iter()
        .find(|g| g.stream_type == StreamType::Video)
        .unwrap();
    assert_eq!(video.selected, Some(1));

    test.player.stop().await;
    Ok(())
}

#[tokio::test]
async fn seek_resolves_to_segment_start() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    serve_segments(&server, Duration::ZERO).await;
    let url = serve_manifest(&server, av_mpd()).await;

    let config = DashConfig::default().with_time_buffer_depth(Duration::from_secs(4));
    let mut test = player(url, config);
    test.player.start();
    wait_for_event(&mut test.events, READY, |e| *e == PlayerEvent::PlayReady).await;
    collect(&mut test.video, IDLE).await;
    collect(&mut test.audio, IDLE).await;

    let resolved = test.player.seek(Duration::from_secs(10)).await?;
    assert_eq!(resolved, Duration::from_secs(8));

    let (video, _) = collect(&mut test.video, IDLE).await;
    let (audio, _) = collect(&mut test.audio, IDLE).await;
    // cached init replayed, then the segment covering 8 s
    assert!(video.first().is_some_and(|c| c.ends_with("-init.mp4")));
    assert_eq!(video.get(1).and_then(|c| segment_number(c)), Some(2));
    assert_eq!(audio.first().map(String::as_str), Some("/en-init.mp4"));
    assert_eq!(audio.get(1).map(String::as_str), Some("/en-2.m4s"));

    let result = test.player.seek(Duration::from_secs(60)).await;
    assert!(matches!(result, Err(DashError::SeekUnresolved(_))));

    test.player.stop().await;
    Ok(())
}

#[tokio::test]
async fn unavailable_static_manifest_is_fatal() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/manifest.mpd"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let url: Url = format!("{}/manifest.mpd", server.uri()).parse()?;

    let mut test = player(url, deep_buffer());
    test.player.start();
    let error = wait_for_event(&mut test.events, READY, |e| {
        matches!(e, PlayerEvent::StreamError(_))
    })
    .await;
    assert!(error.is_some());
    assert!(test.player.get_stream_groups().is_empty());

    test.player.stop().await;
    Ok(())
}

#[tokio::test]
async fn unchanged_live_reload_is_not_reapplied() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    serve_segments(&server, Duration::ZERO).await;
    let url = serve_manifest(&server, live_mpd("2024-01-01T00:00:00Z")).await;

    let mut test = player(url, DashConfig::default());
    test.player.start();
    wait_for_event(&mut test.events, READY, |e| *e == PlayerEvent::PlayReady).await;
    assert!(!test.player.is_seeking_supported());
    let applied = test.player.document().expect("document applied");

    // several reloads at the 200 ms update period
    tokio::time::sleep(Duration::from_millis(1000)).await;
    let current = test.player.document().expect("document applied");
    assert!(Arc::ptr_eq(&applied, &current));
    let manifest_requests = server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == "/manifest.mpd")
        .count();
    assert!(manifest_requests >= 3);

    let ready = drain_events(&mut test.events)
        .into_iter()
        .filter(|event| *event == PlayerEvent::PlayReady)
        .count();
    assert_eq!(ready, 0);

    let (video, eos) = collect(&mut test.video, Duration::from_millis(200)).await;
    assert!(!eos);
    assert!(video.iter().all(|c| c.starts_with("/v-")));
    assert!(!video.is_empty());
    // one continuous run: no restart from the live start point
    let numbers: Vec<u64> = video.iter().filter_map(|c| segment_number(c)).collect();
    assert!(numbers.windows(2).all(|pair| pair[1] == pair[0] + 1));

    let result = test.player.seek(Duration::from_secs(10)).await;
    assert!(matches!(result, Err(DashError::SeekNotSupported)));

    test.player.stop().await;
    Ok(())
}

#[tokio::test]
async fn live_reload_failure_after_period_miss_is_retried() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    // the only period starts an hour past the live edge
    let mpd = live_mpd("2024-01-01T00:00:00Z").replace(r#"start="PT0S""#, r#"start="PT3600S""#);
    Mock::given(method("GET"))
        .and(path("/manifest.mpd"))
        .respond_with(ResponseTemplate::new(200).set_body_string(mpd))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/manifest.mpd"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let url: Url = format!("{}/manifest.mpd", server.uri()).parse()?;

    let mut test = player(
        url,
        DashConfig::default().with_manifest_retries(1, Duration::from_millis(10)),
    );
    test.player.start();
    tokio::time::sleep(Duration::from_millis(1000)).await;

    let manifest_requests = server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == "/manifest.mpd")
        .count();
    assert!(manifest_requests >= 3);

    let events = drain_events(&mut test.events);
    assert!(!events.iter().any(|e| matches!(e, PlayerEvent::StreamError(_))));
    assert!(!events.contains(&PlayerEvent::PlayReady));

    test.player.stop().await;
    Ok(())
}

fn av_mpd_with_subtitles() -> String {
    av_mpd().replace(
        "  </Period>",
        r#"    <AdaptationSet contentType="text" mimeType="text/vtt" lang="en">
      <Representation id="sub-en" bandwidth="256">
        <BaseURL>sub-en.vtt</BaseURL>
      </Representation>
    </AdaptationSet>
    <AdaptationSet mimeType="application/mp4" codecs="stpp" lang="ja">
      <SegmentTemplate media="$RepresentationID$-$Number$.m4s" duration="4" startNumber="0"/>
      <Representation id="sub-ja" bandwidth="512"/>
    </AdaptationSet>
  </Period>"#,
    )
}

#[tokio::test]
async fn lists_and_selects_subtitles() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    serve_segments(&server, Duration::ZERO).await;
    let url = serve_manifest(&server, av_mpd_with_subtitles()).await;

    let mut test = player(url, deep_buffer());
    test.player.start();
    wait_for_event(&mut test.events, READY, |e| *e == PlayerEvent::PlayReady).await;

    let groups = test.player.get_stream_groups();
    let subtitles = groups
        .iter()
        .find(|group| group.stream_type == StreamType::Subtitle)
        .cloned()
        .expect("subtitle group listed");
    let ids: Vec<_> = subtitles.streams.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, ["sub-en", "sub-ja"]);
    assert_eq!(subtitles.streams[1].lang.as_deref(), Some("ja"));
    assert_eq!(subtitles.selected, None);

    let selectors: Vec<Arc<dyn RepresentationSelector>> = vec![Arc::new(FixedSelector(1))];
    test.player
        .set_stream_groups(&[subtitles.clone()], selectors)
        .await?;
    let selected = test
        .player
        .get_stream_groups()
        .into_iter()
        .find(|group| group.stream_type == StreamType::Subtitle)
        .and_then(|group| group.selected);
    assert_eq!(selected, Some(1));

    // text is never downloaded
    let (video, video_eos) = collect(&mut test.video, IDLE).await;
    assert!(video_eos);
    assert!(video.iter().all(|c| !c.contains("sub-")));

    test.player.deactivate_stream(StreamType::Subtitle).await;
    assert!(!test
        .player
        .get_stream_groups()
        .iter()
        .any(|group| group.stream_type == StreamType::Subtitle));

    test.player.stop().await;
    Ok(())
}

#[tokio::test]
async fn deactivated_stream_stops_and_is_unlisted() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    serve_segments(&server, Duration::from_millis(50)).await;
    let url = serve_manifest(&server, av_mpd()).await;

    let mut test = player(url, deep_buffer());
    test.player.start();
    wait_for_event(&mut test.events, READY, |e| *e == PlayerEvent::PlayReady).await;
    let groups = test.player.get_stream_groups();

    test.player.deactivate_stream(StreamType::Audio).await;
    let listed: Vec<_> = test
        .player
        .get_stream_groups()
        .into_iter()
        .map(|group| group.stream_type)
        .collect();
    assert_eq!(listed, [StreamType::Video]);

    let (video, video_eos) = collect(&mut test.video, IDLE).await;
    assert!(video_eos);
    assert_eq!(video.iter().filter_map(|c| segment_number(c)).count(), 5);

    // whatever audio got out is terminated, and nothing follows
    let (audio, audio_eos) = collect(&mut test.audio, IDLE).await;
    assert_eq!(audio_eos, !audio.is_empty());
    assert!(next_chunk(&mut test.audio, IDLE).await.is_none());

    let audio_group: Vec<_> = groups
        .into_iter()
        .filter(|group| group.stream_type == StreamType::Audio)
        .collect();
    let selectors: Vec<Arc<dyn RepresentationSelector>> = vec![Arc::new(FixedSelector(0))];
    let result = test.player.set_stream_groups(&audio_group, selectors).await;
    assert!(matches!(
        result,
        Err(DashError::StreamDeactivated(StreamType::Audio))
    ));

    let events = drain_events(&mut test.events);
    assert!(!events.iter().any(|e| matches!(e, PlayerEvent::StreamError(_))));

    test.player.stop().await;
    Ok(())
}
