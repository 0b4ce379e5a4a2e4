use std::time::Duration;

use iori_dash::{ClientStatus, DashConfig, PlayerEvent};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use crate::common::{
    collect, drain_events, live_mpd, parse, representation, serve_segments, static_mpd,
    test_client,
};

const IDLE: Duration = Duration::from_millis(500);

fn stream_errors(events: &[PlayerEvent]) -> usize {
    events
        .iter()
        .filter(|event| matches!(event, PlayerEvent::StreamError(_)))
        .count()
}

#[tokio::test]
async fn persistent_server_error_stops_static_client() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v-0.m4s"))
        .respond_with(ResponseTemplate::new(500))
        .expect(3)
        .mount(&server)
        .await;
    let url = format!("{}/manifest.mpd", server.uri()).parse()?;
    let document = parse(&static_mpd(10, false, &[("v", 1_000_000)]), &url);

    let config = DashConfig::default().with_backoff_unit(Duration::from_millis(1));
    let mut test = test_client(config);
    test.client.set_representation(representation(&document, "v"));
    test.client.start()?;

    let (chunks, eos) = collect(&mut test.sink, IDLE).await;
    assert!(chunks.is_empty());
    // nothing was written, so no end of stream either
    assert!(!eos);
    assert_eq!(test.client.status(), ClientStatus::Stopped);

    // later time updates do not restart the loop
    test.client.on_time_updated(Duration::from_secs(1));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let events = drain_events(&mut test.events);
    assert_eq!(stream_errors(&events), 1);
    Ok(())
}

#[tokio::test]
async fn client_error_is_not_retried() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v-0.m4s"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;
    let url = format!("{}/manifest.mpd", server.uri()).parse()?;
    let document = parse(&static_mpd(10, false, &[("v", 1_000_000)]), &url);

    let mut test = test_client(DashConfig::default());
    test.client.set_representation(representation(&document, "v"));
    test.client.start()?;

    collect(&mut test.sink, IDLE).await;
    assert_eq!(test.client.status(), ClientStatus::Stopped);
    assert_eq!(stream_errors(&drain_events(&mut test.events)), 1);
    Ok(())
}

#[tokio::test]
async fn failed_init_segment_is_fatal() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v-init.mp4"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    serve_segments(&server, Duration::ZERO).await;
    let url = format!("{}/manifest.mpd", server.uri()).parse()?;
    let document = parse(&static_mpd(10, true, &[("v", 1_000_000)]), &url);

    let mut test = test_client(DashConfig::default());
    test.client.set_representation(representation(&document, "v"));
    test.client.start()?;

    let (chunks, eos) = collect(&mut test.sink, IDLE).await;
    assert!(chunks.is_empty());
    assert!(!eos);
    assert_eq!(test.client.status(), ClientStatus::Stopped);
    assert_eq!(stream_errors(&drain_events(&mut test.events)), 1);
    Ok(())
}

#[tokio::test]
async fn live_segment_not_found_is_skipped() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v-27.m4s"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    serve_segments(&server, Duration::ZERO).await;
    let url = format!("{}/manifest.mpd", server.uri()).parse()?;
    let document = parse(&live_mpd("2024-01-01T00:00:00Z"), &url);

    let mut test = test_client(DashConfig::default());
    test.client.set_representation(representation(&document, "v"));
    test.client.start()?;

    // The live start point is segment 27, six seconds behind the edge.
    let (chunks, _) = collect(&mut test.sink, Duration::from_millis(200)).await;
    assert!(chunks.is_empty());
    assert_eq!(test.client.status(), ClientStatus::Running);

    test.client.on_time_updated(Duration::ZERO);
    let (chunks, eos) = collect(&mut test.sink, IDLE).await;
    assert_eq!(chunks, ["/v-28.m4s", "/v-29.m4s"]);
    assert!(!eos);
    assert_eq!(stream_errors(&drain_events(&mut test.events)), 0);
    Ok(())
}
