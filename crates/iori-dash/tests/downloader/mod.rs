use std::{sync::Arc, time::Duration};

use iori_dash::{
    download::{DownloadRequest, SegmentDownloader},
    manifest::SegmentDescriptor,
    ByteRange, DashError, HttpClient, StreamType, ThroughputHistory,
};
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn downloader() -> (SegmentDownloader, Arc<ThroughputHistory>) {
    let throughput = Arc::new(ThroughputHistory::new());
    let downloader = SegmentDownloader::new(HttpClient::default(), throughput.clone())
        .with_backoff_unit(Duration::from_millis(1));
    (downloader, throughput)
}

fn request(server: &MockServer, name: &str, range: Option<ByteRange>) -> DownloadRequest {
    let segment = SegmentDescriptor {
        id: Some(0),
        url: format!("{}/{name}", server.uri()).parse().unwrap(),
        byte_range: range,
        period: None,
        end_of_stream: false,
    };
    DownloadRequest::new(segment, StreamType::Video)
}

#[tokio::test]
async fn gives_up_after_three_attempts() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fail.m4s"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let (downloader, throughput) = downloader();
    let result = downloader
        .download(
            request(&server, "fail.m4s", None).ignore_error(true),
            &CancellationToken::new(),
        )
        .await;

    match result {
        Err(DashError::DownloadFailed { attempts, source, .. }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(*source, DashError::HttpError(status) if status.as_u16() == 503));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(throughput.is_empty());
    Ok(())
}

#[tokio::test]
async fn no_retry_without_ignore_error() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fail.m4s"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let (downloader, _) = downloader();
    let result = downloader
        .download(request(&server, "fail.m4s", None), &CancellationToken::new())
        .await;
    assert!(matches!(
        result,
        Err(DashError::DownloadFailed { attempts: 1, .. })
    ));
    Ok(())
}

#[tokio::test]
async fn recovers_from_transient_failure() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky.m4s"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky.m4s"))
        .respond_with(ResponseTemplate::new(200).set_body_string("payload"))
        .mount(&server)
        .await;

    let (downloader, throughput) = downloader();
    let response = downloader
        .download(
            request(&server, "flaky.m4s", None).ignore_error(true),
            &CancellationToken::new(),
        )
        .await?;
    assert_eq!(response.data.as_ref(), b"payload");
    assert_eq!(response.segment_id(), Some(0));
    assert_eq!(throughput.len(), 1);
    Ok(())
}

#[tokio::test]
async fn sends_range_header() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/media.mp4"))
        .and(header("range", "bytes=100-199"))
        .respond_with(ResponseTemplate::new(206).set_body_string("ranged"))
        .expect(1)
        .mount(&server)
        .await;

    let (downloader, _) = downloader();
    let response = downloader
        .download(
            request(&server, "media.mp4", Some(ByteRange::new(100, Some(100)))),
            &CancellationToken::new(),
        )
        .await?;
    assert_eq!(response.data.as_ref(), b"ranged");
    Ok(())
}

#[tokio::test]
async fn cancellation_is_not_a_failure() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.m4s"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let (downloader, throughput) = downloader();
    let token = CancellationToken::new();
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        downloader.download(request(&server, "slow.m4s", None).ignore_error(true), &token),
    )
    .await?;
    assert!(matches!(result, Err(DashError::Cancelled)));
    assert!(throughput.is_empty());
    Ok(())
}

#[tokio::test]
async fn deadline_bounds_whole_download() -> anyhow::Result<()> {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow.m4s"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;

    let (downloader, _) = downloader();
    let result = downloader
        .download(
            request(&server, "slow.m4s", None).with_deadline(Some(Duration::from_millis(100))),
            &CancellationToken::new(),
        )
        .await;
    match result {
        Err(error @ DashError::DownloadFailed { .. }) => {
            assert!(error.to_string().contains("slow.m4s"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}
