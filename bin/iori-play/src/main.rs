use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use fake_user_agent::get_chrome_rua;
use iori_dash::{
    ChannelSink, DashConfig, DashPlayer, FixedSelector, HttpClient, PlayerEvent,
    RepresentationSelector, SinkData, StreamGroup, StreamType,
};
use tokio::{
    fs::File,
    io::AsyncWriteExt,
    sync::mpsc::UnboundedReceiver,
    task::JoinHandle,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
struct PlayArgs {
    /// Debug output
    #[clap(long, alias = "debug")]
    verbose: bool,

    /// List available streams and exit
    #[clap(long)]
    list: bool,

    /// Print the stream list as JSON
    #[clap(long, requires = "list")]
    json: bool,

    /// Directory receiving video.mp4 and audio.mp4
    #[clap(short, long, default_value = ".")]
    output: PathBuf,

    /// Pin the video stream at this index of the stream list
    #[clap(long)]
    video_stream: Option<usize>,

    /// Pin the audio stream at this index of the stream list
    #[clap(long)]
    audio_stream: Option<usize>,

    /// Skip the audio stream
    #[clap(long, conflicts_with = "no_video")]
    no_audio: bool,

    /// Skip the video stream
    #[clap(long)]
    no_video: bool,

    /// Adapt audio bitrate to throughput as well
    #[clap(long)]
    adaptive_audio: bool,

    /// Fixed buffer depth in seconds instead of the one derived from the manifest
    #[clap(long)]
    buffer: Option<f64>,

    /// Stop after playing this many seconds
    #[clap(long)]
    duration: Option<f64>,

    /// Playback speed of the simulated clock
    #[clap(long, default_value = "1.0")]
    speed: f64,

    /// Start position in seconds
    #[clap(long)]
    seek: Option<f64>,

    /// Cookies used to download
    #[clap(long)]
    cookies: Option<String>,

    /// HTTP Header used to download
    ///
    /// Custom header. eg. "User-Agent: xxxxx".
    #[clap(short = 'H', long)]
    headers: Vec<String>,

    /// MPD url
    url: url::Url,
}

impl PlayArgs {
    fn client(&self) -> anyhow::Result<HttpClient> {
        let mut headers = vec![("user-agent".to_string(), get_chrome_rua().to_string())];
        for header in &self.headers {
            let (key, value) = header
                .split_once(':')
                .with_context(|| format!("Invalid header: {header}"))?;
            headers.push((key.trim().to_string(), value.trim().to_string()));
        }

        let client = HttpClient::with_headers(headers, Duration::from_secs(10))?;
        if let Some(cookies) = &self.cookies {
            let cookies = cookies.split(';').map(|c| c.trim().to_string()).collect();
            client.add_cookies(cookies, self.url.clone())?;
        }
        Ok(client)
    }

    fn config(&self) -> DashConfig {
        let config = DashConfig::default().with_adaptive_audio(self.adaptive_audio);
        match self.buffer {
            Some(seconds) => config.with_time_buffer_depth(Duration::from_secs_f64(seconds)),
            None => config,
        }
    }
}

fn spawn_writer(mut receiver: UnboundedReceiver<SinkData>, path: PathBuf) -> JoinHandle<anyhow::Result<u64>> {
    tokio::spawn(async move {
        let mut file = File::create(&path).await?;
        let mut written = 0;
        while let Some(data) = receiver.recv().await {
            match data {
                SinkData::Data(bytes) => {
                    file.write_all(&bytes).await?;
                    written += bytes.len() as u64;
                }
                SinkData::EndOfStream => break,
            }
        }
        file.flush().await?;
        Ok(written)
    })
}

fn print_groups(groups: &[StreamGroup]) {
    for group in groups {
        println!("{}:", group.stream_type);
        for stream in &group.streams {
            let selected = if group.selected == Some(stream.index) { "*" } else { " " };
            let resolution = match (stream.width, stream.height) {
                (Some(width), Some(height)) => format!(" {width}x{height}"),
                _ => String::new(),
            };
            println!(
                "  {selected}[{}] {} {} bps{resolution} {} {}",
                stream.index,
                stream.id,
                stream.bandwidth,
                stream.codecs.as_deref().unwrap_or("-"),
                stream.lang.as_deref().unwrap_or(""),
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = PlayArgs::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(format!("iori_dash={default_level},iori_play={default_level}"))),
        )
        .init();

    if args.speed <= 0.0 {
        bail!("Playback speed must be positive");
    }

    let (audio_sink, audio_data) = ChannelSink::new();
    let (video_sink, video_data) = ChannelSink::new();
    let (player, mut events) = DashPlayer::builder(args.url.clone())
        .config(args.config())
        .http_client(args.client()?)
        .build(Arc::new(audio_sink), Arc::new(video_sink));

    player.start();
    loop {
        match events.recv().await {
            Some(PlayerEvent::PlayReady) => break,
            Some(PlayerEvent::StreamError(error)) => bail!("Failed to load manifest: {error}"),
            Some(_) => {}
            None => bail!("Player stopped before becoming ready"),
        }
    }

    let groups = player.get_stream_groups();
    if args.list {
        if args.json {
            println!("{}", serde_json::to_string_pretty(&groups)?);
        } else {
            print_groups(&groups);
        }
        player.stop().await;
        return Ok(());
    }

    if args.no_audio {
        player.deactivate_stream(StreamType::Audio).await;
    }
    if args.no_video {
        player.deactivate_stream(StreamType::Video).await;
    }
    let groups = player.get_stream_groups();

    let mut pinned = Vec::new();
    let mut selectors: Vec<Arc<dyn RepresentationSelector>> = Vec::new();
    for group in &groups {
        let index = match group.stream_type {
            StreamType::Video => args.video_stream,
            StreamType::Audio => args.audio_stream,
            StreamType::Subtitle => None,
        };
        if let Some(index) = index {
            pinned.push(group.clone());
            selectors.push(Arc::new(FixedSelector(index)));
        }
    }
    player.set_stream_groups(&pinned, selectors).await?;

    tokio::fs::create_dir_all(&args.output).await?;
    let audio_writer = spawn_writer(audio_data, args.output.join("audio.mp4"));
    let video_writer = spawn_writer(video_data, args.output.join("video.mp4"));

    let mut position = Duration::ZERO;
    if let Some(seek) = args.seek {
        position = player.seek(Duration::from_secs_f64(seek)).await?;
        tracing::info!(?position, "Playback starts");
    }
    let limit = args.duration.map(Duration::from_secs_f64).map(|d| position + d);

    let active = groups
        .iter()
        .filter(|group| group.stream_type != StreamType::Subtitle)
        .count();
    let mut ended = 0;
    let mut buffering = 0usize;
    let tick = Duration::from_millis(250);
    let mut interval = tokio::time::interval(tick);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            event = events.recv() => match event {
                Some(PlayerEvent::BufferingStarted(stream)) => {
                    tracing::debug!(%stream, "Buffering");
                    buffering += 1;
                }
                Some(PlayerEvent::BufferingCompleted(_)) => buffering = buffering.saturating_sub(1),
                Some(PlayerEvent::EndOfStream(stream)) => {
                    tracing::info!(%stream, "Stream finished");
                    ended += 1;
                    if ended >= active {
                        break;
                    }
                }
                Some(PlayerEvent::StreamError(error)) => {
                    player.stop().await;
                    bail!("Playback failed: {error}");
                }
                Some(PlayerEvent::ClipDurationChanged(duration)) => tracing::info!(?duration, "Clip duration"),
                Some(PlayerEvent::PlayReady) => {}
                None => break,
            },
            _ = interval.tick() => {
                if buffering == 0 {
                    position += tick.mul_f64(args.speed);
                    player.on_time_updated(position);
                }
                if limit.is_some_and(|limit| position >= limit) {
                    break;
                }
            }
        }
    }

    player.stop().await;
    // releases the sinks so writers without end of stream finish too
    drop(player);
    let audio = audio_writer.await??;
    let video = video_writer.await??;
    tracing::info!(audio, video, output = %args.output.display(), "Done");

    Ok(())
}
