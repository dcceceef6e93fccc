use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use coursedl_engine::{
    ArticleSource, AuthCoordinator, CacheProvider, CachedMetadataSource, CourseCatalog,
    Credentials, EngineConfig, FileCache, ManifestSource, MemoryCache, MetadataSource,
    PasswordAuthenticator, RateGate, ResilientClient, Session, SessionStore, VideoPipeline,
    VideoReport, VideoTask, create_client,
};
use error::AppError;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::writer::MakeWriterExt;

mod cli;
mod error;
mod progress;
mod utils;

use cli::CliArgs;
use utils::parse_headers;

/// Upper bound of the in-memory cache used with `--memory-cache`.
const MEMORY_CACHE_BYTES: u64 = 64 * 1024 * 1024;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() {
    if let Err(e) = bootstrap() {
        eprintln!("Error: {e}");
        // Log the full error for debugging
        error!(error = ?e, "Application failed");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn bootstrap() -> Result<(), AppError> {
    let args = CliArgs::parse();

    // Setup logging
    let log_level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let log_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open("coursedl.log")?;

    let multi_writer = MakeWriterExt::and(std::io::stdout, log_file);

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(multi_writer)
        .with_ansi(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| AppError::Initialization(e.to_string()))?;

    info!("coursedl {}", env!("CARGO_PKG_VERSION"));

    let config = engine_config(&args)?;
    info!(
        "HTTP timeout configuration: overall={}s, connect={}s",
        args.timeout, args.connect_timeout
    );
    info!(
        "Rate limit: one request every {:?}, burst {}",
        config.rate.period, config.rate.burst
    );

    let credentials = match (&args.account, &args.password) {
        (Some(account), Some(password)) => Some(Credentials::new(account, password)),
        (None, None) => None,
        _ => {
            return Err(AppError::InvalidInput(
                "--account and --password must be given together".to_string(),
            ));
        }
    };
    if credentials.is_none() && args.cookie.is_none() {
        warn!("No credentials or cookie given, paid lectures will not be reachable");
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, stopping after in-flight writes");
                cancel.cancel();
            }
        });
    }

    let raw_client = create_client(&config.http)?;
    let session = args
        .cookie
        .as_deref()
        .map(Session::from_cookie_header)
        .unwrap_or_default();
    let authenticator = Arc::new(PasswordAuthenticator::new(
        raw_client.clone(),
        args.login_url.clone(),
    ));
    let auth = Arc::new(
        AuthCoordinator::new(authenticator, SessionStore::new(session))
            .with_settle_delay(config.throttle.settle_after_login),
    );

    let gate = Arc::new(RateGate::new(&config.rate));
    let mut http =
        ResilientClient::new(raw_client, gate, auth, &config).with_cancellation(cancel.clone());
    if let Some(credentials) = credentials.clone() {
        http = http.with_credentials(credentials);
    }
    let http = Arc::new(http);

    if credentials.is_some() && args.cookie.is_none() {
        http.login().await?;
    }

    let cache: Arc<dyn CacheProvider> = if args.memory_cache {
        Arc::new(MemoryCache::new(MEMORY_CACHE_BYTES, Duration::ZERO)?)
    } else {
        Arc::new(FileCache::new(&args.cache_dir))
    };

    let (metadata, tasks, mut reports) = match &args.manifest {
        Some(path) => {
            let manifest = ManifestSource::from_file(path).await?;
            info!("Loaded {} lectures from {}", manifest.len(), path.display());
            let tasks: Vec<VideoTask> = manifest
                .videos()
                .map(|video| VideoTask::new(&video.id, &video.title))
                .collect();
            let source: Arc<dyn MetadataSource> =
                Arc::new(CachedMetadataSource::new(manifest, Arc::clone(&cache)));
            (source, tasks, Vec::new())
        }
        None => {
            let api_base = args.api_base.trim_end_matches('/');
            let source = Arc::new(CachedMetadataSource::new(
                ArticleSource::new(Arc::clone(&http), format!("{api_base}/serv/v1/article")),
                Arc::clone(&cache),
            ));
            let (tasks, failures) = match args.course {
                Some(course_id) => {
                    let catalog = CourseCatalog::new(
                        Arc::clone(&http),
                        format!("{api_base}/serv/v1/column/articles"),
                        Arc::clone(&cache),
                    );
                    let listing = catalog.lectures(course_id).await?;
                    if !listing.is_complete() {
                        warn!(
                            "Course {} lists {} of {} lectures, run again later for the rest",
                            course_id,
                            listing.tasks.len(),
                            listing.expected
                        );
                    }
                    (listing.tasks, Vec::new())
                }
                None => resolve_tasks(source.as_ref(), &args.ids).await,
            };
            (source as Arc<dyn MetadataSource>, tasks, failures)
        }
    };

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let reporter = progress::spawn_reporter(events_rx);

    let pipeline =
        VideoPipeline::new(http, metadata, cache, &config).with_progress(Arc::new(events_tx));
    info!("Downloading {} lectures", tasks.len());
    reports.extend(pipeline.download_all(tasks).await);

    // Closes the event channel so the reporter drains and exits.
    drop(pipeline);
    if let Err(e) = reporter.await {
        warn!("Progress reporter stopped: {}", e);
    }

    summarize(&reports)
}

fn engine_config(args: &CliArgs) -> Result<EngineConfig, AppError> {
    if !args.rate_period.is_finite() || args.rate_period <= 0.0 {
        return Err(AppError::InvalidInput(format!(
            "rate period must be a positive number of seconds, got {}",
            args.rate_period
        )));
    }
    if args.rate_burst == 0 {
        return Err(AppError::InvalidInput("rate burst must be at least 1".to_string()));
    }

    let mut config = EngineConfig::builder()
        .with_timeout(Duration::from_secs(args.timeout))
        .with_connect_timeout(Duration::from_secs(args.connect_timeout))
        .with_rate(Duration::from_secs_f64(args.rate_period), args.rate_burst)
        .with_segment_concurrency(args.concurrency)
        .with_video_concurrency(args.parallel_videos)
        .with_video_retry(args.retries, Duration::from_millis(500))
        .with_output_dir(&args.output_dir)
        .build();
    config.http.headers.extend(parse_headers(&args.headers)?);
    Ok(config)
}

/// Looks up titles for bare ids; lookups that fail become failed reports.
async fn resolve_tasks(
    source: &dyn MetadataSource,
    ids: &[String],
) -> (Vec<VideoTask>, Vec<VideoReport>) {
    let mut tasks = Vec::with_capacity(ids.len());
    let mut failures = Vec::new();
    for id in ids {
        match source.fetch_video_metadata(id).await {
            Ok(meta) => tasks.push(VideoTask::new(meta.id, meta.title)),
            Err(e) => {
                warn!(video_id = %id, "Lecture lookup failed: {}", e);
                failures.push(VideoReport {
                    id: id.clone(),
                    title: id.clone(),
                    attempts: 0,
                    outcome: Err(e),
                });
            }
        }
    }
    (tasks, failures)
}

fn summarize(reports: &[VideoReport]) -> Result<(), AppError> {
    let mut failed = 0;
    for report in reports {
        match &report.outcome {
            Ok(video) => info!("[ok]     {} ({})", report.title, video.path.display()),
            Err(e) => {
                failed += 1;
                info!("[failed] {}: {}", report.title, e);
            }
        }
    }
    info!(
        "Done: {} succeeded, {} failed",
        reports.len() - failed,
        failed
    );

    if failed > 0 {
        return Err(AppError::BatchFailed {
            failed,
            total: reports.len(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use coursedl_engine::{AssembledVideo, FetchError};

    fn args(extra: &[&str]) -> CliArgs {
        let mut argv = vec!["coursedl", "101"];
        argv.extend_from_slice(extra);
        CliArgs::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_engine_config_from_flags() {
        let config = engine_config(&args(&[
            "--rate-period",
            "0.5",
            "--rate-burst",
            "3",
            "-c",
            "8",
            "-H",
            "Origin: https://time.geekbang.org",
        ]))
        .unwrap();
        assert_eq!(config.rate.period, Duration::from_millis(500));
        assert_eq!(config.rate.burst, 3);
        assert_eq!(config.segments.download_concurrency, 8);
        assert_eq!(config.http.headers["origin"], "https://time.geekbang.org");
        // Defaults survive the extra header.
        assert!(config.http.headers.contains_key("accept-language"));
    }

    #[test]
    fn test_engine_config_rejects_malformed_header() {
        assert!(matches!(
            engine_config(&args(&["-H", "Origin https://time.geekbang.org"])),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_engine_config_rejects_bad_rate() {
        assert!(matches!(
            engine_config(&args(&["--rate-period", "0"])),
            Err(AppError::InvalidInput(_))
        ));
        assert!(matches!(
            engine_config(&args(&["--rate-burst", "0"])),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_summary_fails_when_any_lecture_failed() {
        let ok = VideoReport {
            id: "1".into(),
            title: "01".into(),
            attempts: 1,
            outcome: Ok(AssembledVideo {
                path: "videos/01.ts".into(),
                size: 10,
            }),
        };
        assert!(summarize(std::slice::from_ref(&ok)).is_ok());

        let failed = VideoReport {
            id: "2".into(),
            title: "02".into(),
            attempts: 3,
            outcome: Err(FetchError::Playlist("no segments".into())),
        };
        assert!(matches!(
            summarize(&[ok, failed]),
            Err(AppError::BatchFailed { failed: 1, total: 2 })
        ));
    }
}
