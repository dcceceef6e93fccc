use clap::Parser;
use std::path::PathBuf;

/// Define CLI arguments
#[derive(Parser, Debug)]
#[command(
    version,
    about = "Download encrypted HLS course lectures",
    long_about = "Downloads paid course lectures as single .ts files.\n\
                  \n\
                  Lectures are given as a course id (every lecture, numbered in course order),\n\
                  as article ids looked up through the course API, or as a JSON manifest\n\
                  of {\"id\", \"title\", \"playlist_url\"} entries.\n\
                  Finished lectures and already downloaded segments are skipped, so an\n\
                  interrupted batch can simply be run again."
)]
pub struct CliArgs {
    /// Article ids of the lectures to download
    #[arg(
        required_unless_present_any = ["manifest", "course"],
        help = "Article ids to download (looked up through the course API)"
    )]
    pub ids: Vec<String>,

    /// JSON manifest listing the lectures to download
    #[arg(short, long, conflicts_with_all = ["ids", "course"])]
    pub manifest: Option<PathBuf>,

    /// Course id: download every lecture of the course, numbered in order
    #[arg(long, conflicts_with = "ids")]
    pub course: Option<u64>,

    /// Output directory for assembled lectures
    #[arg(short, long, default_value = "videos")]
    pub output_dir: PathBuf,

    /// Directory of the persistent metadata and key cache
    #[arg(long, default_value = "cache-data")]
    pub cache_dir: PathBuf,

    /// Keep metadata and keys in memory for this run only
    #[arg(long, conflicts_with = "cache_dir")]
    pub memory_cache: bool,

    /// Account used to log in, and to log in again after a throttle
    #[arg(long, env = "COURSEDL_ACCOUNT")]
    pub account: Option<String>,

    /// Password of the account
    #[arg(long, env = "COURSEDL_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    /// Raw Cookie header of an existing browser session
    #[arg(long, help = "Cookie header of a logged-in session, e.g. \"GCID=...; GCESS=...\"")]
    pub cookie: Option<String>,

    /// Course API base URL
    #[arg(long, default_value = "https://time.geekbang.org")]
    pub api_base: String,

    /// Account service login endpoint
    #[arg(long, default_value = "https://account.geekbang.org/account/ticket/login")]
    pub login_url: String,

    /// Segment downloads in flight per lecture
    #[arg(short = 'c', long, default_value = "5")]
    pub concurrency: usize,

    /// Lectures processed at the same time
    #[arg(long, default_value = "2")]
    pub parallel_videos: usize,

    /// Attempts per lecture for retryable failures
    #[arg(long, default_value = "3")]
    pub retries: u32,

    /// Seconds needed to earn one request token
    #[arg(long, default_value = "5")]
    pub rate_period: f64,

    /// Requests that may be sent back to back
    #[arg(long, default_value = "10")]
    pub rate_burst: u32,

    /// Overall HTTP request timeout in seconds
    #[arg(long, default_value = "300")]
    pub timeout: u64,

    /// HTTP connection timeout in seconds
    #[arg(long, default_value = "10")]
    pub connect_timeout: u64,

    /// Extra request headers
    #[arg(
        short = 'H',
        long = "header",
        help = "Add a request header (format: 'Name: Value'). Can be used multiple times"
    )]
    pub headers: Vec<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable detailed debug logging")]
    pub verbose: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_or_manifest_required() {
        assert!(CliArgs::try_parse_from(["coursedl"]).is_err());

        let args = CliArgs::try_parse_from(["coursedl", "101", "102"]).unwrap();
        assert_eq!(args.ids, vec!["101", "102"]);
        assert_eq!(args.concurrency, 5);

        let args = CliArgs::try_parse_from(["coursedl", "-m", "lectures.json"]).unwrap();
        assert_eq!(args.manifest, Some(PathBuf::from("lectures.json")));

        assert!(CliArgs::try_parse_from(["coursedl", "-m", "x.json", "101"]).is_err());
    }

    #[test]
    fn test_course_replaces_ids() {
        let args = CliArgs::try_parse_from(["coursedl", "--course", "100"]).unwrap();
        assert_eq!(args.course, Some(100));
        assert!(args.ids.is_empty());

        assert!(CliArgs::try_parse_from(["coursedl", "--course", "100", "101"]).is_err());
        assert!(CliArgs::try_parse_from(["coursedl", "--course", "x"]).is_err());
    }

    #[test]
    fn test_memory_cache_conflicts_with_cache_dir() {
        let args = CliArgs::try_parse_from(["coursedl", "1", "--memory-cache"]).unwrap();
        assert!(args.memory_cache);
        assert!(
            CliArgs::try_parse_from(["coursedl", "1", "--memory-cache", "--cache-dir", "c"])
                .is_err()
        );
    }

    #[test]
    fn test_repeated_headers() {
        let args = CliArgs::try_parse_from([
            "coursedl",
            "1",
            "-H",
            "Origin: https://time.geekbang.org",
            "--header",
            "Referer: https://time.geekbang.org/",
        ])
        .unwrap();
        assert_eq!(args.headers.len(), 2);
    }
}
