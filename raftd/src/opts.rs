use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(about = "Raft consensus node")]
pub struct Opts {
    /// YAML configuration file
    #[clap(short = 'c', long = "config", env = "RAFTD_CONFIG")]
    pub config: PathBuf,

    /// Worker threads; overrides `concurrency.threads`
    #[clap(short = 't', long = "threads", value_parser = parse_threads)]
    pub threads: Option<usize>,

    /// Log filter; overrides `logging.level`, overridden by `RUST_LOG`
    #[clap(short = 'l', long = "level")]
    pub level: Option<String>,
}

impl Opts {
    pub fn from_args() -> Self {
        Opts::parse()
    }
}

fn parse_threads(s: &str) -> std::result::Result<usize, String> {
    match s.trim().parse::<usize>() {
        Ok(0) => Err("must be at least 1".into()),
        Ok(n) => Ok(n),
        Err(e) => Err(e.to_string()),
    }
}

#[test]
fn parse_threads_test() {
    assert_eq!(parse_threads("1"), Ok(1));
    assert_eq!(parse_threads(" 16 "), Ok(16));
    assert!(parse_threads("0").is_err());
    assert!(parse_threads("-1").is_err());
    assert!(parse_threads("many").is_err());
}

#[test]
fn opts_parse_test() {
    let opts = Opts::try_parse_from(["raftd", "-c", "/etc/raftd.yaml", "-t", "2"]).unwrap();
    assert_eq!(opts.config, PathBuf::from("/etc/raftd.yaml"));
    assert_eq!(opts.threads, Some(2));
    assert_eq!(opts.level, None);

    let opts =
        Opts::try_parse_from(["raftd", "--config", "x.yaml", "--level", "raftd=debug"]).unwrap();
    assert_eq!(opts.level.as_deref(), Some("raftd=debug"));
}
