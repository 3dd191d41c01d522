//! Command-line interface definitions.

use std::path::PathBuf;

use clap::Parser;

/// Synchronise a directory with a peer over a serial byte link.
#[derive(Debug, Parser)]
#[command(name = "wiresync", version, about)]
pub struct Cli {
    /// Serial device node or PTY endpoint (e.g. /dev/ttyUSB0)
    pub device: PathBuf,

    /// Directory to synchronise
    pub folder: PathBuf,

    /// Initiate one sync round once the peers are connected
    #[arg(long)]
    pub send: bool,

    /// Also delete remote entries that are absent locally
    #[arg(long)]
    pub strict: bool,

    /// Exclude entries matched by .gitignore files
    #[arg(long)]
    pub respect_gitignore: bool,

    /// Skip content hashing; compare by size and mtime only
    #[arg(long)]
    pub quick: bool,

    /// Persisted manifest cache for incremental scans
    #[arg(long, value_name = "FILE")]
    pub manifest_cache: Option<PathBuf>,

    /// Seconds to wait for the peer before giving up
    #[arg(long, default_value_t = 60)]
    pub connect_timeout: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["wiresync", "/dev/ttyUSB0", "/data/sync"]);
        assert_eq!(cli.device, PathBuf::from("/dev/ttyUSB0"));
        assert_eq!(cli.folder, PathBuf::from("/data/sync"));
        assert!(!cli.send);
        assert!(!cli.strict);
        assert_eq!(cli.connect_timeout, 60);
    }

    #[test]
    fn parses_full_invocation() {
        let cli = Cli::parse_from([
            "wiresync",
            "/dev/ttyS1",
            "/data",
            "--send",
            "--strict",
            "--respect-gitignore",
            "--quick",
            "--manifest-cache",
            "/tmp/manifest.json",
            "--connect-timeout",
            "10",
        ]);
        assert!(cli.send && cli.strict && cli.respect_gitignore && cli.quick);
        assert_eq!(cli.manifest_cache, Some(PathBuf::from("/tmp/manifest.json")));
        assert_eq!(cli.connect_timeout, 10);
    }
}
