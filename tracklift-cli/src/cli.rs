use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "tracklift",
    author,
    version,
    about = "Download, license and decrypt segmented media tracks",
    long_about = None
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to <config dir>/tracklift/config.toml)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors and hide progress bars
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run every track of a job document
    Download(DownloadArgs),

    /// Inspect or seed the key vaults
    Vault {
        #[command(subcommand)]
        command: VaultCommand,

        #[command(flatten)]
        store: VaultArgs,
    },
}

/// Vault backends shared by all subcommands.
#[derive(ClapArgs, Debug, Clone, Default)]
pub struct VaultArgs {
    /// JSON key vault file
    #[arg(long, value_name = "PATH", global = true)]
    pub vault_file: Option<PathBuf>,

    /// SQLite key vault database
    #[arg(long, value_name = "PATH", global = true)]
    pub vault_db: Option<PathBuf>,
}

#[derive(ClapArgs, Debug)]
pub struct DownloadArgs {
    /// Job document (JSON)
    pub job: PathBuf,

    /// Output directory
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    #[command(flatten)]
    pub store: VaultArgs,

    /// Content key as KID:KEY in hex, may be repeated
    #[arg(long = "key", value_name = "KID:KEY")]
    pub keys: Vec<String>,

    /// Segment downloads in flight per track
    #[arg(short = 'c', long = "concurrency", value_name = "N")]
    pub concurrency: Option<usize>,

    /// Tracks processed at the same time
    #[arg(long = "tracks", value_name = "N")]
    pub tracks: Option<usize>,

    /// Retries per segment after the first attempt
    #[arg(long, value_name = "N")]
    pub retries: Option<u32>,

    /// Always ask the license server, ignoring stored keys
    #[arg(long, conflicts_with = "vaults_only")]
    pub cdm_only: bool,

    /// Never contact a license server
    #[arg(long)]
    pub vaults_only: bool,

    /// Resolve content keys without downloading any segment
    #[arg(long)]
    pub license_only: bool,

    /// Merge resolved keys into this JSON file
    #[arg(long, value_name = "PATH")]
    pub export_keys: Option<PathBuf>,

    /// License server used when a track does not name one
    #[arg(long, value_name = "URL")]
    pub license_url: Option<String>,

    /// Proxy for segment and license traffic (http, https or socks5)
    #[arg(long, value_name = "URL")]
    pub proxy: Option<String>,

    #[arg(long, requires = "proxy")]
    pub proxy_username: Option<String>,

    #[arg(long, requires = "proxy_username")]
    pub proxy_password: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum VaultCommand {
    /// Look up the key stored for a key id
    Get {
        /// Key id in hex
        kid: String,

        /// DRM system the key belongs to
        #[arg(long, default_value = "clearkey")]
        scope: String,
    },

    /// Store a KID:KEY pair
    Add {
        #[arg(value_name = "KID:KEY")]
        pair: String,

        #[arg(long, default_value = "clearkey")]
        scope: String,
    },

    /// List every key of a scope
    List {
        #[arg(long, default_value = "clearkey")]
        scope: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_download_flags() {
        let args = Args::parse_from([
            "tracklift",
            "download",
            "job.json",
            "-o",
            "out",
            "--key",
            "00112233445566778899aabbccddeeff:0f0e0d0c0b0a09080706050403020100",
            "-c",
            "8",
            "--tracks",
            "2",
            "--vault-file",
            "keys.json",
            "--vaults-only",
        ]);
        let Commands::Download(download) = args.command else {
            panic!("expected download");
        };
        assert_eq!(download.job, PathBuf::from("job.json"));
        assert_eq!(download.concurrency, Some(8));
        assert_eq!(download.tracks, Some(2));
        assert_eq!(download.keys.len(), 1);
        assert!(download.vaults_only);
        assert_eq!(download.store.vault_file, Some(PathBuf::from("keys.json")));
    }

    #[test]
    fn key_policy_flags_conflict() {
        let result = Args::try_parse_from([
            "tracklift",
            "download",
            "job.json",
            "--cdm-only",
            "--vaults-only",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn vault_scope_defaults_to_clearkey() {
        let args = Args::parse_from(["tracklift", "vault", "get", "00112233445566778899aabbccddeeff"]);
        let Commands::Vault {
            command: VaultCommand::Get { scope, .. },
            ..
        } = args.command
        else {
            panic!("expected vault get");
        };
        assert_eq!(scope, "clearkey");
    }
}
