use crate::cloud::Filter;
use crate::scan::{OmitTarget, ScanOptions};
use clap::Parser;
use std::path::PathBuf;

/// Shrink volumes of instances, snapshots and machine images down to their
/// actual usage
#[derive(Parser, Debug)]
#[command(name = "volshrink", author, version, about, long_about = None)]
pub struct Cli {
    /// Listing filters such as tag:Project=alpha,beta
    #[arg(value_name = "Name=Value1,Value2...")]
    pub filters: Vec<String>,

    /// Ask before stopping running instances
    #[arg(short, long)]
    pub interactive: bool,

    /// Skip images (a), instances (e), snapshots (s) or system volumes (b)
    #[arg(short, long, value_enum, value_name = "a|e|s|b")]
    pub omit: Vec<OmitTarget>,

    /// Dispatch instances to worker instances instead of shrinking here
    #[arg(short, long)]
    pub master: bool,

    /// Configuration file (TOML)
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Only list what would be shrunk
    #[arg(long)]
    pub dry_run: bool,

    /// Log file, defaults to volshrink.log in the work path
    #[arg(long, value_name = "FILE")]
    pub log_file: Option<PathBuf>,

    /// Activate debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl Cli {
    pub fn scan_options(&self) -> ScanOptions {
        ScanOptions {
            filters: Filter::parse_all(&self.filters),
            omit: self.omit.iter().copied().collect(),
            interactive: self.interactive,
        }
    }

    pub fn runs_master(&self) -> bool {
        self.master && !self.omit.contains(&OmitTarget::Instances)
    }
}
