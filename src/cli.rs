//! Command-line interface definitions and parsing.
//!
//! The binary is a thin harness over the library: build one engine from the
//! rule files named here, then run it across the input files. Transport
//! integration (queues, REST front-ends) lives outside this crate.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "dredge")]
#[command(about = "Recursive object scanning engine for file-centric intrusion detection")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Scan one or more files and print their result trees
    Scan(ScanArgs),
    /// Validate rule files and action tables without scanning anything
    Check(RuleArgs),
}

#[derive(Parser, Debug)]
pub struct ScanArgs {
    /// Files to scan
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    #[command(flatten)]
    pub rules: RuleArgs,

    /// Origin tag recorded on every result
    #[arg(long, default_value = "cli")]
    pub source: String,

    /// Result verbosity: minimal, full, nobuffer, everything
    #[arg(long, default_value = "full")]
    pub verbosity: String,

    /// Queue discipline: bfs or dfs
    #[arg(long, default_value = "bfs")]
    pub queue_order: String,

    /// Object hash algorithm: md5, sha1, sha256, sha512
    #[arg(long, default_value = "md5")]
    pub hash: String,

    /// Print full result JSON instead of one verdict line per file
    #[arg(long)]
    pub json: bool,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Exit non-zero if any file receives this disposition
    #[arg(long)]
    pub error_on: Option<String>,
}

/// Rule and action-table locations, shared by `scan` and `check`.
#[derive(Parser, Debug)]
pub struct RuleArgs {
    /// YARA dispatch rules (object typing)
    #[arg(long)]
    pub dispatch_rules: Option<PathBuf>,

    /// Dispatch action table (rule name -> module list)
    #[arg(long)]
    pub dispatch_actions: Option<PathBuf>,

    /// YARA disposition rules (flag folding)
    #[arg(long)]
    pub disposition_rules: Option<PathBuf>,

    /// Disposition action table (rule name -> verdict)
    #[arg(long)]
    pub disposition_actions: Option<PathBuf>,

    /// Signature rule set for the SCAN_YARA module
    #[arg(long)]
    pub signatures: Option<PathBuf>,
}
