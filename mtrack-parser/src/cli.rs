use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "mtrack_parser",
    version,
    about = "Parses an mtrack event stream and writes a JSON artifact.

In packet mode the stream is read record-by-record from stdin; this is how
the preload library drives the parser. Otherwise --input names a previously
captured stream."
)]
pub struct Opt {
    /// Path to a captured event stream.
    #[arg(long, required_unless_present = "packet_mode")]
    pub input: Option<PathBuf>,

    /// Output filename. A .gz suffix enables gzip bundling.
    #[arg(long, default_value = "mtrack.json")]
    pub output: PathBuf,

    /// Read one record per pipe packet from stdin.
    #[arg(long)]
    pub packet_mode: bool,

    /// Write log output to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Print decoded records to stdout instead of writing the artifact.
    #[arg(long)]
    pub dump: bool,

    /// Never gzip the artifact, regardless of the output filename.
    #[arg(long)]
    pub no_bundle: bool,

    /// Drop Malloc events smaller than this many bytes.
    #[arg(long, default_value_t = 0)]
    pub threshold: u64,

    /// Pid of the traced process (informational).
    #[arg(long)]
    pub pid: Option<u32>,
}
