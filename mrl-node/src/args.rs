use clap::{Parser, Subcommand};

use common::job::DEFAULT_CHUNK_SIZE;
use mrl_node::config::DEFAULT_PARTITION_COUNT;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[clap(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a job over local files on an in-process cluster.
    Run {
        /// Glob spec for the input files
        #[arg(short, long)]
        input: String,

        /// Name of the workload
        #[arg(short, long, default_value = "wc")]
        workload: String,

        /// Number of cluster members
        #[arg(short, long, default_value_t = 3)]
        members: usize,

        #[arg(short, long, default_value_t = DEFAULT_PARTITION_COUNT)]
        partitions: u32,

        /// Mapped values buffered before a chunk is sent
        #[arg(short, long, default_value_t = DEFAULT_CHUNK_SIZE)]
        chunk_size: usize,

        /// Only map lines of files whose path starts with this prefix
        #[arg(short, long)]
        key_prefix: Option<String>,

        /// Give up on a job after this many consecutive claim contentions
        #[arg(long)]
        retry_limit: Option<u64>,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,

        /// Auxiliary arguments to pass to the MapReduce application.
        #[clap(value_parser, last = true)]
        args: Vec<String>,
    },
    /// List the workloads a member can run.
    Workloads,
}

pub fn parse_args() -> Commands {
    Args::parse().command
}
