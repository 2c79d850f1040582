mod args;
use args::{parse_args, Commands};

use std::fs;

use anyhow::{anyhow, Context};
use bytes::Bytes;
use itertools::Itertools;
use serde_json::{json, Map, Value};
use tracing_subscriber::EnvFilter;

use common::job::{JobConfig, JobOutput, KeyPredicate};
use mrl_node::grid::PartitionedMap;
use mrl_node::{LocalCluster, NodeConfig};

/// Name of the map input files are loaded into.
const INPUT_MAP: &str = "input";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match parse_args() {
        Commands::Workloads => {
            println!("{}", workload::NAMES.iter().join("\n"));
        }
        Commands::Run {
            input,
            workload,
            members,
            partitions,
            chunk_size,
            key_prefix,
            retry_limit,
            json,
            args,
        } => {
            if workload::try_named(&workload).is_none() {
                return Err(anyhow!(
                    "unknown workload `{workload}`, expected one of: {}",
                    workload::NAMES.iter().join(", ")
                ));
            }

            let node_config = NodeConfig {
                partition_count: partitions,
                contention_retry_limit: retry_limit,
            };
            let cluster = LocalCluster::start(members, node_config)?;
            let loaded = load_input(&input, &cluster.grid().map(INPUT_MAP))?;
            tracing::info!(input = %input, lines = loaded, "input loaded");

            let mut config = JobConfig::new(workload.clone(), workload, INPUT_MAP)
                .with_chunk_size(chunk_size)
                .with_aux(args);
            if let Some(prefix) = key_prefix {
                config = config.with_predicate(KeyPredicate::Prefix(Bytes::from(prefix)));
            }

            let output = cluster.run(config).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&to_json(&output))?);
            } else {
                println!("{}", to_text(&output));
            }
        }
    }

    Ok(())
}

/// Loads every line of the files matching `pattern` into `map`, keyed by
/// `path:line`. Returns the number of lines loaded.
fn load_input(pattern: &str, map: &PartitionedMap) -> anyhow::Result<usize> {
    let mut loaded = 0;
    for path in glob::glob(pattern).with_context(|| format!("bad input pattern `{pattern}`"))? {
        let path = path?;
        let contents =
            fs::read_to_string(&path).with_context(|| format!("cannot read {}", path.display()))?;
        for (number, line) in contents.lines().enumerate() {
            map.put(format!("{}:{}", path.display(), number + 1), line.to_string());
            loaded += 1;
        }
    }
    Ok(loaded)
}

fn lossy(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn to_text(output: &JobOutput) -> String {
    match output {
        JobOutput::Reduced(values) => values
            .iter()
            .map(|(key, value)| format!("{} {}", lossy(key), lossy(value)))
            .join("\n"),
        JobOutput::Mapped(values) => values
            .iter()
            .flat_map(|(key, values)| values.iter().map(move |value| (key, value)))
            .map(|(key, value)| format!("{} {}", lossy(key), lossy(value)))
            .join("\n"),
    }
}

fn to_json(output: &JobOutput) -> Value {
    let entries: Map<String, Value> = match output {
        JobOutput::Reduced(values) => values
            .iter()
            .map(|(key, value)| (lossy(key), json!(lossy(value))))
            .collect(),
        JobOutput::Mapped(values) => values
            .iter()
            .map(|(key, values)| (lossy(key), json!(values.iter().map(lossy).collect_vec())))
            .collect(),
    };
    Value::Object(entries)
}
