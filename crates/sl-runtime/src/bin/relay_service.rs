//! Runs a configuration document over a pipeline of relay workers.
//!
//! Items are read from stdin as JSON lines and the pipeline's output is
//! written to stdout the same way once input ends.

use anyhow::Context;
use sl_config::{Configuration, PartitionParameter};
use sl_runtime::{codec_registry, init_tracing, Controller, RuntimeConfig};
use sl_types::StreamGraph;
use tokio::io::{AsyncBufReadExt, BufReader};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let path = std::env::var("SLUICE_CONFIGURATION").context("SLUICE_CONFIGURATION is not set")?;
    let runtime = match std::env::var("SLUICE_RUNTIME") {
        Ok(runtime_path) => RuntimeConfig::from_json(&std::fs::read_to_string(&runtime_path)?)?,
        Err(_) => RuntimeConfig::default(),
    };
    let document: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(&path).with_context(|| format!("reading {path}"))?,
    )?;
    let configuration = Configuration::from_json_with(&document, &codec_registry())?;
    let partition = configuration
        .get::<PartitionParameter>(&runtime.partition_parameter)?
        .context("configuration has no partition parameter")?;

    let workers = partition.max_worker_identifier().0 as usize + 1;
    let names: Vec<String> = (0..workers).map(|i| format!("relay-{i}")).collect();
    let machines = partition.machine_count();
    let mut controller = Controller::new(StreamGraph::pipeline(&names)?, runtime);
    controller.add_local_nodes(machines)?;
    controller.launch(&configuration).await?;

    let input = controller
        .input_tokens()
        .first()
        .copied()
        .context("pipeline has no input")?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        controller.push_input(input, serde_json::from_str(&line)?)?;
    }
    controller.shutdown().await?;

    for token in controller.output_tokens() {
        for item in controller.take_output(token) {
            println!("{item}");
        }
    }
    Ok(())
}
