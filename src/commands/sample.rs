//! One-off process tree sampling.

use anyhow::{Context, Result};
use resmon_agent::sampler::cpu::cpu_samples;
use resmon_agent::store::{now_millis, CPU_MEMORY_KEY, CPU_UTILIZATION_KEY};
use resmon_agent::{
    Config, ExplicitPid, MetricsStore, ProcessResolver, ProcessTreeSource, ProcfsProcessTree,
    StatResolver,
};
use std::time::Instant;

/// Samples a process tree `iterations` times, one sample interval apart,
/// and prints the CPU payload the agent would report for each.
pub async fn command_sample(pid: Option<u32>, iterations: usize, config: &Config) -> Result<()> {
    println!("resmon-agent - Sample Mode");
    println!("==========================");

    let pid = match pid.or(config.pid) {
        Some(pid) => pid,
        None => {
            let launcher = config
                .launcher_pid
                .context("no --pid given and no launcher_pid/pid configured")?;
            let resolver = StatResolver::new(launcher, config.proc_root());
            resolver
                .resolve()
                .with_context(|| format!("resolving {}", resolver.describe()))?
        }
    };
    println!("Sampling {}", ExplicitPid(pid).describe());

    let interval = config.sample_interval();
    let store = MetricsStore::new();
    let mut tree = ProcfsProcessTree::new(pid, config.proc_root());

    for iteration in 1..=iterations {
        let start = Instant::now();
        tree.update_process_tree()
            .with_context(|| format!("sampling process tree of {}", pid))?;

        let (memory, utilization) =
            cpu_samples(tree.rss_memory_size(), tree.cpu_usage_percent(), now_millis());
        store.put(CPU_MEMORY_KEY, memory);
        store.put(CPU_UTILIZATION_KEY, utilization);

        println!(
            "\nIteration {}/{} ({} process(es), scan {:.2}ms):",
            iteration,
            iterations,
            tree.members().len(),
            start.elapsed().as_secs_f64() * 1000.0
        );
        println!("   {}", store.snapshot_json()?);

        if iteration < iterations {
            tokio::time::sleep(interval).await;
        }
    }

    Ok(())
}
