//! System validation for the agent's data sources.

use anyhow::Result;
use resmon_agent::config::validate_effective_config;
use resmon_agent::proctree::parse_proc_stat;
use resmon_agent::resolver::process_exists;
use resmon_agent::sampler::gpu::parse_gpu_line;
use resmon_agent::{
    CommandSource, Config, ExplicitPid, ProcessResolver, ProcessTreeSource, ProcfsProcessTree,
    StatResolver, TelemetrySource,
};
use std::fs;
use std::time::Duration;

/// How long the GPU command may take to produce its first line.
const GPU_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Validates /proc access, pid resolution and the GPU telemetry command.
///
/// With neither flag set every check runs.
pub async fn command_check(proc: bool, gpu: bool, config: &Config) -> Result<()> {
    println!("resmon-agent - System Check");
    println!("===========================");

    let all = !proc && !gpu;
    let mut all_ok = true;

    if proc || all {
        all_ok &= check_proc(config);
    }

    if gpu || all {
        all_ok &= check_gpu(config).await;
    }

    println!("\nChecking configuration...");
    match validate_effective_config(config, false) {
        Ok(()) => println!("   [ok] Configuration is valid"),
        Err(e) => {
            println!("   [FAIL] Configuration invalid: {}", e);
            all_ok = false;
        }
    }

    println!("\nSummary:");
    if all_ok {
        println!("   [ok] All checks passed - agent is ready");
        Ok(())
    } else {
        println!("   [FAIL] Some checks failed - please review the output above");
        std::process::exit(1);
    }
}

fn check_proc(config: &Config) -> bool {
    let proc_root = config.proc_root();
    println!("\nChecking {} ...", proc_root.display());

    let own_stat = proc_root.join(std::process::id().to_string()).join("stat");
    match fs::read_to_string(&own_stat) {
        Ok(content) => match parse_proc_stat(&content) {
            Ok(stat) => println!("   [ok] stat records readable (own ppid {})", stat.ppid),
            Err(e) => {
                println!("   [FAIL] Cannot parse {}: {}", own_stat.display(), e);
                return false;
            }
        },
        Err(e) => {
            println!("   [FAIL] Cannot read {}: {}", own_stat.display(), e);
            return false;
        }
    }

    let resolver: Box<dyn ProcessResolver> = match (config.pid, config.launcher_pid) {
        (Some(pid), _) => Box::new(ExplicitPid(pid)),
        (None, Some(launcher)) => Box::new(StatResolver::new(launcher, proc_root.clone())),
        (None, None) => {
            println!("   [skip] No launcher_pid or pid configured; resolution not checked");
            return true;
        }
    };

    let pid = match resolver.resolve() {
        Ok(pid) => pid,
        Err(e) => {
            println!("   [FAIL] {}: {}", resolver.describe(), e);
            return false;
        }
    };
    if !process_exists(&proc_root, pid) {
        println!("   [FAIL] {} resolved to pid {} which does not exist", resolver.describe(), pid);
        return false;
    }
    println!("   [ok] {} -> pid {}", resolver.describe(), pid);

    let mut tree = ProcfsProcessTree::new(pid, proc_root);
    match tree.update_process_tree() {
        Ok(()) => {
            println!(
                "   [ok] Process tree of {} has {} member(s), rss {} bytes",
                pid,
                tree.members().len(),
                tree.rss_memory_size()
            );
            true
        }
        Err(e) => {
            println!("   [FAIL] Process tree scan failed: {}", e);
            false
        }
    }
}

async fn check_gpu(config: &Config) -> bool {
    println!("\nChecking GPU telemetry command...");
    let Some(source) = CommandSource::from_argv(&config.gpu_argv()) else {
        println!("   [FAIL] gpu_command is empty");
        return false;
    };
    if config.gpus().is_empty() {
        println!("   [info] No GPUs configured; the agent will not start the GPU sampler");
    }

    let mut stream = match source.open().await {
        Ok(stream) => stream,
        Err(e) => {
            println!("   [FAIL] {}", e);
            return false;
        }
    };

    match tokio::time::timeout(GPU_PROBE_TIMEOUT, stream.next_line()).await {
        Ok(Ok(Some(line))) => match parse_gpu_line(&line) {
            Ok(reading) => {
                println!(
                    "   [ok] {} -> gpu {}: {} used, {}% busy",
                    source.describe(),
                    reading.index,
                    reading.memory_used,
                    reading.utilization
                );
                true
            }
            Err(e) => {
                println!("   [FAIL] Unexpected output '{}': {}", line, e);
                false
            }
        },
        Ok(Ok(None)) => {
            println!("   [FAIL] {} exited without output", source.describe());
            false
        }
        Ok(Err(e)) => {
            println!("   [FAIL] Reading from {} failed: {}", source.describe(), e);
            false
        }
        Err(_) => {
            println!(
                "   [FAIL] No output from {} within {:?}",
                source.describe(),
                GPU_PROBE_TIMEOUT
            );
            false
        }
    }
}
