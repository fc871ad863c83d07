//! Simulated multi-node balancing run.
//!
//! One thread per tree agent, one `SharedPlatform` per leaf. The main
//! thread plays the instrumented application: each tick it completes
//! an epoch on every node whose runtime is `work / enforced_power`, so
//! nodes with more work run slower and the balancer should shift power
//! toward them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context};
use tracing::info;
use watt_platform::PlatformIo;

use watt_core::{BalanceConfig, Policy};
use watt_platform::{SharedPlatform, SimPlatform};
use wattgrid_agent::{build_tree, BalancerAgent, Controller};

pub struct SimulateArgs {
    pub nodes: usize,
    pub packages: usize,
    pub power_cap: f64,
    pub new_cap: Option<f64>,
    pub min_power: f64,
    pub max_power: f64,
    pub work: Option<Vec<f64>>,
    pub ticks: u64,
    pub config: BalanceConfig,
}

pub fn run(args: SimulateArgs) -> anyhow::Result<()> {
    if args.nodes == 0 || args.packages == 0 {
        bail!("need at least one node and one package");
    }
    let work = match args.work {
        Some(work) => {
            if work.len() != args.nodes {
                bail!("--work needs one entry per node ({} given, {} nodes)", work.len(), args.nodes);
            }
            work
        }
        // Even spread from 1x to 2x the cap: the last node is the
        // natural straggler.
        None => (0..args.nodes)
            .map(|idx| {
                let skew = 1.0 + idx as f64 / args.nodes.max(1) as f64;
                args.power_cap * skew
            })
            .collect(),
    };

    info!(
        nodes = args.nodes,
        packages = args.packages,
        power_cap = args.power_cap,
        "starting simulated balancing tree"
    );

    let mut endpoints = build_tree(&[args.nodes]);
    let job = Arc::new(Mutex::new(Policy {
        power_cap: args.power_cap,
        step_count: 0,
        max_epoch_runtime: 0.0,
        power_slack: 0.0,
    }));
    let shutdown = Arc::new(AtomicBool::new(false));
    let mut handles = Vec::new();

    // ── Root agent ───────────────────────────────────────────────
    let (root_pos, root_comm) = endpoints.remove(0);
    let root_platform = SharedPlatform::new(SimPlatform::new(
        args.packages,
        args.min_power,
        args.max_power,
    ));
    let root_agent = BalancerAgent::new(root_platform, &args.config, &root_pos)
        .context("building root agent")?;
    let mut root_controller = Controller::with_job_policy(root_agent, root_comm, job.clone());
    {
        let shutdown = shutdown.clone();
        handles.push(
            thread::Builder::new()
                .name("wattd-root".to_string())
                .spawn(move || root_controller.run_until(&shutdown))?,
        );
    }

    // ── Leaf agents ──────────────────────────────────────────────
    let mut platforms = Vec::with_capacity(args.nodes);
    for (idx, (pos, comm)) in endpoints.into_iter().enumerate() {
        let shared = SharedPlatform::new(
            SimPlatform::new(args.packages, args.min_power, args.max_power)
                .with_time_window(0.001),
        );
        platforms.push(shared.clone());
        let agent = BalancerAgent::new(shared, &args.config, &pos)
            .with_context(|| format!("building leaf agent {idx}"))?;
        let mut controller = Controller::new(agent, comm);
        let shutdown = shutdown.clone();
        handles.push(
            thread::Builder::new()
                .name(format!("wattd-leaf-{idx}"))
                .spawn(move || controller.run_until(&shutdown))?,
        );
    }

    // ── Workload loop ────────────────────────────────────────────
    let epoch_pause = Duration::from_secs_f64(args.config.wait_interval_sec);
    for tick in 0..args.ticks {
        if let Some(new_cap) = args.new_cap {
            if tick == args.ticks / 2 {
                info!(new_cap, "operator injecting fresh job-level cap");
                let mut policy = job.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                policy.power_cap = new_cap;
            }
        }
        for (idx, platform) in platforms.iter().enumerate() {
            platform.with(|sim| {
                let node_power: f64 = (0..sim.num_package())
                    .map(|package| sim.enforced_limit(package))
                    .sum();
                let runtime = work[idx] / node_power.max(1.0);
                for package in 0..sim.num_package() {
                    sim.advance_epoch(package, runtime, 0.0, 0.0);
                }
            });
        }
        thread::sleep(epoch_pause);
    }

    shutdown.store(true, Ordering::Relaxed);
    for handle in handles {
        match handle.join() {
            Ok(result) => result.context("agent stopped on fatal error")?,
            Err(_) => bail!("agent thread panicked"),
        }
    }

    // ── Report ───────────────────────────────────────────────────
    let mut total_power = 0.0;
    println!("node  enforced_w  epoch_runtime_s");
    for (idx, platform) in platforms.iter().enumerate() {
        let node_power: f64 = platform.with(|sim| {
            (0..sim.num_package())
                .map(|package| sim.enforced_limit(package))
                .sum()
        });
        total_power += node_power;
        println!(
            "{idx:<4}  {node_power:>10.1}  {:>15.3}",
            work[idx] / node_power.max(1.0)
        );
    }
    println!(
        "total enforced power: {total_power:.1} W (job cap {:.1} W)",
        args.new_cap.unwrap_or(args.power_cap) * args.nodes as f64
    );
    info!("simulation complete");
    Ok(())
}
