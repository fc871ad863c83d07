//! End-to-end balancing scenarios over a real tree.
//!
//! The direct-harness tests act as the controller and transport for a
//! root plus a row of leaves, stepping the whole tree one tick at a
//! time against simulated platforms. The final test wires the same
//! tree through `Controller` threads over the channel transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use watt_core::{BalanceConfig, Policy, Sample, TreePosition};
use watt_platform::{PlatformIo, SharedPlatform, SimPlatform};
use wattgrid_agent::{build_tree, AgentError, BalancerAgent, Controller};

fn test_config() -> BalanceConfig {
    BalanceConfig {
        wait_interval_sec: 0.0002,
        ..BalanceConfig::default()
    }
}

fn cap_policy(cap: f64) -> Policy {
    Policy {
        power_cap: cap,
        step_count: 0,
        max_epoch_runtime: 0.0,
        power_slack: 0.0,
    }
}

/// A root and its leaves, stepped in lockstep by the test.
struct TestCluster {
    root: BalancerAgent<SharedPlatform>,
    leaves: Vec<BalancerAgent<SharedPlatform>>,
    platforms: Vec<SharedPlatform>,
    cache: Vec<Option<Sample>>,
}

impl TestCluster {
    fn new(num_node: usize, num_package: usize, min_power: f64, max_power: f64) -> Self {
        let fan_in = vec![num_node];
        let config = test_config();

        let mut leaves = Vec::with_capacity(num_node);
        let mut platforms = Vec::with_capacity(num_node);
        for _ in 0..num_node {
            let shared = SharedPlatform::new(
                SimPlatform::new(num_package, min_power, max_power).with_time_window(0.001),
            );
            platforms.push(shared.clone());
            leaves.push(
                BalancerAgent::new(shared, &config, &TreePosition::new(0, fan_in.clone()))
                    .unwrap(),
            );
        }
        let root_platform =
            SharedPlatform::new(SimPlatform::new(num_package, min_power, max_power));
        let root =
            BalancerAgent::new(root_platform, &config, &TreePosition::new(1, fan_in)).unwrap();

        Self {
            root,
            leaves,
            platforms,
            cache: vec![None; num_node],
        }
    }

    /// One lockstep tick of the whole tree.
    fn tick(&mut self, job: &Policy) -> Result<(), AgentError> {
        let mut policy = *job;
        self.root.validate_policy(&mut policy)?;
        let descent = self.root.descend(&policy)?;

        if descent.child_policies[0].power_cap != 0.0 {
            self.cache.fill(None);
        }
        for (idx, leaf) in self.leaves.iter_mut().enumerate() {
            leaf.adjust_platform(&descent.child_policies[idx])?;
            let (sample, complete) = leaf.sample_platform()?;
            if complete {
                self.cache[idx] = Some(sample);
            }
        }
        if self.cache.iter().all(Option::is_some) {
            let samples: Vec<Sample> = self.cache.iter().copied().flatten().collect();
            self.root.ascend(&samples)?;
        }
        Ok(())
    }

    /// Complete one epoch on every package of one node.
    fn feed(&self, node: usize, runtime: f64) {
        self.platforms[node].with(|sim| {
            for package in 0..sim.num_package() {
                sim.advance_epoch(package, runtime, 0.0, 0.0);
            }
        });
    }

    fn enforced(&self, node: usize, package: usize) -> f64 {
        self.platforms[node].with(|sim| sim.enforced_limit(package))
    }

    fn leaf_policy(&self, node: usize) -> Policy {
        self.leaves[node].trace().unwrap().policy
    }
}

#[test]
fn warm_start_splits_cap_across_packages() {
    let mut cluster = TestCluster::new(1, 2, 50.0, 200.0);
    let job = cap_policy(300.0);

    cluster.tick(&job).unwrap();

    // Cap split evenly across the two packages, summing to the job
    // cap at the instant SEND_DOWN_LIMIT completes.
    assert_eq!(cluster.enforced(0, 0), 150.0);
    assert_eq!(cluster.enforced(0, 1), 150.0);
    assert_eq!(cluster.enforced(0, 0) + cluster.enforced(0, 1), 300.0);

    // The leaf reported step 0 with no runtime measured yet.
    let sample = cluster.cache[0].unwrap();
    assert_eq!(sample.step_count, 0);
    assert_eq!(sample.max_epoch_runtime, 0.0);
    assert_eq!(sample.sum_power_slack, 0.0);
}

#[test]
fn slowest_node_runtime_becomes_the_target() {
    let mut cluster = TestCluster::new(2, 2, 50.0, 200.0);
    let job = cap_policy(300.0);

    // Warm start, then measure: leaf 0 runs 1.0 s epochs, leaf 1 runs
    // 2.0 s epochs at 150 W per package.
    cluster.tick(&job).unwrap();
    for _ in 0..40 {
        cluster.feed(0, 1.0);
        cluster.feed(1, 2.0);
        cluster.tick(&job).unwrap();
        if cluster.leaves[0].step_count() == 2 {
            break;
        }
    }

    // MEASURE_RUNTIME completed: the root published the slowest
    // runtime and everyone advanced into REDUCE_LIMIT.
    assert_eq!(cluster.leaves[0].step_count(), 2);
    assert_eq!(cluster.leaf_policy(0).max_epoch_runtime, 2.0);
    assert_eq!(cluster.leaf_policy(1).max_epoch_runtime, 2.0);
}

#[test]
fn zero_headroom_blocks_slack_redistribution() {
    // One package per node so the arithmetic is bare: node 0 speeds up
    // as it yields power (runtime 150/limit), node 1 pins the target
    // at 2.0 s and cannot reduce.
    let mut cluster = TestCluster::new(2, 1, 50.0, 200.0);
    let job = cap_policy(150.0);

    cluster.tick(&job).unwrap();
    for _ in 0..300 {
        let limit = cluster.enforced(0, 0);
        cluster.feed(0, 150.0 / limit);
        cluster.feed(1, 2.0);
        cluster.tick(&job).unwrap();
        if cluster.leaves[0].step_count() >= 3 {
            break;
        }
    }

    // The full cycle closed: next SEND_DOWN_LIMIT reached the leaves.
    assert_eq!(cluster.leaves[0].step_count(), 3);

    // Node 0 gave up real power while still meeting the target; node 1
    // was untouched.
    assert!(cluster.enforced(0, 0) < 100.0);
    assert!(cluster.enforced(0, 0) >= 50.0);
    assert_eq!(cluster.enforced(1, 0), 150.0);

    // Node 1 had zero headroom, so no slack could be redistributed.
    assert_eq!(cluster.leaf_policy(0).power_slack, 0.0);
}

#[test]
fn fresh_cap_mid_run_resets_the_tree() {
    let mut cluster = TestCluster::new(2, 2, 50.0, 200.0);
    let job = cap_policy(300.0);

    cluster.tick(&job).unwrap();
    for _ in 0..20 {
        cluster.feed(0, 1.0);
        cluster.feed(1, 2.0);
        cluster.tick(&job).unwrap();
    }
    assert!(cluster.leaves[0].step_count() > 0);

    // Operator injects a fresh cap mid-run: everyone hard-resets and
    // each package budget becomes 120 W.
    let new_job = cap_policy(240.0);
    cluster.tick(&new_job).unwrap();

    for node in 0..2 {
        assert_eq!(cluster.leaves[node].step_count(), 0);
        assert_eq!(cluster.enforced(node, 0), 120.0);
        assert_eq!(cluster.enforced(node, 1), 120.0);
    }
    let sample = cluster.cache[0].unwrap();
    assert_eq!(sample.step_count, 0);
    assert_eq!(sample.max_epoch_runtime, 0.0);
}

#[test]
fn all_zero_policy_is_rejected() {
    let mut cluster = TestCluster::new(1, 2, 50.0, 200.0);
    let job = cap_policy(300.0);
    cluster.tick(&job).unwrap();
    let step_before = cluster.root.step_count();

    let err = cluster.tick(&Policy::zeroed()).unwrap_err();
    assert!(matches!(err, AgentError::InvalidPolicy(_)));
    assert_eq!(cluster.root.step_count(), step_before);
}

#[test]
fn tree_of_controllers_converges_over_channel_transport() {
    let config = test_config();
    let mut endpoints = build_tree(&[2]);
    let job = Arc::new(Mutex::new(cap_policy(150.0)));
    let shutdown = Arc::new(AtomicBool::new(false));

    let mut handles = Vec::new();

    let (root_pos, root_comm) = endpoints.remove(0);
    let root_platform = SharedPlatform::new(SimPlatform::new(1, 50.0, 200.0));
    let root_agent = BalancerAgent::new(root_platform, &config, &root_pos).unwrap();
    let mut root_controller = Controller::with_job_policy(root_agent, root_comm, job.clone());
    {
        let shutdown = shutdown.clone();
        handles.push(thread::spawn(move || root_controller.run_until(&shutdown)));
    }

    let mut leaf_platforms = Vec::new();
    for (pos, comm) in endpoints {
        let shared =
            SharedPlatform::new(SimPlatform::new(1, 50.0, 200.0).with_time_window(0.001));
        leaf_platforms.push(shared.clone());
        let agent = BalancerAgent::new(shared, &config, &pos).unwrap();
        let mut controller = Controller::new(agent, comm);
        let shutdown = shutdown.clone();
        handles.push(thread::spawn(move || controller.run_until(&shutdown)));
    }

    // Node 0 carries half the work of node 1: at equal limits it runs
    // twice as fast, so the balancer should take power away from it.
    let work = [150.0, 300.0];
    for _ in 0..4000 {
        for (idx, platform) in leaf_platforms.iter().enumerate() {
            platform.with(|sim| {
                let limit = sim.enforced_limit(0).max(50.0);
                sim.advance_epoch(0, work[idx] / limit, 0.0, 0.0);
            });
        }
        thread::sleep(Duration::from_micros(200));
    }
    shutdown.store(true, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let limit_fast = leaf_platforms[0].with(|sim| sim.enforced_limit(0));
    let limit_slow = leaf_platforms[1].with(|sim| sim.enforced_limit(0));

    // The fast node yielded power; the slow node kept its full budget.
    assert!(limit_fast < limit_slow);
    assert!(limit_fast >= 50.0);
    assert!((limit_slow - 150.0).abs() < 1e-6);
    // Job-wide power never exceeded the cap.
    assert!(limit_fast + limit_slow <= 300.0 + 1e-6);
}
