//! One-shot resource sampling

use bollard::container::{CPUStats, MemoryStats, NetworkStats, StatsOptions};
use futures_util::StreamExt;

use crate::types::ResourceSample;

use super::daemon::{map_err, DockerDriver};
use super::driver::{DriverError, DriverResult};

/// Take a single resource sample for a container
///
/// A non-streaming read spans two daemon cycles, so `precpu_stats` is
/// populated and a CPU percentage can be computed from one response.
pub(crate) async fn sample_container(
    driver: &DockerDriver,
    id: &str,
) -> DriverResult<ResourceSample> {
    let options = StatsOptions {
        stream: false,
        one_shot: false,
    };

    let mut stream = driver.docker().stats(id, Some(options));

    match stream.next().await {
        Some(Ok(stats)) => Ok(ResourceSample {
            cpu_percent: calculate_cpu(&stats.cpu_stats, &stats.precpu_stats),
            memory_bytes: calculate_memory(&stats.memory_stats),
            net_rx_bytes: sum_network(&stats.networks).0,
            net_tx_bytes: sum_network(&stats.networks).1,
        }),
        Some(Err(e)) => Err(map_err(e, id)),
        None => Err(DriverError::NotFound(id.to_string())),
    }
}

/// Current memory usage in bytes
fn calculate_memory(stats: &MemoryStats) -> u64 {
    stats.usage.unwrap_or(0)
}

/// CPU usage as absolute percentage (100 = one core)
///
/// (container_cpu_delta / system_cpu_delta) * num_cpus * 100, capped at
/// 100% per core.
fn calculate_cpu(current: &CPUStats, previous: &CPUStats) -> f64 {
    let cpu_delta = current
        .cpu_usage
        .total_usage
        .saturating_sub(previous.cpu_usage.total_usage);
    let system_delta = current
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(previous.system_cpu_usage.unwrap_or(0));
    let cpus = current.online_cpus.unwrap_or(1) as f64;

    if system_delta > 0 && cpu_delta > 0 {
        let raw = (cpu_delta as f64 / system_delta as f64) * 100.0 * cpus;
        raw.min(100.0 * cpus)
    } else {
        0.0
    }
}

/// Sum rx/tx bytes across all interfaces
fn sum_network(
    networks: &Option<std::collections::HashMap<String, NetworkStats>>,
) -> (u64, u64) {
    let mut rx = 0u64;
    let mut tx = 0u64;

    if let Some(nets) = networks {
        for stats in nets.values() {
            rx += stats.rx_bytes;
            tx += stats.tx_bytes;
        }
    }

    (rx, tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn empty_memory_stats() -> MemoryStats {
        MemoryStats {
            stats: None,
            max_usage: None,
            usage: None,
            failcnt: None,
            limit: None,
            commit: None,
            commit_peak: None,
            commitbytes: None,
            commitpeakbytes: None,
            privateworkingset: None,
        }
    }

    fn empty_cpu_stats() -> CPUStats {
        CPUStats {
            cpu_usage: bollard::container::CPUUsage {
                percpu_usage: None,
                usage_in_usermode: 0,
                total_usage: 0,
                usage_in_kernelmode: 0,
            },
            system_cpu_usage: None,
            online_cpus: None,
            throttling_data: bollard::container::ThrottlingData {
                periods: 0,
                throttled_periods: 0,
                throttled_time: 0,
            },
        }
    }

    fn empty_network_stats() -> NetworkStats {
        NetworkStats {
            rx_dropped: 0,
            rx_bytes: 0,
            rx_errors: 0,
            tx_packets: 0,
            tx_dropped: 0,
            rx_packets: 0,
            tx_errors: 0,
            tx_bytes: 0,
        }
    }

    #[test]
    fn test_calculate_memory() {
        let mut stats = empty_memory_stats();
        stats.usage = Some(100_000_000);
        assert_eq!(calculate_memory(&stats), 100_000_000);

        assert_eq!(calculate_memory(&empty_memory_stats()), 0);
    }

    #[test]
    fn test_calculate_cpu() {
        let mut current = empty_cpu_stats();
        current.cpu_usage.total_usage = 200_000_000;
        current.system_cpu_usage = Some(1_000_000_000);
        current.online_cpus = Some(4);

        let mut previous = empty_cpu_stats();
        previous.cpu_usage.total_usage = 100_000_000;
        previous.system_cpu_usage = Some(500_000_000);

        // (100M / 500M) * 4 * 100 = 80%
        let cpu = calculate_cpu(&current, &previous);
        assert!((cpu - 80.0).abs() < 0.1);
    }

    #[test]
    fn test_calculate_cpu_zero_delta() {
        let stats = empty_cpu_stats();
        assert_eq!(calculate_cpu(&stats, &stats), 0.0);
    }

    #[test]
    fn test_sum_network() {
        let mut networks = HashMap::new();

        let mut eth0 = empty_network_stats();
        eth0.rx_bytes = 1000;
        eth0.tx_bytes = 2000;
        networks.insert("eth0".to_string(), eth0);

        let mut eth1 = empty_network_stats();
        eth1.rx_bytes = 500;
        eth1.tx_bytes = 1000;
        networks.insert("eth1".to_string(), eth1);

        let (rx, tx) = sum_network(&Some(networks));
        assert_eq!(rx, 1500);
        assert_eq!(tx, 3000);

        assert_eq!(sum_network(&None), (0, 0));
    }
}
