//! Bollard-backed `AgentRuntime` implementation.
//!
//! Container create/destroy and image pull follow the prior `environment/docker/*` files: container
//! create/destroy and image pull from `container.rs`, the stop/kill/wait
//! idiom from `power.rs`, and the memory/cpu/network stats arithmetic
//! from `stats.rs` — adapted from a continuous stats stream to the
//! one-shot, non-streaming snapshot this control plane calls for.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, RemoveContainerOptions,
    StartContainerOptions, StatsOptions, StopContainerOptions,
};
use bollard::image::{BuildImageOptions, CreateImageOptions};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use futures_util::StreamExt;
use tracing::{debug, info, warn};

use crate::runtime::{
    AgentRuntime, ContainerSpec, InspectResult, ProgressSink, RuntimeError, RuntimeResult, Stats,
    StopMethod,
};

/// Linux capabilities dropped from every agent container. Same list the
/// teacher drops for untrusted server processes.
fn dropped_capabilities() -> Vec<String> {
    [
        "SETPCAP", "MKNOD", "AUDIT_WRITE", "CHOWN", "NET_RAW", "DAC_OVERRIDE", "FOWNER",
        "FSETID", "KILL", "SETGID", "SETUID", "NET_BIND_SERVICE", "SYS_CHROOT", "SETFCAP",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    pub fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }
}

#[async_trait]
impl AgentRuntime for DockerRuntime {
    async fn build_image(
        &self,
        context_tar: Vec<u8>,
        dockerfile_name: &str,
        tag: &str,
        sink: ProgressSink,
    ) -> RuntimeResult<String> {
        let options = BuildImageOptions {
            dockerfile: dockerfile_name.to_string(),
            t: tag.to_string(),
            rm: true,
            pull: true,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(context_tar.into()));

        while let Some(result) = stream.next().await {
            let message = result.map_err(|e| RuntimeError::Build(e.to_string()))?;

            if let Some(err) = message.error_detail.and_then(|d| d.message) {
                return Err(RuntimeError::Build(err));
            }
            if let Some(line) = message.stream {
                sink(line.trim().to_string());
            }
        }

        sink(format!("Successfully built image: {tag}"));
        Ok(tag.to_string())
    }

    async fn image_exists(&self, image: &str) -> RuntimeResult<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }

    async fn pull_image(&self, image: &str) -> RuntimeResult<()> {
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);

        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image, status, "pulling");
                    }
                }
                Err(e) => return Err(RuntimeError::ImagePull(e.to_string())),
            }
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> RuntimeResult<String> {
        if !self.image_exists(&spec.image).await? {
            self.pull_image(&spec.image).await?;
        }

        let env_vars: Vec<String> = spec
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let mounts: Vec<Mount> = spec
            .volumes
            .iter()
            .map(|(host, container)| Mount {
                source: Some(host.clone()),
                target: Some(container.clone()),
                typ: Some(MountTypeEnum::BIND),
                read_only: Some(false),
                ..Default::default()
            })
            .collect();

        let mut labels = spec.labels.clone();
        labels.insert("agentainer.managed".to_string(), "true".to_string());

        let host_config = HostConfig {
            mounts: Some(mounts),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            cap_drop: Some(dropped_capabilities()),
            ..Default::default()
        };

        let container_config = Config {
            hostname: Some(spec.id.clone()),
            env: Some(env_vars),
            image: Some(spec.image.clone()),
            labels: Some(labels),
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.id.clone(),
            platform: None,
        };

        let response = self
            .docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 409, ..
                } => RuntimeError::ContainerExists(spec.id.clone()),
                other => RuntimeError::Docker(other),
            })?;

        info!(container_id = %response.id, "created container");
        Ok(response.id)
    }

    async fn start(&self, container_id: &str) -> RuntimeResult<()> {
        let options = StartContainerOptions::<String>::default();
        self.docker
            .start_container(container_id, Some(options))
            .await?;
        Ok(())
    }

    async fn stop(
        &self,
        container_id: &str,
        method: StopMethod,
        grace: Duration,
    ) -> RuntimeResult<()> {
        match method {
            StopMethod::Signal(signal) => {
                let options = KillContainerOptions { signal: &signal };
                if let Err(e) = self.docker.kill_container(container_id, Some(options)).await {
                    warn!(container_id, error = %e, "signal stop failed");
                }
            }
            StopMethod::Native => {
                let options = StopContainerOptions {
                    t: grace.as_secs() as i64,
                };
                if let Err(e) = self
                    .docker
                    .stop_container(container_id, Some(options))
                    .await
                {
                    warn!(container_id, error = %e, "native stop failed");
                }
            }
        }
        Ok(())
    }

    async fn kill(&self, container_id: &str) -> RuntimeResult<()> {
        let options = KillContainerOptions { signal: "SIGKILL" };
        match self.docker.kill_container(container_id, Some(options)).await {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404..=409,
                ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }

    async fn inspect(&self, container_id: &str) -> RuntimeResult<InspectResult> {
        let details = self
            .docker
            .inspect_container(container_id, None)
            .await
            .map_err(|e| match e {
                bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                } => RuntimeError::ContainerNotFound(container_id.to_string()),
                other => RuntimeError::Docker(other),
            })?;

        let state = details.state.unwrap_or_default();
        let started_at = state
            .started_at
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&chrono::Utc));

        Ok(InspectResult {
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code.unwrap_or(0),
            oom_killed: state.oom_killed.unwrap_or(false),
            started_at,
        })
    }

    async fn stats(&self, container_id: &str) -> RuntimeResult<Stats> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(container_id, Some(options));

        let docker_stats = stream
            .next()
            .await
            .ok_or_else(|| RuntimeError::Other("no stats returned".into()))??;

        let memory_bytes = docker_stats.memory_stats.usage.unwrap_or(0);
        let memory_limit_bytes = docker_stats.memory_stats.limit.unwrap_or(0);

        let cpu_absolute_percent =
            calculate_cpu_one_shot(&docker_stats.cpu_stats, &docker_stats.precpu_stats);

        let (network_rx_bytes, network_tx_bytes) = calculate_network(&docker_stats.networks);

        Ok(Stats {
            memory_bytes,
            memory_limit_bytes,
            cpu_absolute_percent,
            network_rx_bytes,
            network_tx_bytes,
        })
    }

    async fn destroy(&self, container_id: &str) -> RuntimeResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: false,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(container_id, Some(options))
            .await
        {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(RuntimeError::Docker(e)),
        }
    }
}

/// CPU percentage from a single one-shot stats read. One-shot reads still
/// carry `precpu_stats` from Docker's own preceding sample, so the delta
/// is computable without the runtime keeping state between calls.
fn calculate_cpu_one_shot(
    cpu: &bollard::container::CPUStats,
    precpu: &bollard::container::CPUStats,
) -> f64 {
    let cpu_delta = cpu
        .cpu_usage
        .total_usage
        .saturating_sub(precpu.cpu_usage.total_usage);
    let system_delta = cpu
        .system_cpu_usage
        .unwrap_or(0)
        .saturating_sub(precpu.system_cpu_usage.unwrap_or(0));
    let cpus = cpu.online_cpus.unwrap_or(1) as f64;

    if system_delta > 0 && cpu_delta > 0 {
        ((cpu_delta as f64 / system_delta as f64) * 100.0 * cpus).min(100.0 * cpus)
    } else {
        0.0
    }
}

fn calculate_network(
    networks: &Option<HashMap<String, bollard::container::NetworkStats>>,
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

    #[test]
    fn cpu_percent_from_delta() {
        let mut cpu = bollard::container::CPUStats::default();
        cpu.cpu_usage.total_usage = 300_000_000;
        cpu.system_cpu_usage = Some(1_500_000_000);
        cpu.online_cpus = Some(4);

        let mut precpu = bollard::container::CPUStats::default();
        precpu.cpu_usage.total_usage = 100_000_000;
        precpu.system_cpu_usage = Some(500_000_000);

        let pct = calculate_cpu_one_shot(&cpu, &precpu);
        // (200M / 1000M) * 4 * 100 = 80%
        assert!((pct - 80.0).abs() < 0.1);
    }

    #[test]
    fn cpu_percent_zero_without_delta() {
        let cpu = bollard::container::CPUStats::default();
        let precpu = bollard::container::CPUStats::default();
        assert_eq!(calculate_cpu_one_shot(&cpu, &precpu), 0.0);
    }

    #[test]
    fn network_sums_all_interfaces() {
        let mut networks = HashMap::new();
        let mut eth0 = bollard::container::NetworkStats::default();
        eth0.rx_bytes = 1000;
        eth0.tx_bytes = 2000;
        networks.insert("eth0".to_string(), eth0);

        let mut eth1 = bollard::container::NetworkStats::default();
        eth1.rx_bytes = 500;
        eth1.tx_bytes = 1000;
        networks.insert("eth1".to_string(), eth1);

        let (rx, tx) = calculate_network(&Some(networks));
        assert_eq!(rx, 1500);
        assert_eq!(tx, 3000);
    }
}
