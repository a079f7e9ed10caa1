//! Host sandbox runtime built on throwaway volumes and process groups.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::egress::Egress;
use super::process::{self, CommandPlan, Ended, ProcessOutcome};
use super::{
    ExecutionResult, ExecutionStatus, NetworkPolicy, ResourceUsage, Sandbox, SandboxProvider,
    SandboxState, Volume, network_isolation_supported,
};
use crate::action::{Action, ActionKind, AgentId};
use crate::config::SandboxConfig;
use crate::error::{FailureKind, SandboxError};
use crate::limits::{ExecutionLimits, LimitedBuffer, ResourceQuota};
use crate::validator::HostAllowlist;

/// Counters describing the runtime's lifetime activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuntimeStats {
    /// Volumes created from scratch
    pub provisioned: u64,
    /// Acquires served from the warm pool
    pub reused: u64,
    /// Volumes deleted instead of pooled
    pub destroyed: u64,
    /// Sandboxes currently handed out
    pub live: u64,
}

#[derive(Debug, Default)]
struct Counters {
    provisioned: AtomicU64,
    reused: AtomicU64,
    destroyed: AtomicU64,
    live: AtomicU64,
}

/// Runs actions as host processes inside private volumes.
///
/// Wiped volumes go back to a warm pool so most acquires skip provisioning
/// entirely. A pooled volume has no owner; it is bound to the next agent only
/// after the wipe that cleared the previous one.
pub struct SandboxRuntime {
    config: SandboxConfig,
    root: PathBuf,
    pool: Mutex<Vec<Volume>>,
    counters: Counters,
}

impl std::fmt::Debug for SandboxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxRuntime")
            .field("root", &self.root)
            .field("warm", &self.warm())
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl SandboxRuntime {
    /// Create a runtime, making sure the volume root exists.
    ///
    /// # Errors
    ///
    /// Fails if the volume root cannot be created, or if `isolate_network`
    /// is set on a host without unprivileged user namespaces. The runtime
    /// never silently falls back to the host network.
    pub fn new(config: SandboxConfig) -> Result<Self, SandboxError> {
        if config.isolate_network && !network_isolation_supported() {
            return Err(SandboxError::Provisioning(
                "network isolation requested but user and network namespaces are unavailable; \
                 set sandbox.isolate_network = false to run with the host network"
                    .to_string(),
            ));
        }
        if !config.isolate_network {
            warn!("Network isolation disabled; sandboxed processes share the host network");
        }
        let root = config.volume_root();
        std::fs::create_dir_all(&root).map_err(|e| {
            SandboxError::Provisioning(format!("volume root {}: {e}", root.display()))
        })?;
        Ok(Self {
            config,
            root,
            pool: Mutex::new(Vec::new()),
            counters: Counters::default(),
        })
    }

    /// Runtime configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Fill the warm pool up to its configured size. Returns how many
    /// volumes were added.
    pub async fn prewarm(&self) -> Result<usize, SandboxError> {
        let mut added = 0;
        while self.warm() < self.config.warm_pool {
            let volume = self.provision().await?;
            self.pool().push(volume);
            added += 1;
        }
        if added > 0 {
            info!(added, warm = self.warm(), "Sandbox pool prewarmed");
        }
        Ok(added)
    }

    /// Lifetime counters.
    pub fn stats(&self) -> RuntimeStats {
        RuntimeStats {
            provisioned: self.counters.provisioned.load(Ordering::Relaxed),
            reused: self.counters.reused.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
            live: self.counters.live.load(Ordering::Relaxed),
        }
    }

    fn warm(&self) -> usize {
        self.pool().len()
    }

    fn pool(&self) -> std::sync::MutexGuard<'_, Vec<Volume>> {
        self.pool.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn provision(&self) -> Result<Volume, SandboxError> {
        let budget = self.config.cold_start_budget;
        let root = self.root.clone();
        let started = Instant::now();
        let volume = tokio::time::timeout(
            budget,
            tokio::task::spawn_blocking(move || Volume::create(&root)),
        )
        .await
        .map_err(|_| SandboxError::ColdStartExceeded(budget))?
        .map_err(|e| SandboxError::Provisioning(format!("provisioning task failed: {e}")))?
        .map_err(|e| SandboxError::Provisioning(e.to_string()))?;
        self.counters.provisioned.fetch_add(1, Ordering::Relaxed);
        debug!(
            path = %volume.path().display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Provisioned sandbox volume"
        );
        Ok(volume)
    }

    fn plan(&self, action: &Action) -> Option<CommandPlan> {
        let payload = action.payload().to_string();
        match action.kind() {
            ActionKind::Shell => CommandPlan::from_template(&self.config.shell, [payload]),
            ActionKind::PackageInstall => CommandPlan::from_template(
                &self.config.installer,
                action.payload().split_whitespace().map(String::from),
            ),
            ActionKind::NetworkFetch => {
                CommandPlan::from_template(&self.config.fetcher, [payload.trim().to_string()])
            }
            ActionKind::FileWrite | ActionKind::FileDelete => None,
        }
    }

    async fn run_process(
        &self,
        sandbox: &Sandbox,
        volume: &Volume,
        action: &Action,
        limits: &ExecutionLimits,
        cancel: CancellationToken,
    ) -> Result<ProcessOutcome, SandboxError> {
        let plan = self.plan(action).ok_or_else(|| {
            SandboxError::Spawn(format!("no command template for {}", action.kind()))
        })?;
        let limits = ExecutionLimits {
            timeout: limits.timeout.min(sandbox.remaining()),
            ..*limits
        };
        let egress = self.egress(sandbox.network());
        process::run(&plan, volume, *sandbox.quota(), &limits, &egress, cancel).await
    }

    /// Network confinement for processes in a sandbox with `network`.
    fn egress(&self, network: &NetworkPolicy) -> Egress {
        if !self.config.isolate_network {
            Egress::Host
        } else if network.is_deny_all() {
            Egress::Blocked
        } else {
            Egress::Proxied(HostAllowlist::new(&network.allowlist))
        }
    }
}

#[async_trait]
impl SandboxProvider for SandboxRuntime {
    async fn acquire(
        &self,
        owner: &AgentId,
        quota: ResourceQuota,
        network: NetworkPolicy,
    ) -> Result<Sandbox, SandboxError> {
        let pooled = self.pool().pop();
        let reused = pooled.is_some();
        let mut volume = match pooled {
            Some(volume) => volume,
            None => self.provision().await?,
        };
        if reused {
            self.counters.reused.fetch_add(1, Ordering::Relaxed);
        }
        volume
            .claim(owner)
            .map_err(|e| SandboxError::Provisioning(format!("claim volume: {e}")))?;

        let mut sandbox = Sandbox::new(
            owner.clone(),
            quota,
            network,
            volume.path(),
            self.config.max_lifetime,
        );
        sandbox.volume = Some(volume);
        sandbox.transition(SandboxState::Ready)?;
        self.counters.live.fetch_add(1, Ordering::Relaxed);
        info!(
            sandbox_id = %sandbox.id(),
            agent_id = %owner,
            reused,
            "Sandbox ready"
        );
        Ok(sandbox)
    }

    async fn run(
        &self,
        sandbox: &mut Sandbox,
        action: &Action,
        limits: &ExecutionLimits,
        cancel: CancellationToken,
    ) -> Result<ExecutionResult, SandboxError> {
        if action.agent_id() != sandbox.owner() {
            warn!(
                sandbox_id = %sandbox.id(),
                owner = %sandbox.owner(),
                requester = %action.agent_id(),
                "Refusing to run another agent's action"
            );
            return Err(SandboxError::OwnerMismatch {
                sandbox: sandbox.id(),
                owner: sandbox.owner().clone(),
                requester: action.agent_id().clone(),
            });
        }
        if sandbox.remaining().is_zero() {
            return Err(SandboxError::Expired(sandbox.id()));
        }
        let Some(volume) = sandbox.volume.take() else {
            return Err(SandboxError::NotReady {
                id: sandbox.id(),
                state: "no volume attached".to_string(),
            });
        };
        if let Err(e) = sandbox.transition(SandboxState::Running) {
            sandbox.volume = Some(volume);
            return Err(e);
        }
        debug!(
            sandbox_id = %sandbox.id(),
            action_id = %action.id(),
            kind = %action.kind(),
            "Running action"
        );

        let outcome = match action.kind() {
            ActionKind::FileWrite | ActionKind::FileDelete => {
                Ok(Ok(file_operation(&volume, action, limits)))
            }
            ActionKind::NetworkFetch => match fetch_refusal(sandbox.network(), action.payload()) {
                Some(reason) => Err(reason),
                None => Ok(self
                    .run_process(sandbox, &volume, action, limits, cancel)
                    .await),
            },
            ActionKind::Shell | ActionKind::PackageInstall => Ok(self
                .run_process(sandbox, &volume, action, limits, cancel)
                .await),
        };

        let disk_bytes = volume.disk_usage().unwrap_or_else(|e| {
            warn!(sandbox_id = %sandbox.id(), error = %e, "Failed to measure disk usage");
            0
        });
        sandbox.volume = Some(volume);
        sandbox.transition(SandboxState::Ready)?;

        let mut result = match outcome {
            Ok(run) => into_result(action, run?),
            Err(reason) => {
                warn!(sandbox_id = %sandbox.id(), action_id = %action.id(), %reason, "Egress refused");
                ExecutionResult::not_run(
                    action.id(),
                    ExecutionStatus::Denied,
                    FailureKind::PolicyRejection,
                    vec![reason],
                )
            }
        };
        result.sandbox_id = Some(sandbox.id());
        result.resource_usage.disk_bytes = disk_bytes;
        if disk_bytes > sandbox.quota().disk_bytes() {
            result.resource_usage.disk_quota_exceeded = true;
            result.reasons.push(format!(
                "disk usage {disk_bytes} bytes exceeds quota of {} MiB",
                sandbox.quota().disk_mb
            ));
        }
        info!(
            sandbox_id = %sandbox.id(),
            action_id = %action.id(),
            status = ?result.status,
            exit_code = ?result.exit_code,
            wall_clock_ms = result.wall_clock_ms,
            "Action finished"
        );
        Ok(result)
    }

    async fn release(&self, mut sandbox: Sandbox) {
        if sandbox.transition(SandboxState::TearingDown).is_err() {
            warn!(sandbox_id = %sandbox.id(), state = %sandbox.state(), "Releasing sandbox in unexpected state");
        }
        self.counters.live.fetch_sub(1, Ordering::Relaxed);
        let id = sandbox.id();

        if let Some(mut volume) = sandbox.volume.take() {
            let keep = self.warm() < self.config.warm_pool;
            let wiped = tokio::task::spawn_blocking(move || {
                let wiped = if keep { volume.wipe() } else { Ok(()) };
                (volume, wiped)
            })
            .await;
            match wiped {
                Ok((volume, Ok(()))) if keep => {
                    self.pool().push(volume);
                    debug!(sandbox_id = %id, "Volume wiped and returned to pool");
                }
                Ok((volume, result)) => {
                    if let Err(e) = result {
                        warn!(sandbox_id = %id, error = %e, "Volume wipe failed, destroying");
                    }
                    drop(volume);
                    self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
                    debug!(sandbox_id = %id, "Volume destroyed");
                }
                Err(e) => {
                    warn!(sandbox_id = %id, error = %e, "Volume teardown task failed");
                    self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let _ = sandbox.transition(SandboxState::Closed);
        info!(sandbox_id = %id, agent_id = %sandbox.owner(), "Sandbox released");
    }
}

/// Reason to refuse a fetch whose host is outside the sandbox's egress policy.
fn fetch_refusal(network: &NetworkPolicy, payload: &str) -> Option<String> {
    let url = match Url::parse(payload.trim()) {
        Ok(url) => url,
        Err(e) => return Some(format!("unparseable URL: {e}")),
    };
    let Some(host) = url.host_str() else {
        return Some("URL has no host".to_string());
    };
    let egress = HostAllowlist::new(&network.allowlist);
    if egress.allows(host) {
        None
    } else {
        Some(format!("host {host} is not on the sandbox egress allowlist"))
    }
}

/// Perform a file write or delete directly inside the volume.
fn file_operation(volume: &Volume, action: &Action, limits: &ExecutionLimits) -> ProcessOutcome {
    let started = Instant::now();
    let mut stderr = LimitedBuffer::new(limits.max_output_bytes);
    let result = volume
        .resolve(action.payload().trim())
        .and_then(|path| match action.kind() {
            ActionKind::FileWrite => write_file(&path, action.content().unwrap_or_default()),
            _ => delete_path(&path),
        });
    let exit_code = match result {
        Ok(()) => 0,
        Err(e) => {
            stderr.write(format!("{}: {e}\n", action.payload().trim()).as_bytes());
            1
        }
    };
    ProcessOutcome {
        ended: Ended::Exited,
        exit_code: Some(exit_code),
        stdout: LimitedBuffer::new(limits.max_output_bytes),
        stderr,
        wall: started.elapsed(),
    }
}

fn write_file(path: &Path, content: &str) -> Result<(), SandboxError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, content)?;
    Ok(())
}

fn delete_path(path: &Path) -> Result<(), SandboxError> {
    let meta = std::fs::symlink_metadata(path)?;
    if meta.is_dir() {
        std::fs::remove_dir_all(path)?;
    } else {
        std::fs::remove_file(path)?;
    }
    Ok(())
}

fn into_result(action: &Action, outcome: ProcessOutcome) -> ExecutionResult {
    let truncated = outcome.stdout.was_truncated() || outcome.stderr.was_truncated();
    let (status, failure, reason) = match outcome.ended {
        Ended::Exited => (ExecutionStatus::Completed, None, None),
        Ended::TimedOut => (
            ExecutionStatus::TimedOut,
            Some(FailureKind::ExecutionTimeout),
            Some("killed after the wall-clock timeout".to_string()),
        ),
        Ended::Cancelled => (
            ExecutionStatus::Cancelled,
            Some(FailureKind::Cancelled),
            Some("cancelled while running".to_string()),
        ),
    };
    let usage = ResourceUsage {
        wall_time_ms: duration_ms(outcome.wall),
        stdout_bytes: outcome.stdout.bytes_seen(),
        stderr_bytes: outcome.stderr.bytes_seen(),
        ..ResourceUsage::default()
    };
    ExecutionResult {
        action_id: action.id(),
        sandbox_id: None,
        exit_code: outcome.exit_code,
        stdout: String::from_utf8_lossy(&outcome.stdout.into_bytes()).into_owned(),
        stderr: String::from_utf8_lossy(&outcome.stderr.into_bytes()).into_owned(),
        truncated,
        wall_clock_ms: usage.wall_time_ms,
        resource_usage: usage,
        status,
        reasons: reason.into_iter().collect(),
        failure,
        attempts: 1,
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn runtime(root: &TempDir, warm_pool: usize) -> SandboxRuntime {
        SandboxRuntime::new(SandboxConfig {
            volume_root: Some(root.path().to_path_buf()),
            warm_pool,
            isolate_network: network_isolation_supported(),
            ..SandboxConfig::default()
        })
        .unwrap()
    }

    fn limits() -> ExecutionLimits {
        ExecutionLimits {
            timeout: Duration::from_secs(5),
            grace: Duration::from_millis(200),
            max_output_bytes: 4096,
        }
    }

    async fn acquire(rt: &SandboxRuntime, owner: &str) -> Sandbox {
        rt.acquire(&AgentId::from(owner), ResourceQuota::default(), NetworkPolicy::deny_all())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_prewarm_and_reuse() {
        let root = TempDir::new().unwrap();
        let rt = runtime(&root, 2);
        assert_eq!(rt.prewarm().await.unwrap(), 2);
        assert_eq!(rt.prewarm().await.unwrap(), 0);

        let sandbox = acquire(&rt, "a").await;
        assert_eq!(sandbox.state(), SandboxState::Ready);
        assert_eq!(rt.stats().reused, 1);
        assert_eq!(rt.stats().live, 1);
        rt.release(sandbox).await;
        assert_eq!(rt.stats().live, 0);
        assert_eq!(rt.stats().provisioned, 2);
    }

    #[tokio::test]
    async fn test_file_write_then_read_back() {
        let root = TempDir::new().unwrap();
        let rt = runtime(&root, 0);
        let mut sandbox = acquire(&rt, "a").await;

        let write = Action::builder("a", ActionKind::FileWrite, "notes/todo.txt")
            .content("ship it\n")
            .build();
        let result = rt
            .run(&mut sandbox, &write, &limits(), CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_success(), "{result:?}");
        assert_eq!(result.sandbox_id, Some(sandbox.id()));
        assert_eq!(result.resource_usage.disk_bytes, 8);

        let delete = Action::new("a", ActionKind::FileDelete, "missing.txt");
        let result = rt
            .run(&mut sandbox, &delete, &limits(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Completed);
        assert_eq!(result.exit_code, Some(1));
        assert!(result.stderr.contains("missing.txt"));
        rt.release(sandbox).await;
    }

    #[tokio::test]
    async fn test_owner_mismatch_is_refused() {
        let root = TempDir::new().unwrap();
        let rt = runtime(&root, 0);
        let mut sandbox = acquire(&rt, "a").await;
        let foreign = Action::new("b", ActionKind::FileWrite, "x.txt");
        let err = rt
            .run(&mut sandbox, &foreign, &limits(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::OwnerMismatch { .. }));
        assert_eq!(sandbox.state(), SandboxState::Ready);
        rt.release(sandbox).await;
    }

    #[tokio::test]
    async fn test_pooled_volume_is_wiped_between_owners() {
        let root = TempDir::new().unwrap();
        let rt = runtime(&root, 1);
        let mut first = acquire(&rt, "a").await;
        let write = Action::builder("a", ActionKind::FileWrite, "secret.txt")
            .content("a's data")
            .build();
        rt.run(&mut first, &write, &limits(), CancellationToken::new())
            .await
            .unwrap();
        let path = first.mount_path().to_path_buf();
        rt.release(first).await;

        let second = acquire(&rt, "b").await;
        assert_eq!(second.mount_path(), path);
        assert!(!path.join("work/secret.txt").exists());
        assert_eq!(rt.stats().reused, 1);
        rt.release(second).await;
    }

    #[tokio::test]
    async fn test_fetch_outside_sandbox_allowlist_is_denied() {
        let root = TempDir::new().unwrap();
        let rt = runtime(&root, 0);
        let mut sandbox = acquire(&rt, "a").await;
        let fetch = Action::new("a", ActionKind::NetworkFetch, "https://example.com/data.json");
        let result = rt
            .run(&mut sandbox, &fetch, &limits(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, ExecutionStatus::Denied);
        assert_eq!(result.failure, Some(FailureKind::PolicyRejection));
        rt.release(sandbox).await;
    }

    #[test]
    fn test_egress_follows_sandbox_policy() {
        let root = TempDir::new().unwrap();
        let mut config = SandboxConfig {
            volume_root: Some(root.path().to_path_buf()),
            isolate_network: false,
            ..SandboxConfig::default()
        };
        let rt = SandboxRuntime::new(config.clone()).unwrap();
        let registry = NetworkPolicy::allow(["pypi.org"]);
        assert!(matches!(rt.egress(&NetworkPolicy::deny_all()), Egress::Host));

        if !network_isolation_supported() {
            config.isolate_network = true;
            assert!(matches!(
                SandboxRuntime::new(config),
                Err(SandboxError::Provisioning(_))
            ));
            return;
        }
        config.isolate_network = true;
        let rt = SandboxRuntime::new(config).unwrap();
        assert!(matches!(rt.egress(&NetworkPolicy::deny_all()), Egress::Blocked));
        match rt.egress(&registry) {
            Egress::Proxied(allowlist) => {
                assert!(allowlist.allows("pypi.org"));
                assert!(!allowlist.allows("evil.test"));
            }
            other => panic!("expected proxied egress, got {other:?}"),
        }
    }

    #[test]
    fn test_fetch_refusal() {
        let policy = NetworkPolicy::allow(["pypi.org", "*.githubusercontent.com"]);
        assert!(fetch_refusal(&policy, "https://pypi.org/simple/").is_none());
        assert!(fetch_refusal(&policy, "https://raw.githubusercontent.com/x").is_none());
        assert!(fetch_refusal(&policy, "https://evil.test/").is_some());
        assert!(fetch_refusal(&policy, "not a url").is_some());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_shell_runs_in_work_dir() {
        let root = TempDir::new().unwrap();
        let rt = runtime(&root, 0);
        let mut sandbox = acquire(&rt, "a").await;
        let shell = Action::new("a", ActionKind::Shell, "pwd");
        let result = rt
            .run(&mut sandbox, &shell, &limits(), CancellationToken::new())
            .await
            .unwrap();
        assert!(result.is_success(), "{result:?}");
        assert!(result.stdout.trim_end().ends_with("/work"), "{}", result.stdout);
        rt.release(sandbox).await;
    }
}
