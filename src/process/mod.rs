//! Shared backend process pool
//!
//! Many logical clients (agent sessions, named backends) often ask for the
//! exact same server launch. Instead of N clients × 1 process each, every
//! identical `(command, args, env)` maps to one OS process that is
//! reference counted and killed when the last reference goes away.
//!
//! All registry access goes through one lock, and the lock is held across
//! the spawn, so two concurrent requests for the same fingerprint can never
//! start two processes.

mod channel;
mod fingerprint;

pub use channel::ProcessChannel;
pub use fingerprint::fingerprint;

use crate::{logging, platform};
use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

struct SharedProcess {
    /// Distinguishes a respawned process from an evicted one with the
    /// same fingerprint, so stale handles cannot release the new one
    instance: u64,
    pid: u32,
    command: String,
    child: Child,
    channel: Arc<ProcessChannel>,
    refcount: usize,
    names: BTreeMap<String, usize>,
}

impl SharedProcess {
    fn is_alive(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(None) => true,
            Ok(Some(_)) => false,
            Err(_) => platform::is_process_running(self.pid),
        }
    }
}

#[derive(Default)]
struct Registry {
    processes: HashMap<String, SharedProcess>,
    next_instance: u64,
}

/// Per-process introspection record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub fingerprint: String,
    pub pid: u32,
    pub command: String,
    pub refcount: usize,
    pub referencing_names: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStats {
    pub total_processes: usize,
    pub processes: Vec<ProcessInfo>,
}

/// Deduplicating, reference-counted owner of backend processes.
///
/// Cloning is cheap and every clone shares the same registry.
#[derive(Clone, Default)]
pub struct ProcessManager {
    registry: Arc<Mutex<Registry>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return a handle to the live process for this launch configuration,
    /// spawning it if none exists. Each call adds one reference.
    pub async fn get_or_create(
        &self,
        logical_name: &str,
        command: &str,
        args: &[String],
        env: &HashMap<String, String>,
    ) -> Result<ProcessHandle> {
        let fp = fingerprint(command, args, env);
        let mut registry = self.registry.lock().await;

        if let Some(entry) = registry.processes.get_mut(&fp) {
            if entry.is_alive() {
                entry.refcount += 1;
                *entry.names.entry(logical_name.to_string()).or_insert(0) += 1;
                logging::info(&format!(
                    "Process pool: '{}' attached to pid {} (refs={})",
                    logical_name, entry.pid, entry.refcount
                ));
                return Ok(self.handle_for(&fp, logical_name, entry));
            }

            logging::warn(&format!(
                "Process pool: pid {} ({}) exited unexpectedly, evicting",
                entry.pid, entry.command
            ));
            registry.processes.remove(&fp);
        }

        let mut child = Command::new(command)
            .args(args)
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn backend process: {}", command))?;

        let pid = child
            .id()
            .with_context(|| format!("Backend process exited immediately: {}", command))?;
        let stdin = child.stdin.take().context("No stdin")?;
        let stdout = child.stdout.take().context("No stdout")?;
        let channel = Arc::new(ProcessChannel::spawn(
            logical_name,
            BufReader::new(stdout),
            stdin,
        ));

        registry.next_instance += 1;
        let mut names = BTreeMap::new();
        names.insert(logical_name.to_string(), 1);
        let entry = SharedProcess {
            instance: registry.next_instance,
            pid,
            command: command.to_string(),
            child,
            channel,
            refcount: 1,
            names,
        };
        let handle = self.handle_for(&fp, logical_name, &entry);
        registry.processes.insert(fp, entry);

        logging::info(&format!(
            "Process pool: spawned '{}' for '{}' (pid {})",
            command, logical_name, pid
        ));
        Ok(handle)
    }

    fn handle_for(&self, fp: &str, logical_name: &str, entry: &SharedProcess) -> ProcessHandle {
        ProcessHandle {
            fingerprint: fp.to_string(),
            instance: entry.instance,
            pid: entry.pid,
            logical_name: logical_name.to_string(),
            channel: Arc::clone(&entry.channel),
            manager: self.clone(),
            disposed: AtomicBool::new(false),
        }
    }

    /// Drop one reference; kill and forget the process at zero
    async fn release(&self, fp: &str, instance: u64, logical_name: &str) {
        let removed = {
            let mut registry = self.registry.lock().await;
            let Some(entry) = registry.processes.get_mut(fp) else {
                return;
            };
            if entry.instance != instance {
                return;
            }

            entry.refcount = entry.refcount.saturating_sub(1);
            if let Some(count) = entry.names.get_mut(logical_name) {
                *count -= 1;
                if *count == 0 {
                    entry.names.remove(logical_name);
                }
            }

            if entry.refcount > 0 {
                logging::info(&format!(
                    "Process pool: '{}' released pid {} (refs={})",
                    logical_name, entry.pid, entry.refcount
                ));
                return;
            }
            registry.processes.remove(fp)
        };

        if let Some(mut entry) = removed {
            logging::info(&format!(
                "Process pool: last reference gone, stopping pid {} ({})",
                entry.pid, entry.command
            ));
            let _ = entry.child.kill().await;
        }
    }

    async fn probe(&self, fp: &str, instance: u64) -> bool {
        let mut registry = self.registry.lock().await;
        match registry.processes.get_mut(fp) {
            Some(entry) if entry.instance == instance => entry.is_alive(),
            _ => false,
        }
    }

    /// Snapshot of every tracked process, ordered by fingerprint
    pub async fn stats(&self) -> ProcessStats {
        let registry = self.registry.lock().await;
        let mut processes: Vec<ProcessInfo> = registry
            .processes
            .iter()
            .map(|(fp, entry)| ProcessInfo {
                fingerprint: fp.clone(),
                pid: entry.pid,
                command: entry.command.clone(),
                refcount: entry.refcount,
                referencing_names: entry.names.keys().cloned().collect(),
            })
            .collect();
        processes.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));

        ProcessStats {
            total_processes: processes.len(),
            processes,
        }
    }

    /// Evict every process that has exited. Returns how many were removed.
    pub async fn prune_dead(&self) -> usize {
        let mut registry = self.registry.lock().await;
        let before = registry.processes.len();
        registry.processes.retain(|_, entry| {
            let alive = entry.is_alive();
            if !alive {
                logging::warn(&format!(
                    "Process pool: pid {} ({}) is gone, evicting",
                    entry.pid, entry.command
                ));
            }
            alive
        });
        before - registry.processes.len()
    }

    /// Kill every tracked process regardless of references. Outstanding
    /// handles become inert: disposing them later does nothing.
    pub async fn shutdown_all(&self) -> usize {
        let drained: Vec<SharedProcess> = {
            let mut registry = self.registry.lock().await;
            registry.processes.drain().map(|(_, entry)| entry).collect()
        };

        let count = drained.len();
        for mut entry in drained {
            let _ = entry.child.kill().await;
        }
        if count > 0 {
            logging::info(&format!("Process pool: stopped {} process(es)", count));
        }
        count
    }
}

/// One reference to a shared backend process.
///
/// Handles compare and order by fingerprint. Dropping a handle without
/// disposing it releases the reference in the background.
pub struct ProcessHandle {
    fingerprint: String,
    instance: u64,
    pid: u32,
    logical_name: String,
    channel: Arc<ProcessChannel>,
    manager: ProcessManager,
    disposed: AtomicBool,
}

impl ProcessHandle {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn logical_name(&self) -> &str {
        &self.logical_name
    }

    pub fn channel(&self) -> &Arc<ProcessChannel> {
        &self.channel
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Liveness probe. Exited processes are reaped by the probe itself.
    pub async fn is_alive(&self) -> bool {
        !self.is_disposed() && self.manager.probe(&self.fingerprint, self.instance).await
    }

    pub async fn request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        if self.is_disposed() {
            anyhow::bail!("Handle for '{}' is disposed", self.logical_name);
        }
        self.channel.request(method, params, timeout).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.channel.notify(method, params).await
    }

    /// Release this reference. Calling it again is a no-op.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.manager
            .release(&self.fingerprint, self.instance, &self.logical_name)
            .await;
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let manager = self.manager.clone();
            let fp = std::mem::take(&mut self.fingerprint);
            let name = std::mem::take(&mut self.logical_name);
            let instance = self.instance;
            runtime.spawn(async move {
                manager.release(&fp, instance, &name).await;
            });
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("fingerprint", &self.fingerprint)
            .field("pid", &self.pid)
            .field("logical_name", &self.logical_name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

impl PartialEq for ProcessHandle {
    fn eq(&self, other: &Self) -> bool {
        self.fingerprint == other.fingerprint
    }
}

impl Eq for ProcessHandle {}

impl Hash for ProcessHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.fingerprint.hash(state);
    }
}

impl PartialOrd for ProcessHandle {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ProcessHandle {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.fingerprint.cmp(&other.fingerprint)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::platform::is_process_running;


    fn argv(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    async fn sleeper(pm: &ProcessManager, name: &str) -> ProcessHandle {
        pm.get_or_create(name, "sleep", &argv(&["30"]), &HashMap::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_identical_configs_share_one_process() {
        let pm = ProcessManager::new();
        let a = sleeper(&pm, "memory").await;
        let b = sleeper(&pm, "memory-copy").await;

        assert_eq!(a, b);
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.pid(), b.pid());

        let stats = pm.stats().await;
        assert_eq!(stats.total_processes, 1);
        assert_eq!(stats.processes[0].refcount, 2);
        assert_eq!(stats.processes[0].command, "sleep");
        assert_eq!(
            stats.processes[0].referencing_names,
            vec!["memory".to_string(), "memory-copy".to_string()]
        );

        let pid = a.pid();
        a.dispose().await;
        assert!(is_process_running(pid));
        assert_eq!(pm.stats().await.processes[0].referencing_names, vec!["memory-copy"]);

        b.dispose().await;
        assert_eq!(pm.stats().await.total_processes, 0);
        assert!(!is_process_running(pid));
    }

    #[tokio::test]
    async fn test_env_order_shares_process() {
        let pm = ProcessManager::new();
        let mut env_a = HashMap::new();
        env_a.insert("A".to_string(), "1".to_string());
        env_a.insert("B".to_string(), "2".to_string());
        let mut env_b = HashMap::new();
        env_b.insert("B".to_string(), "2".to_string());
        env_b.insert("A".to_string(), "1".to_string());

        let a = pm.get_or_create("x", "sleep", &argv(&["30"]), &env_a).await.unwrap();
        let b = pm.get_or_create("y", "sleep", &argv(&["30"]), &env_b).await.unwrap();
        assert_eq!(a.pid(), b.pid());

        let c = pm.get_or_create("z", "sleep", &argv(&["31"]), &env_a).await.unwrap();
        assert_ne!(a.pid(), c.pid());
        assert_eq!(pm.stats().await.total_processes, 2);

        pm.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_double_dispose_is_noop() {
        let pm = ProcessManager::new();
        let a = sleeper(&pm, "a").await;
        let b = sleeper(&pm, "b").await;

        a.dispose().await;
        a.dispose().await;
        assert!(a.is_disposed());

        let stats = pm.stats().await;
        assert_eq!(stats.total_processes, 1);
        assert_eq!(stats.processes[0].refcount, 1);

        b.dispose().await;
        b.dispose().await;
        assert_eq!(pm.stats().await.total_processes, 0);
    }

    #[tokio::test]
    async fn test_dead_process_is_evicted_on_lookup() {
        let pm = ProcessManager::new();
        let first = pm
            .get_or_create("flaky", "sh", &argv(&["-c", "exit 0"]), &HashMap::new())
            .await
            .unwrap();

        let mut waited = 0;
        while first.is_alive().await && waited < 50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += 1;
        }
        assert!(!first.is_alive().await);

        let second = pm
            .get_or_create("flaky", "sh", &argv(&["-c", "exit 0"]), &HashMap::new())
            .await
            .unwrap();
        assert_ne!(first.pid(), second.pid());
        assert_eq!(pm.stats().await.processes[0].refcount, 1);

        // The stale handle must not release the replacement
        first.dispose().await;
        let stats = pm.stats().await;
        assert_eq!(stats.total_processes, 1);
        assert_eq!(stats.processes[0].pid, second.pid());

        second.dispose().await;
    }

    #[tokio::test]
    async fn test_prune_dead() {
        let pm = ProcessManager::new();
        let handle = pm
            .get_or_create("short", "sh", &argv(&["-c", "exit 3"]), &HashMap::new())
            .await
            .unwrap();
        let _keep = sleeper(&pm, "long").await;

        let mut pruned = 0;
        for _ in 0..50 {
            pruned += pm.prune_dead().await;
            if pruned > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(pruned, 1);
        assert_eq!(pm.stats().await.total_processes, 1);
        handle.dispose().await;
        pm.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_spawn_failure_is_an_error() {
        let pm = ProcessManager::new();
        let err = pm
            .get_or_create("ghost", "/nonexistent/mcp-server", &[], &HashMap::new())
            .await
            .unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to spawn"));
        assert_eq!(pm.stats().await.total_processes, 0);
    }

    #[tokio::test]
    async fn test_shutdown_all_bypasses_refcounts() {
        let pm = ProcessManager::new();
        let a = sleeper(&pm, "a").await;
        let _b = sleeper(&pm, "b").await;
        let pid = a.pid();

        assert_eq!(pm.shutdown_all().await, 1);
        assert_eq!(pm.stats().await.total_processes, 0);
        assert!(!is_process_running(pid));

        a.dispose().await;
        assert_eq!(pm.stats().await.total_processes, 0);
    }

    #[tokio::test]
    async fn test_concurrent_requests_spawn_once() {
        let pm = ProcessManager::new();
        let mut tasks = Vec::new();
        for i in 0..8 {
            let pm = pm.clone();
            tasks.push(tokio::spawn(async move {
                pm.get_or_create(&format!("agent-{}", i), "sleep", &argv(&["30"]), &HashMap::new())
                    .await
                    .unwrap()
            }));
        }
        let mut handles = Vec::new();
        for task in tasks {
            handles.push(task.await.unwrap());
        }

        let stats = pm.stats().await;
        assert_eq!(stats.total_processes, 1);
        assert_eq!(stats.processes[0].refcount, 8);
        assert!(handles.iter().all(|h| h.pid() == handles[0].pid()));

        for handle in &handles {
            handle.dispose().await;
        }
        assert_eq!(pm.stats().await.total_processes, 0);
    }

    #[tokio::test]
    async fn test_handles_sort_by_fingerprint() {
        let pm = ProcessManager::new();
        let mut handles = vec![
            pm.get_or_create("a", "sleep", &argv(&["30"]), &HashMap::new()).await.unwrap(),
            pm.get_or_create("b", "sleep", &argv(&["31"]), &HashMap::new()).await.unwrap(),
            pm.get_or_create("c", "sleep", &argv(&["32"]), &HashMap::new()).await.unwrap(),
        ];
        handles.sort();
        let fps: Vec<&str> = handles.iter().map(|h| h.fingerprint()).collect();
        let mut sorted = fps.clone();
        sorted.sort();
        assert_eq!(fps, sorted);

        let listed: Vec<String> = pm.stats().await.processes.into_iter().map(|p| p.fingerprint).collect();
        assert_eq!(listed, sorted);
        pm.shutdown_all().await;
    }

    #[tokio::test]
    async fn test_drop_releases_reference() {
        let pm = ProcessManager::new();
        let keep = sleeper(&pm, "keep").await;
        {
            let _temp = sleeper(&pm, "temp").await;
            assert_eq!(pm.stats().await.processes[0].refcount, 2);
        }
        for _ in 0..50 {
            if pm.stats().await.processes[0].refcount == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(pm.stats().await.processes[0].refcount, 1);
        keep.dispose().await;
    }
}
