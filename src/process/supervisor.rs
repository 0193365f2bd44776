use crate::config::{ExecMode, ProcessSpec};
use crate::error::{OverseerError, Result};
use crate::logs::{LogRouter, LogRouterStats, LogWarning};
use crate::process::events::SupervisorEvent;
use crate::process::monitor::{MemorySample, MemorySampler, MemoryTarget, MemoryWatcher, SysinfoSampler};
use crate::process::restart::{ExitCause, RestartDecision, RestartPolicy, RestartTracker};
use crate::process::signal::{parse_signal, signal_group};
use crate::process::spawner::{spawn_process, SpawnedProcess};
use crate::process::watch::{FileWatcher, WatchFilter};
use crate::process::{ExitInfo, InstanceHandle, InstanceStatus, ProcessStatus, StopOutcome};
use nix::sys::signal::Signal;
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime};
use tokio::process::Child;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Supervisor-wide settings
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Directory for log files that are not given an explicit path
    pub log_dir: PathBuf,
    /// Environment profile applied to every launch
    pub profile: Option<String>,
    pub memory_interval: Duration,
    /// How long to wait for a process to be reaped after SIGKILL
    pub kill_wait: Duration,
    /// How long exit handling waits for the pipes to drain after the process is gone
    pub log_flush_timeout: Duration,
    /// File changes closer together than this trigger a single restart
    pub watch_debounce: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            profile: None,
            memory_interval: Duration::from_secs(10),
            kill_wait: Duration::from_secs(5),
            log_flush_timeout: Duration::from_secs(2),
            watch_debounce: Duration::from_secs(1),
        }
    }
}

/// What `reload` did with one name
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadAction {
    Unchanged,
    Started,
    Restarted,
    Removed,
}

#[derive(Debug)]
pub struct ReloadEntry {
    pub name: String,
    pub action: ReloadAction,
    pub result: Result<()>,
}

struct Instance {
    index: usize,
    status: ProcessStatus,
    pid: Option<u32>,
    generation: u64,
    started_at: Option<SystemTime>,
    restarts: usize,
    tracker: RestartTracker,
    last_exit: Option<ExitInfo>,
    memory: Option<u64>,
    log_warnings: usize,
    exit_rx: Option<watch::Receiver<Option<ExitInfo>>>,
}

impl Instance {
    fn new(index: usize) -> Self {
        Self {
            index,
            status: ProcessStatus::Stopped,
            pid: None,
            generation: 0,
            started_at: None,
            restarts: 0,
            tracker: RestartTracker::new(),
            last_exit: None,
            memory: None,
            log_warnings: 0,
            exit_rx: None,
        }
    }

    fn is_current(&self, generation: u64, status: ProcessStatus) -> bool {
        self.generation == generation && self.status == status
    }

    fn mark_exited(&mut self, exit: Option<ExitInfo>, status: ProcessStatus) {
        if exit.is_some() {
            self.last_exit = exit;
        }
        self.status = status;
        self.pid = None;
        self.started_at = None;
        self.memory = None;
        self.exit_rx = None;
    }

    fn handle(&self, name: &str) -> Option<InstanceHandle> {
        self.pid.map(|pid| InstanceHandle {
            name: name.to_string(),
            index: self.index,
            pid,
        })
    }
}

struct AppState {
    spec: Arc<ProcessSpec>,
    profile: Option<String>,
    instances: Vec<Instance>,
    file_watcher: Option<FileWatcher>,
    last_forced_restart: Option<std::time::Instant>,
}

impl AppState {
    fn handles(&self) -> Vec<InstanceHandle> {
        self.instances
            .iter()
            .filter_map(|i| i.handle(&self.spec.name))
            .collect()
    }

    /// Move live instances to `stopping` and return what has to be terminated.
    /// Instances without a process go straight to `stopped`.
    fn begin_stop(&mut self, only: Option<(usize, u64)>) -> Vec<StopTarget> {
        let mut targets = Vec::new();
        for instance in &mut self.instances {
            if let Some((index, generation)) = only {
                if instance.index != index || instance.generation != generation {
                    continue;
                }
            }

            match (instance.status.is_live(), instance.pid, instance.exit_rx.clone()) {
                (true, Some(pid), Some(exit_rx)) => {
                    instance.status = ProcessStatus::Stopping;
                    targets.push(StopTarget {
                        index: instance.index,
                        generation: instance.generation,
                        pid,
                        exit_rx,
                    });
                }
                _ => instance.mark_exited(None, ProcessStatus::Stopped),
            }
        }
        targets
    }

    /// Record the result of `terminate`. Instances that could not be reaped
    /// are marked `errored` and reported as a timeout.
    fn finish_stop(&mut self, targets: &[StopTarget], results: &[Termination]) -> Result<StopOutcome> {
        let mut killed = false;
        let mut unreaped = Vec::new();

        for (target, result) in targets.iter().zip(results) {
            let Some(instance) = self
                .instances
                .iter_mut()
                .find(|i| i.index == target.index && i.generation == target.generation)
            else {
                continue;
            };

            match result {
                Termination::Graceful(exit) => instance.mark_exited(Some(*exit), ProcessStatus::Stopped),
                Termination::Killed(exit) => {
                    killed = true;
                    instance.mark_exited(Some(*exit), ProcessStatus::Stopped);
                }
                Termination::Unreaped => {
                    instance.status = ProcessStatus::Errored;
                    unreaped.push(target.pid);
                }
            }
        }

        if !unreaped.is_empty() {
            return Err(OverseerError::Timeout(
                self.spec.name.clone(),
                format!("PID(s) {:?} still running after SIGKILL", unreaped),
            ));
        }

        Ok(match (targets.is_empty(), killed) {
            (true, _) => StopOutcome::AlreadyStopped,
            (false, true) => StopOutcome::Killed,
            (false, false) => StopOutcome::Graceful,
        })
    }
}

struct AppSlot {
    /// Serializes control operations on this name
    control: Mutex<()>,
    state: std::sync::Mutex<AppState>,
    removed: AtomicBool,
}

impl AppSlot {
    fn new(spec: ProcessSpec, profile: Option<String>) -> Self {
        Self {
            control: Mutex::new(()),
            state: std::sync::Mutex::new(AppState {
                spec: Arc::new(spec),
                profile,
                instances: Vec::new(),
                file_watcher: None,
                last_forced_restart: None,
            }),
            removed: AtomicBool::new(false),
        }
    }

    /// Never held across an await
    fn state(&self) -> MutexGuard<'_, AppState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::Acquire)
    }
}

struct StopTarget {
    index: usize,
    generation: u64,
    pid: u32,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

enum Termination {
    Graceful(ExitInfo),
    Killed(ExitInfo),
    Unreaped,
}

struct Inner {
    settings: SupervisorSettings,
    apps: RwLock<HashMap<String, Arc<AppSlot>>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    log_warnings: mpsc::UnboundedSender<LogWarning>,
    next_generation: AtomicU64,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn memory_targets(&self) -> Vec<MemoryTarget> {
        let Ok(apps) = self.apps.try_read() else {
            return Vec::new();
        };

        let mut targets = Vec::new();
        for slot in apps.values() {
            // An in-flight control operation owns the instances for now
            if slot.control.try_lock().is_err() {
                continue;
            }
            let state = slot.state();
            let ceiling = state.spec.max_memory_restart.map(|m| m.bytes());
            for instance in &state.instances {
                if let (ProcessStatus::Running, Some(pid)) = (instance.status, instance.pid) {
                    targets.push(MemoryTarget {
                        name: state.spec.name.clone(),
                        index: instance.index,
                        generation: instance.generation,
                        pid,
                        ceiling,
                    });
                }
            }
        }
        targets
    }

    fn abort_tasks(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Owns every managed process.
///
/// Cheap to clone; all clones share the same registry. Must be created inside
/// a Tokio runtime.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<Inner>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings) -> Self {
        Self::with_sampler(settings, Arc::new(SysinfoSampler::new()))
    }

    pub fn with_sampler(settings: SupervisorSettings, sampler: Arc<dyn MemorySampler>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (warnings_tx, warnings_rx) = mpsc::unbounded_channel();
        let memory_interval = settings.memory_interval;

        let inner = Arc::new(Inner {
            settings,
            apps: RwLock::new(HashMap::new()),
            events: events_tx.clone(),
            log_warnings: warnings_tx,
            next_generation: AtomicU64::new(1),
            tasks: std::sync::Mutex::new(Vec::new()),
        });

        let event_loop = tokio::spawn(run_event_loop(Arc::downgrade(&inner), events_rx, warnings_rx));

        let weak = Arc::downgrade(&inner);
        let memory_loop = MemoryWatcher::new(memory_interval, sampler).spawn(
            move || weak.upgrade().map(|inner| inner.memory_targets()),
            events_tx,
        );

        inner
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([event_loop, memory_loop]);

        Self { inner }
    }

    pub fn settings(&self) -> &SupervisorSettings {
        &self.inner.settings
    }

    /// Start `spec` with the supervisor's profile
    pub async fn start(&self, spec: ProcessSpec) -> Result<Vec<InstanceHandle>> {
        let profile = self.inner.settings.profile.clone();
        self.start_with_profile(spec, profile).await
    }

    /// Launch every instance of `spec`.
    ///
    /// Starting a name that already has running (or restart-pending) instances
    /// returns their handles without spawning anything.
    pub async fn start_with_profile(
        &self,
        spec: ProcessSpec,
        profile: Option<String>,
    ) -> Result<Vec<InstanceHandle>> {
        spec.validate()?;
        spec.validate_profile(profile.as_deref())?;

        loop {
            let slot = {
                let mut apps = self.inner.apps.write().await;
                apps.entry(spec.name.clone())
                    .or_insert_with(|| Arc::new(AppSlot::new(spec.clone(), profile.clone())))
                    .clone()
            };

            let _control = slot.control.lock().await;
            if slot.is_removed() {
                continue;
            }

            let mut state = slot.state();
            if state.instances.iter().any(|i| i.status.is_active()) {
                debug!("{} is already running, nothing to start", spec.name);
                return Ok(state.handles());
            }

            state.spec = Arc::new(spec);
            state.profile = profile;
            return self.launch_all(&mut state, false);
        }
    }

    /// Start each spec, reporting per name
    pub async fn start_all(&self, specs: Vec<ProcessSpec>) -> Vec<(String, Result<Vec<InstanceHandle>>)> {
        let mut results = Vec::with_capacity(specs.len());
        for spec in specs {
            let name = spec.name.clone();
            let result = self.start(spec).await;
            if let Err(e) = &result {
                error!("Failed to start {}: {}", name, e);
            }
            results.push((name, result));
        }
        results
    }

    /// Stop every instance of `name`; no restart follows
    pub async fn stop(&self, name: &str) -> Result<StopOutcome> {
        let slot = self.slot(name).await?;
        let _control = slot.control.lock().await;
        if slot.is_removed() {
            return Err(OverseerError::ProcessNotFound(name.to_string()));
        }
        self.stop_slot(&slot).await
    }

    /// Stop every managed name concurrently
    pub async fn stop_all(&self) -> Vec<(String, Result<StopOutcome>)> {
        let mut set = JoinSet::new();
        for name in self.names().await {
            let supervisor = self.clone();
            set.spawn(async move {
                let result = supervisor.stop(&name).await;
                (name, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(e) => error!("Stop task failed: {}", e),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Stop then start `name` with its current spec. Each instance's restart
    /// count is kept and incremented.
    pub async fn restart(&self, name: &str) -> Result<Vec<InstanceHandle>> {
        let slot = self.slot(name).await?;
        let _control = slot.control.lock().await;
        if slot.is_removed() {
            return Err(OverseerError::ProcessNotFound(name.to_string()));
        }

        self.stop_slot(&slot).await?;
        let mut state = slot.state();
        info!("Restarting {}", name);
        self.launch_all(&mut state, true)
    }

    /// Stop `name` and forget it
    pub async fn delete(&self, name: &str) -> Result<StopOutcome> {
        let slot = self.slot(name).await?;
        let _control = slot.control.lock().await;
        if slot.is_removed() {
            return Err(OverseerError::ProcessNotFound(name.to_string()));
        }

        let outcome = self.stop_slot(&slot).await?;
        slot.removed.store(true, Ordering::Release);

        let mut apps = self.inner.apps.write().await;
        if apps.get(name).is_some_and(|current| Arc::ptr_eq(current, &slot)) {
            apps.remove(name);
        }
        info!("Deleted {}", name);
        Ok(outcome)
    }

    /// Per-instance snapshot for one name, or for everything when `name` is `None`
    pub async fn status(&self, name: Option<&str>) -> Result<Vec<InstanceStatus>> {
        let slots: Vec<Arc<AppSlot>> = match name {
            Some(name) => vec![self.slot(name).await?],
            None => self.inner.apps.read().await.values().cloned().collect(),
        };

        let mut statuses = Vec::new();
        for slot in slots {
            let state = slot.state();
            let spec = &state.spec;
            for instance in &state.instances {
                let uptime = match (instance.status.is_live(), instance.started_at) {
                    (true, Some(started)) => SystemTime::now().duration_since(started).unwrap_or_default(),
                    _ => Duration::ZERO,
                };
                statuses.push(InstanceStatus {
                    name: spec.name.clone(),
                    index: instance.index,
                    status: instance.status,
                    pid: instance.pid,
                    started_at: instance.started_at,
                    uptime,
                    restarts: instance.restarts,
                    memory: instance.memory,
                    memory_limit: spec.max_memory_restart.map(|m| m.bytes()),
                    last_exit: instance.last_exit,
                    cwd: spec.cwd.clone(),
                    profile: state.profile.clone(),
                    exec_mode: spec.exec_mode,
                    log_warnings: instance.log_warnings,
                });
            }
        }

        statuses.sort_by(|a, b| a.name.cmp(&b.name).then(a.index.cmp(&b.index)));
        Ok(statuses)
    }

    /// Current spec of a managed name
    pub async fn spec(&self, name: &str) -> Result<Arc<ProcessSpec>> {
        let slot = self.slot(name).await?;
        let spec = slot.state().spec.clone();
        Ok(spec)
    }

    /// Sorted names under management
    pub async fn names(&self) -> Vec<String> {
        let apps = self.inner.apps.read().await;
        let names: BTreeSet<&String> = apps.keys().collect();
        names.into_iter().cloned().collect()
    }

    /// Bring the managed set in line with `specs`.
    ///
    /// Names no longer declared are stopped and removed, new names started,
    /// changed names restarted with the new spec. Identical specs are left alone.
    pub async fn reload(&self, specs: Vec<ProcessSpec>) -> Vec<ReloadEntry> {
        let declared: BTreeSet<String> = specs.iter().map(|s| s.name.clone()).collect();
        let mut report = Vec::new();

        for name in self.names().await {
            if !declared.contains(&name) {
                let result = self.delete(&name).await.map(|_| ());
                report.push(ReloadEntry {
                    name,
                    action: ReloadAction::Removed,
                    result,
                });
            }
        }

        for spec in specs {
            let name = spec.name.clone();
            let entry = match self.reload_one(spec).await {
                Ok(action) => ReloadEntry {
                    name,
                    action,
                    result: Ok(()),
                },
                Err((action, e)) => {
                    error!("Reload of {} failed: {}", name, e);
                    ReloadEntry {
                        name,
                        action,
                        result: Err(e),
                    }
                }
            };
            report.push(entry);
        }

        let changed = report
            .iter()
            .filter(|e| e.action != ReloadAction::Unchanged)
            .count();
        info!("Reload finished: {} change(s)", changed);
        report
    }

    async fn reload_one(
        &self,
        spec: ProcessSpec,
    ) -> std::result::Result<ReloadAction, (ReloadAction, OverseerError)> {
        let profile = self.inner.settings.profile.clone();
        let existing = self.inner.apps.read().await.get(&spec.name).cloned();

        let Some(slot) = existing else {
            return self
                .start(spec)
                .await
                .map(|_| ReloadAction::Started)
                .map_err(|e| (ReloadAction::Started, e));
        };

        let validated = spec
            .validate()
            .and_then(|_| spec.validate_profile(profile.as_deref()));
        if let Err(e) = validated {
            return Err((ReloadAction::Restarted, e));
        }

        let control = slot.control.lock().await;
        if slot.is_removed() {
            drop(control);
            return self
                .start(spec)
                .await
                .map(|_| ReloadAction::Started)
                .map_err(|e| (ReloadAction::Started, e));
        }

        {
            let state = slot.state();
            if *state.spec == spec && state.profile == profile {
                return Ok(ReloadAction::Unchanged);
            }
        }

        info!("Spec of {} changed, restarting", spec.name);
        self.stop_slot(&slot)
            .await
            .map_err(|e| (ReloadAction::Restarted, e))?;

        let mut state = slot.state();
        if state.spec.instances > spec.instances {
            state.instances.truncate(spec.instances);
        }
        state.spec = Arc::new(spec);
        state.profile = profile;
        self.launch_all(&mut state, true)
            .map(|_| ReloadAction::Restarted)
            .map_err(|e| (ReloadAction::Restarted, e))
    }

    /// Stop everything and end the background tasks
    pub async fn shutdown(&self) -> Vec<(String, Result<StopOutcome>)> {
        info!("Shutting down supervisor");
        let results = self.stop_all().await;
        self.inner.abort_tasks();
        results
    }

    async fn slot(&self, name: &str) -> Result<Arc<AppSlot>> {
        self.inner
            .apps
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| OverseerError::ProcessNotFound(name.to_string()))
    }

    /// Launch every instance that is not already active. Returns the first
    /// launch error after attempting all instances.
    fn launch_all(&self, state: &mut AppState, as_restart: bool) -> Result<Vec<InstanceHandle>> {
        let spec = state.spec.clone();
        let profile = state.profile.clone();

        if spec.exec_mode == ExecMode::Cluster {
            warn!(
                "{}: cluster mode is not supported, running {} instance(s) in fork mode",
                spec.name, spec.instances
            );
        }

        while state.instances.len() < spec.instances {
            let index = state.instances.len();
            state.instances.push(Instance::new(index));
        }

        let mut handles = Vec::with_capacity(spec.instances);
        let mut first_error = None;
        for instance in &mut state.instances {
            if instance.status.is_active() {
                handles.extend(instance.handle(&spec.name));
                continue;
            }
            if as_restart {
                instance.restarts += 1;
            }
            match self.launch(&spec, profile.as_deref(), instance) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if spec.watch && state.file_watcher.is_none() {
            state.file_watcher = self.start_file_watcher(&spec);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(handles),
        }
    }

    fn start_file_watcher(&self, spec: &ProcessSpec) -> Option<FileWatcher> {
        let log_dir = &self.inner.settings.log_dir;
        let log_files = (0..spec.instances)
            .flat_map(|index| {
                let paths = spec.log_paths(log_dir, index);
                [Some(paths.out), Some(paths.err), paths.combined]
            })
            .flatten()
            .collect();
        let filter = WatchFilter::new(&spec.cwd, &spec.ignore_watch, log_files);

        match FileWatcher::start(&spec.name, filter, self.inner.events.clone()) {
            Ok(watcher) => {
                info!("Watching {} for changes to {}", spec.cwd.display(), spec.name);
                Some(watcher)
            }
            Err(e) => {
                warn!("Cannot watch files for {}: {}", spec.name, e);
                None
            }
        }
    }

    /// Spawn one OS process for `instance`, wiring its log router and exit waiter
    fn launch(
        &self,
        spec: &ProcessSpec,
        profile: Option<&str>,
        instance: &mut Instance,
    ) -> Result<InstanceHandle> {
        instance.status = ProcessStatus::Starting;

        let spawned = spec
            .environment(profile)
            .and_then(|env| spawn_process(spec, &env));
        let SpawnedProcess { mut child, pid, .. } = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("Failed to launch {}[{}]: {}", spec.name, instance.index, e);
                instance.mark_exited(None, ProcessStatus::Stopped);
                return Err(e);
            }
        };

        let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
        let paths = spec.log_paths(&self.inner.settings.log_dir, instance.index);
        let router = LogRouter::new(&spec.name, instance.index, &paths, &spec.log_options())
            .with_warnings(self.inner.log_warnings.clone());
        let logs = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => Some(router.attach(stdout, stderr)),
            _ => None,
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(wait_for_exit(
            child,
            logs,
            exit_tx,
            self.inner.events.clone(),
            ExitTag {
                name: spec.name.clone(),
                index: instance.index,
                generation,
            },
            self.inner.settings.log_flush_timeout,
        ));

        instance.status = ProcessStatus::Running;
        instance.pid = Some(pid);
        instance.generation = generation;
        instance.started_at = Some(SystemTime::now());
        instance.memory = None;
        instance.exit_rx = Some(exit_rx);

        info!("Started {}[{}] (PID: {})", spec.name, instance.index, pid);
        Ok(InstanceHandle {
            name: spec.name.clone(),
            index: instance.index,
            pid,
        })
    }

    /// Terminate every live instance of `slot`. Caller holds the control lock.
    async fn stop_slot(&self, slot: &AppSlot) -> Result<StopOutcome> {
        let (spec, targets) = {
            let mut state = slot.state();
            state.file_watcher = None;
            let targets = state.begin_stop(None);
            (state.spec.clone(), targets)
        };

        if targets.is_empty() {
            return Ok(StopOutcome::AlreadyStopped);
        }

        info!("Stopping {} ({} instance(s))", spec.name, targets.len());
        let results = self.terminate(&spec, &targets).await;
        let outcome = slot.state().finish_stop(&targets, &results);

        match &outcome {
            Ok(StopOutcome::Killed) => warn!("{} stopped after SIGKILL escalation", spec.name),
            Ok(_) => info!("{} stopped", spec.name),
            Err(e) => error!("{}", e),
        }
        outcome
    }

    /// Send the stop signal, wait out the grace period, then SIGKILL stragglers
    async fn terminate(&self, spec: &ProcessSpec, targets: &[StopTarget]) -> Vec<Termination> {
        let stop_signal = parse_signal(&spec.stop_signal).unwrap_or(Signal::SIGTERM);
        for target in targets {
            if let Err(e) = signal_group(target.pid, stop_signal) {
                warn!("{}[{}]: {}", spec.name, target.index, e);
            }
        }

        let deadline = Instant::now() + spec.kill_timeout();
        let mut results = Vec::with_capacity(targets.len());
        for target in targets {
            let mut exit_rx = target.exit_rx.clone();
            if let Some(exit) = exit_by(&mut exit_rx, deadline).await {
                results.push(Termination::Graceful(exit));
                continue;
            }

            warn!(
                "{}[{}] (PID: {}) did not exit within {:?}, sending SIGKILL",
                spec.name,
                target.index,
                target.pid,
                spec.kill_timeout()
            );
            if let Err(e) = signal_group(target.pid, Signal::SIGKILL) {
                warn!("{}[{}]: {}", spec.name, target.index, e);
            }

            let kill_deadline = Instant::now() + self.inner.settings.kill_wait;
            results.push(match exit_by(&mut exit_rx, kill_deadline).await {
                Some(exit) => Termination::Killed(exit),
                None => Termination::Unreaped,
            });
        }
        results
    }

    fn dispatch(&self, event: SupervisorEvent) {
        let supervisor = self.clone();
        match event {
            SupervisorEvent::Exited {
                name,
                index,
                generation,
                exit,
            } => {
                tokio::spawn(async move { supervisor.handle_exit(name, index, generation, exit).await });
            }
            SupervisorEvent::Memory(sample) => {
                tokio::spawn(async move { supervisor.handle_memory_sample(sample).await });
            }
            SupervisorEvent::FileChanged { name, path } => {
                tokio::spawn(async move { supervisor.handle_file_change(name, path).await });
            }
        }
    }

    async fn handle_exit(&self, name: String, index: usize, generation: u64, exit: ExitInfo) {
        let Ok(slot) = self.slot(&name).await else {
            return;
        };

        let (decision, leader) = {
            let mut state = slot.state();
            let policy = RestartPolicy::from_spec(&state.spec);
            let Some(instance) = state.instances.get_mut(index) else {
                return;
            };
            // Exits during stop or a forced restart belong to that operation
            if !instance.is_current(generation, ProcessStatus::Running) {
                return;
            }

            let leader = instance.pid;
            instance.mark_exited(Some(exit), exit.status());
            let decision = policy.evaluate(&ExitCause::Exited(exit), &instance.tracker);
            instance.status = match decision {
                RestartDecision::Stop => ProcessStatus::Stopped,
                RestartDecision::GiveUp => ProcessStatus::Errored,
                RestartDecision::Restart { .. } => ProcessStatus::RestartPending,
            };
            (decision, leader)
        };

        match decision {
            RestartDecision::Stop => info!("{}[{}] exited with {}", name, index, exit),
            RestartDecision::GiveUp => error!(
                "{}; restarted too often, giving up",
                OverseerError::RuntimeExit(format!("{}[{}]", name, index), exit.to_string())
            ),
            RestartDecision::Restart { delay } => {
                warn!(
                    "{}[{}] exited with {}, restarting in {:?}",
                    name, index, exit, delay
                );
                // Children left in the old group would compete with the relaunch
                if let Some(pid) = leader {
                    if let Err(e) = signal_group(pid, Signal::SIGKILL) {
                        debug!("{}[{}] leftover group {}: {}", name, index, pid, e);
                    }
                }
                tokio::time::sleep(delay).await;
                self.relaunch_pending(&slot, index, generation);
            }
        }
    }

    /// Relaunch after the backoff unless something else took over the instance
    fn relaunch_pending(&self, slot: &AppSlot, index: usize, generation: u64) {
        let mut state = slot.state();
        let spec = state.spec.clone();
        let profile = state.profile.clone();
        let Some(instance) = state.instances.get_mut(index) else {
            return;
        };
        if !instance.is_current(generation, ProcessStatus::RestartPending) {
            debug!("{}[{}] restart superseded", spec.name, index);
            return;
        }

        instance.restarts += 1;
        instance.tracker.record_restart();
        instance.tracker.prune_old_restarts(RestartPolicy::from_spec(&spec).time_window);
        let _ = self.launch(&spec, profile.as_deref(), instance);
    }

    async fn handle_memory_sample(&self, sample: MemorySample) {
        let Ok(slot) = self.slot(&sample.name).await else {
            return;
        };

        {
            let mut state = slot.state();
            let Some(instance) = state.instances.get_mut(sample.index) else {
                return;
            };
            if !instance.is_current(sample.generation, ProcessStatus::Running) {
                return;
            }
            instance.memory = Some(sample.bytes);
        }

        if sample.exceeds_ceiling() {
            warn!(
                "{}[{}] uses {} bytes, ceiling is {:?}; restarting",
                sample.name, sample.index, sample.bytes, sample.ceiling
            );
            self.forced_restart(&slot, sample.index, sample.generation, ExitCause::MemoryCeiling)
                .await;
        }
    }

    async fn handle_file_change(&self, name: String, path: PathBuf) {
        let Ok(slot) = self.slot(&name).await else {
            return;
        };

        let generations: Vec<(usize, u64)> = {
            let mut state = slot.state();
            let debounce = self.inner.settings.watch_debounce;
            if state
                .last_forced_restart
                .is_some_and(|at| at.elapsed() < debounce)
            {
                return;
            }
            state.last_forced_restart = Some(std::time::Instant::now());
            state
                .instances
                .iter()
                .filter(|i| i.status == ProcessStatus::Running)
                .map(|i| (i.index, i.generation))
                .collect()
        };

        if generations.is_empty() {
            return;
        }
        info!("{} changed, restarting {}", path.display(), name);
        for (index, generation) in generations {
            self.forced_restart(&slot, index, generation, ExitCause::FileChange)
                .await;
        }
    }

    /// Stop one instance and relaunch it per the restart policy, without backoff.
    /// Skipped when a control operation already owns the name.
    async fn forced_restart(&self, slot: &AppSlot, index: usize, generation: u64, cause: ExitCause) {
        let Ok(_control) = slot.control.try_lock() else {
            debug!("Instance {} busy, skipping forced restart", index);
            return;
        };
        if slot.is_removed() {
            return;
        }

        let (spec, targets) = {
            let mut state = slot.state();
            let running = state
                .instances
                .get(index)
                .is_some_and(|i| i.is_current(generation, ProcessStatus::Running));
            if !running {
                return;
            }
            let targets = state.begin_stop(Some((index, generation)));
            (state.spec.clone(), targets)
        };

        let results = self.terminate(&spec, &targets).await;

        let mut state = slot.state();
        let profile = state.profile.clone();
        let exit = match results.first() {
            Some(Termination::Graceful(exit)) | Some(Termination::Killed(exit)) => Some(*exit),
            Some(Termination::Unreaped) | None => None,
        };
        let Some(instance) = state.instances.get_mut(index) else {
            return;
        };
        if instance.generation != generation {
            return;
        }
        let Some(exit) = exit else {
            error!("{}[{}] could not be killed for restart", spec.name, index);
            instance.status = ProcessStatus::Errored;
            return;
        };

        instance.mark_exited(Some(exit), exit.status());
        match RestartPolicy::from_spec(&spec).evaluate(&cause, &instance.tracker) {
            RestartDecision::Restart { .. } => {
                instance.restarts += 1;
                let _ = self.launch(&spec, profile.as_deref(), instance);
            }
            RestartDecision::Stop | RestartDecision::GiveUp => {
                instance.status = ProcessStatus::Stopped;
            }
        }
    }

    fn record_log_warning(&self, warning: LogWarning) {
        debug!(
            "Counting log warning for {}[{}] on {}",
            warning.process,
            warning.instance,
            warning.destination.display()
        );

        let Ok(apps) = self.inner.apps.try_read() else {
            return;
        };
        if let Some(slot) = apps.get(&warning.process) {
            if let Some(instance) = slot.state().instances.get_mut(warning.instance) {
                instance.log_warnings += 1;
            }
        }
    }
}

struct ExitTag {
    name: String,
    index: usize,
    generation: u64,
}

/// Owns the child: reap it, let the log router drain, then publish the exit
async fn wait_for_exit(
    mut child: Child,
    logs: Option<JoinHandle<LogRouterStats>>,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    events: mpsc::UnboundedSender<SupervisorEvent>,
    tag: ExitTag,
    flush_timeout: Duration,
) {
    let exit = match child.wait().await {
        Ok(status) => ExitInfo::from_status(status),
        Err(e) => {
            warn!("Failed to wait for {}[{}]: {}", tag.name, tag.index, e);
            ExitInfo::default()
        }
    };

    if let Some(logs) = logs {
        match tokio::time::timeout(flush_timeout, logs).await {
            Ok(Ok(stats)) => debug!(
                "{}[{}] log streams closed: {} line(s), {} dropped",
                tag.name, tag.index, stats.lines, stats.dropped
            ),
            Ok(Err(e)) => warn!("Log router for {}[{}] failed: {}", tag.name, tag.index, e),
            Err(_) => warn!(
                "{}[{}] exited but its output pipes are still open",
                tag.name, tag.index
            ),
        }
    }

    let _ = exit_tx.send(Some(exit));
    let _ = events.send(SupervisorEvent::Exited {
        name: tag.name,
        index: tag.index,
        generation: tag.generation,
        exit,
    });
}

/// The exit published on `exit_rx`, or `None` if `deadline` passes first
async fn exit_by(exit_rx: &mut watch::Receiver<Option<ExitInfo>>, deadline: Instant) -> Option<ExitInfo> {
    match tokio::time::timeout_at(deadline, exit_rx.wait_for(Option::is_some)).await {
        Ok(Ok(exit)) => *exit,
        // Waiter gone without publishing: the process is no longer ours to wait for
        Ok(Err(_)) => Some(ExitInfo::default()),
        Err(_) => None,
    }
}

async fn run_event_loop(
    inner: Weak<Inner>,
    mut events: mpsc::UnboundedReceiver<SupervisorEvent>,
    mut warnings: mpsc::UnboundedReceiver<LogWarning>,
) {
    loop {
        tokio::select! {
            Some(event) = events.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                Supervisor { inner }.dispatch(event);
            }
            Some(warning) = warnings.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                Supervisor { inner }.record_log_warning(warning);
            }
            else => break,
        }
    }
    debug!("Supervisor event loop finished");
}
