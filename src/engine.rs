use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{oneshot, watch, Mutex, MutexGuard, Notify, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::EngineConfig;
use crate::error::{MapError, Result};
use crate::map::{Map, MapShared};
use crate::mapping::{MapOptions, MappedCommand};
use crate::scheduler::{
    Assignment, Component, ComponentHold, ComponentKey, ComponentQueue, ComponentStatus,
    JobAction, MapEntry, MapId, MapTemplate, ProcessEffect, ResourceRequest, SlotAssigner,
};
use crate::storage::{remove_file_if_exists, Layout, MapSubmission, RawError, StoredOutcome};
use crate::tags;
use crate::worker::{ComponentExecutor, LaunchSpec, Outcome, ProcessHandle, ProcessSignal};

/// A component process registered so actions can signal it.
#[derive(Debug)]
struct RunningEntry {
    attempt: u32,
    handle: ProcessHandle,
    kill_tx: Option<oneshot::Sender<()>>,
}

/// Maps known to this engine, by tag and by id.
#[derive(Debug, Default)]
struct Registry {
    by_tag: HashMap<String, Arc<MapShared>>,
    by_id: HashMap<MapId, Arc<MapShared>>,
}

/// Local scheduler that owns every map's components and runs them on execution slots.
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) layout: Layout,
    pub(crate) queue: Arc<RwLock<ComponentQueue>>,
    pub(crate) assigner: Arc<RwLock<SlotAssigner>>,
    executor: ComponentExecutor,
    registry: RwLock<Registry>,
    /// Held while tag files are checked and created, renamed or read
    tags_lock: Mutex<()>,
    running: Mutex<HashMap<ComponentKey, RunningEntry>>,
    status_tx: watch::Sender<u64>,
    wakeup: Notify,
    shutdown: CancellationToken,
}

impl Engine {
    /// Create the directory layout and start the scheduler loop.
    pub async fn start(config: EngineConfig) -> Result<Arc<Self>> {
        let layout = Layout::new(&config.root_dir);
        layout.ensure().await?;

        let (status_tx, _) = watch::channel(0);
        let engine = Arc::new(Self {
            executor: ComponentExecutor::new(config.execution, config.sandbox.clone()),
            queue: Arc::new(RwLock::new(ComponentQueue::with_capacity(
                config.max_components,
            ))),
            assigner: Arc::new(RwLock::new(SlotAssigner::new(
                config.slots,
                config.memory_mb,
            ))),
            layout,
            config,
            registry: RwLock::new(Registry::default()),
            tags_lock: Mutex::new(()),
            running: Mutex::new(HashMap::new()),
            status_tx,
            wakeup: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        tracing::info!(
            root = %engine.layout.root().display(),
            slots = engine.config.slots,
            memory_mb = engine.config.memory_mb,
            execution = ?engine.config.execution,
            "Starting jobmap engine"
        );

        let scheduler = engine.clone();
        tokio::spawn(async move {
            scheduler.scheduler_loop().await;
        });

        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Receiver that changes every time any component changes status.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.status_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// A command that can be mapped over inputs on this engine, with default options.
    pub fn mapped(self: &Arc<Self>, command: impl Into<String>) -> MappedCommand {
        MappedCommand::new(self.clone(), command, MapOptions::default())
    }

    pub fn mapped_with(
        self: &Arc<Self>,
        command: impl Into<String>,
        options: MapOptions,
    ) -> MappedCommand {
        MappedCommand::new(self.clone(), command, options)
    }

    pub(crate) async fn lock_tags(&self) -> MutexGuard<'_, ()> {
        self.tags_lock.lock().await
    }

    fn notify_changed(&self) {
        self.status_tx.send_modify(|version| *version += 1);
    }

    /// Write a new map to disk and queue its components.
    pub(crate) async fn submit(
        self: &Arc<Self>,
        tag: Option<&str>,
        command: String,
        options: MapOptions,
        args: Vec<Vec<String>>,
    ) -> Result<Map> {
        if self.is_stopped() {
            return Err(MapError::EngineStopped);
        }
        if args.is_empty() {
            return Err(MapError::EmptyMap);
        }

        let tags_dir = self.layout.tags_dir();
        let (mut tag, transient) = match tag {
            Some(tag) => {
                tags::raise_if_tag_is_invalid(tag)?;
                tags::raise_if_tag_already_exists(&tags_dir, tag)?;
                (tag.to_string(), false)
            }
            None => (tags::random_tag(&tags_dir), true),
        };
        {
            let queue = self.queue.read().await;
            if queue.len() + args.len() > self.config.max_components {
                return Err(MapError::QueueFull);
            }
        }

        let id = MapId::new();
        let dir = self.layout.map_dir(&id);
        let mut submission = MapSubmission {
            tag: tag.clone(),
            command: command.clone(),
            request_memory_mb: options.request_memory_mb,
            request_disk_kb: options.request_disk_kb,
            env: options.env.clone(),
            submitted_at: chrono::Utc::now(),
        };
        let created: Result<()> = async {
            dir.create(&submission, &args).await?;
            if transient {
                dir.mark_transient().await?;
            }
            Ok(())
        }
        .await;
        if let Err(e) = created {
            self.discard_submission(None, &dir).await;
            return Err(e);
        }

        let template = MapTemplate {
            command,
            env: options.env,
            request: ResourceRequest {
                memory_mb: options.request_memory_mb,
                disk_kb: options.request_disk_kb,
            },
        };
        let num_components = args.len();

        // Claiming the tag, queueing and registering happen together so that
        // concurrent submits and loads of the same tag see one map
        let shared = {
            let _tags = self.lock_tags().await;
            loop {
                match tags::claim_tag(&tags_dir, &tag, &id).await {
                    Ok(()) => break,
                    Err(MapError::TagAlreadyExists(_)) if transient => {
                        tag = tags::random_tag(&tags_dir);
                        submission.tag = tag.clone();
                        if let Err(e) = dir.save_submission(&submission).await {
                            self.discard_submission(None, &dir).await;
                            return Err(e);
                        }
                    }
                    Err(e) => {
                        self.discard_submission(None, &dir).await;
                        return Err(e);
                    }
                }
            }

            if !self.queue.write().await.add_map(id, template, args) {
                self.discard_submission(Some(&tag), &dir).await;
                return Err(MapError::QueueFull);
            }
            self.register(id, tag.clone(), dir).await
        };
        tracing::info!(tag = %tag, map_id = %id, num_components, transient, "Submitted map");

        self.notify_changed();
        self.wakeup.notify_one();
        Ok(Map::new(self.clone(), shared))
    }

    /// Undo a submission that could not be queued, releasing its tag if it claimed one.
    async fn discard_submission(&self, tag: Option<&str>, dir: &crate::storage::MapDir) {
        if let Some(tag) = tag {
            if let Err(e) = remove_file_if_exists(&self.layout.tag_file(tag)).await {
                tracing::warn!(tag = %tag, error = %e, "Failed to release tag of discarded map");
            }
        }
        if let Err(e) = tokio::fs::remove_dir_all(dir.path()).await {
            tracing::warn!(path = %dir.path().display(), error = %e, "Failed to delete directory of discarded map");
        }
    }

    async fn register(&self, id: MapId, tag: String, dir: crate::storage::MapDir) -> Arc<MapShared> {
        let shared = Arc::new(MapShared::new(id, tag.clone(), dir));
        let mut registry = self.registry.write().await;
        registry.by_tag.insert(tag, shared.clone());
        registry.by_id.insert(id, shared.clone());
        shared
    }

    /// Look up a map by tag, recovering it from disk if this engine has not seen it yet.
    pub async fn load(self: &Arc<Self>, tag: &str) -> Result<Map> {
        tags::raise_if_tag_is_invalid(tag)?;
        if let Some(shared) = self.registry.read().await.by_tag.get(tag).cloned() {
            return Ok(Map::new(self.clone(), shared));
        }

        let _tags = self.lock_tags().await;
        // Registered by a submit or load that held the lock before us
        if let Some(shared) = self.registry.read().await.by_tag.get(tag).cloned() {
            return Ok(Map::new(self.clone(), shared));
        }

        let tag_file = self.layout.tag_file(tag);
        let contents = match tokio::fs::read_to_string(&tag_file).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(MapError::TagNotFound(tag.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let id: MapId = contents
            .trim()
            .parse()
            .map_err(|e| MapError::Internal(format!("corrupt tag file for {}: {}", tag, e)))?;

        self.recover(id, tag).await
    }

    /// Rebuild queue state for a map whose directory exists but which is not queued.
    async fn recover(self: &Arc<Self>, id: MapId, tag: &str) -> Result<Map> {
        let dir = self.layout.map_dir(&id);
        let submission = dir.load_submission().await?;
        let num_components = dir.load_num_components().await?;

        let mut components = Vec::with_capacity(num_components);
        for index in 0..num_components {
            let args = dir.load_input(index).await?;
            let component = match dir.load_outcome(index).await? {
                Some(StoredOutcome::Ok { .. }) => {
                    Component::recovered(index, args, ComponentStatus::Completed)
                }
                Some(StoredOutcome::Err { error }) => {
                    let mut component = Component::recovered(index, args, ComponentStatus::Errored);
                    component.exit_code = error.exit_code;
                    component.runtime = error.runtime;
                    component
                }
                None => Component::new(index, args),
            };
            components.push(component);
        }
        let requeued = components
            .iter()
            .filter(|c| c.status == ComponentStatus::Idle)
            .count();

        let entry = MapEntry {
            id,
            submitted_at: submission.submitted_at,
            template: MapTemplate {
                command: submission.command,
                env: submission.env,
                request: ResourceRequest {
                    memory_mb: submission.request_memory_mb,
                    disk_kb: submission.request_disk_kb,
                },
            },
            components,
        };
        if !self.queue.write().await.insert_map(entry) {
            return Err(MapError::QueueFull);
        }

        let shared = self.register(id, tag.to_string(), dir).await;
        tracing::info!(tag = %tag, map_id = %id, num_components, requeued, "Recovered map from disk");

        self.notify_changed();
        self.wakeup.notify_one();
        Ok(Map::new(self.clone(), shared))
    }

    /// All tags with a tag file.
    pub async fn tags(&self) -> Result<Vec<String>> {
        tags::list_tags(&self.layout.tags_dir()).await
    }

    /// Every map, sorted by tag.
    pub async fn load_maps(self: &Arc<Self>) -> Result<Vec<Map>> {
        let mut maps = Vec::new();
        for tag in self.tags().await? {
            match self.load(&tag).await {
                Ok(map) => maps.push(map),
                Err(e) => tracing::warn!(tag = %tag, error = %e, "Failed to load map"),
            }
        }
        Ok(maps)
    }

    /// Remove transient maps (every map if `all`) and finish interrupted removals.
    /// Returns the tags that were removed.
    pub async fn clean(self: &Arc<Self>, all: bool) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for map in self.load_maps().await? {
            if all || map.is_transient() {
                let tag = map.tag();
                map.remove(true).await?;
                removed.push(tag);
            }
        }

        let removed_tags_dir = self.layout.removed_tags_dir();
        let mut entries = tokio::fs::read_dir(&removed_tags_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(id) = name.parse::<MapId>() else {
                continue;
            };
            let dir = self.layout.map_dir(&id);
            if dir.exists() {
                tokio::fs::remove_dir_all(dir.path()).await?;
            }
            remove_file_if_exists(&entry.path()).await?;
            tracing::info!(map_id = %id, "Cleaned up leftover map directory");
        }

        Ok(removed)
    }

    /// Apply a control action to every component of the map.
    pub(crate) async fn act(&self, id: &MapId, action: JobAction) -> Result<()> {
        let effects = {
            let mut queue = self.queue.write().await;
            if !queue.contains_map(id) {
                return Err(MapError::MapWasRemoved(id.to_string()));
            }
            if !queue.is_active(id) {
                return Ok(());
            }
            queue.act(id, action)
        };

        for effect in &effects {
            match effect.effect {
                ProcessEffect::Kill => self.kill_running(&effect.key, effect.attempt).await,
                ProcessEffect::Stop => {
                    self.signal_running(&effect.key, effect.attempt, ProcessSignal::Stop)
                        .await
                }
                ProcessEffect::Continue => {
                    self.signal_running(&effect.key, effect.attempt, ProcessSignal::Continue)
                        .await
                }
                ProcessEffect::None => {}
            }
        }

        tracing::debug!(map_id = %id, action = %action, signalled = effects.len(), "Acted on map");
        self.notify_changed();
        if matches!(action, JobAction::Release | JobAction::Vacate) {
            self.wakeup.notify_one();
        }
        Ok(())
    }

    async fn kill_running(&self, key: &ComponentKey, attempt: u32) {
        let mut running = self.running.lock().await;
        if let Some(entry) = running.get_mut(key) {
            if entry.attempt == attempt {
                if let Some(kill_tx) = entry.kill_tx.take() {
                    let _ = kill_tx.send(());
                }
            }
        }
    }

    async fn signal_running(&self, key: &ComponentKey, attempt: u32, signal: ProcessSignal) {
        let handle = {
            let running = self.running.lock().await;
            match running.get(key) {
                Some(entry) if entry.attempt == attempt => entry.handle.clone(),
                _ => return,
            }
        };
        if let Err(e) = self.executor.signal(&handle, signal).await {
            tracing::warn!(component = %key, signal = ?signal, error = %e, "Failed to signal component");
        }
    }

    /// True while any process of the map is alive or any slot is still starting one.
    pub(crate) async fn has_processes(&self, id: &MapId) -> bool {
        if self.running.lock().await.keys().any(|key| key.map == *id) {
            return true;
        }
        self.assigner
            .read()
            .await
            .running()
            .iter()
            .any(|key| key.map == *id)
    }

    /// Change resource requests of components that have not started yet.
    pub(crate) async fn edit(&self, id: &MapId, memory_mb: Option<u64>, disk_kb: Option<u64>) {
        self.queue.write().await.edit_request(id, memory_mb, disk_kb);
        self.wakeup.notify_one();
    }

    /// Queue finished components again.
    pub(crate) async fn resubmit(&self, id: &MapId, components: &[usize]) -> usize {
        let count = self.queue.write().await.resubmit(id, components);
        self.notify_changed();
        self.wakeup.notify_one();
        count
    }

    /// Point `new_tag` at the map instead of `old_tag`.
    pub(crate) async fn rename(&self, shared: &Arc<MapShared>, old_tag: &str, new_tag: &str) {
        let mut registry = self.registry.write().await;
        registry.by_tag.remove(old_tag);
        registry.by_tag.insert(new_tag.to_string(), shared.clone());
        shared.set_tag(new_tag.to_string());
    }

    /// Forget a removed map.
    pub(crate) async fn unregister(&self, id: &MapId) {
        {
            let mut registry = self.registry.write().await;
            if let Some(shared) = registry.by_id.remove(id) {
                registry.by_tag.remove(&shared.tag());
            }
        }
        self.queue.write().await.remove_map(id);
        self.notify_changed();
    }

    /// Stop scheduling and kill every running component.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let mut running = self.running.lock().await;
        for entry in running.values_mut() {
            if let Some(kill_tx) = entry.kill_tx.take() {
                let _ = kill_tx.send(());
            }
        }
        tracing::info!(killed = running.len(), "Engine shut down");
    }

    /// Scheduler loop that places idle components on free slots.
    ///
    /// Runs on every `poll_interval` tick and whenever a submit, release or finished
    /// component frees up work.
    async fn scheduler_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.poll_interval());

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.wakeup.notified() => {}
            }
            self.assign_pending().await;
        }
        tracing::debug!("Scheduler loop stopped");
    }

    async fn assign_pending(self: &Arc<Self>) {
        loop {
            let launch = {
                let mut queue = self.queue.write().await;
                let mut assigner = self.assigner.write().await;
                assigner
                    .assign_next(&mut queue)
                    .and_then(|assignment| self.launch_spec(&queue, &assignment).map(|spec| (assignment, spec)))
            };
            let Some((assignment, spec)) = launch else {
                break;
            };

            self.notify_changed();
            let engine = self.clone();
            tokio::spawn(async move {
                engine.run_component(assignment, spec).await;
            });
        }
    }

    fn launch_spec(&self, queue: &ComponentQueue, assignment: &Assignment) -> Option<LaunchSpec> {
        let key = assignment.key;
        let entry = queue.map_entry(&key.map)?;
        let component = entry.components.get(key.component)?;
        Some(LaunchSpec {
            key,
            name: format!("jobmap-{}-{}-{}", key.map, key.component, assignment.attempt),
            command: entry.template.command.clone(),
            args: component.args.clone(),
            env: entry.template.env.clone(),
            output_dir: self.layout.map_dir(&key.map).output_files_dir(key.component),
            memory_mb: entry.template.request.memory_mb,
        })
    }

    /// Worker task for one assignment. Always frees the slot when the process is gone.
    async fn run_component(self: Arc<Self>, assignment: Assignment, spec: LaunchSpec) {
        let key = assignment.key;
        let attempt = assignment.attempt;

        match self.executor.spawn(&spec).await {
            Err(e) => {
                tracing::warn!(component = %key, error = %e, "Component failed to start, holding it");
                let held = self
                    .queue
                    .write()
                    .await
                    .record_start_failure(&key, attempt, ComponentHold::start_failed(&e));
                if held {
                    self.notify_changed();
                }
            }
            Ok(process) => {
                let (kill_tx, kill_rx) = oneshot::channel();
                self.running.lock().await.insert(
                    key,
                    RunningEntry {
                        attempt,
                        handle: process.handle.clone(),
                        kill_tx: Some(kill_tx),
                    },
                );

                // An action may have arrived before the process was registered
                let status = self.queue.read().await.get(&key).map(|c| (c.attempt, c.status));
                match status {
                    Some((a, ComponentStatus::Running)) if a == attempt => {}
                    Some((a, ComponentStatus::Suspended)) if a == attempt => {
                        self.signal_running(&key, attempt, ProcessSignal::Stop).await;
                    }
                    _ => self.kill_running(&key, attempt).await,
                }

                let outcome = self.executor.wait(process, kill_rx).await;

                {
                    let mut running = self.running.lock().await;
                    if running.get(&key).map(|e| e.attempt) == Some(attempt) {
                        running.remove(&key);
                    }
                }

                if let Outcome::Finished(result) = outcome {
                    if let Err(e) = self.finish(&assignment, result).await {
                        tracing::error!(component = %key, error = %e, "Failed to store component result");
                    }
                }
            }
        }

        self.assigner.write().await.release(assignment.slot);
        self.wakeup.notify_one();
    }

    /// Persist logs and the output file, then record the new status.
    async fn finish(&self, assignment: &Assignment, result: crate::worker::ExecutionResult) -> Result<()> {
        let key = assignment.key;
        if !self.queue.read().await.is_live(&key, assignment.attempt) {
            tracing::debug!(component = %key, attempt = assignment.attempt, "Discarding stale result");
            return Ok(());
        }

        let dir = self.layout.map_dir(&key.map);
        let raw_error = |stderr: String| RawError {
            exit_code: result.exit_code,
            stderr,
            runtime: result.runtime,
            finished_at: chrono::Utc::now(),
        };
        let outcome = match result.status {
            ComponentStatus::Completed => StoredOutcome::Ok {
                output: result.stdout.trim_end_matches(['\n', '\r']).to_string(),
            },
            _ => StoredOutcome::Err {
                error: raw_error(result.stderr.clone()),
            },
        };
        let stored: Result<()> = async {
            dir.save_logs(key.component, &result.stdout, &result.stderr)
                .await?;
            dir.save_outcome(key.component, &outcome).await
        }
        .await;

        // A component without a readable output file cannot count as completed
        let status = match &stored {
            Ok(()) => result.status,
            Err(e) => {
                let fallback = StoredOutcome::Err {
                    error: raw_error(format!("failed to store component result: {}", e)),
                };
                if let Err(e) = dir.save_outcome(key.component, &fallback).await {
                    tracing::warn!(component = %key, error = %e, "Failed to write error outcome");
                }
                ComponentStatus::Errored
            }
        };

        {
            let mut queue = self.queue.write().await;
            let recorded = queue.record_result(
                &key,
                assignment.attempt,
                status,
                result.exit_code,
                result.runtime,
            );
            if !recorded {
                // Acted on while the files were written
                tracing::debug!(component = %key, attempt = assignment.attempt, "Discarding stale result");
                if queue.get(&key).is_some_and(|c| !c.status.is_finished()) {
                    remove_file_if_exists(&dir.output_file(key.component)).await?;
                }
                return stored;
            }
        }

        self.notify_changed();
        stored
    }
}
