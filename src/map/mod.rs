//! Handle to a submitted map and everything that can be done with it.
//!
//! A [`Map`] is a cheap, cloneable handle. Every handle for the same map shares its
//! tag, so a retag through one handle is visible through all of them. Once a map has
//! been removed, every operation returns [`MapError::MapWasRemoved`].

pub mod errors;

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

use crate::engine::Engine;
use crate::error::{MapError, Result};
use crate::scheduler::{ComponentHold, ComponentStatus, JobAction, MapId, StatusCounts};
use crate::storage::{remove_file_if_exists, MapDir, StoredOutcome};
use crate::{tags, utils};

pub use errors::ComponentError;

const REMOVE_ATTEMPTS: usize = 5;

/// State shared by every handle of one map.
#[derive(Debug)]
pub struct MapShared {
    id: MapId,
    tag: StdRwLock<String>,
    dir: MapDir,
}

impl MapShared {
    pub(crate) fn new(id: MapId, tag: String, dir: MapDir) -> Self {
        Self {
            id,
            tag: StdRwLock::new(tag),
            dir,
        }
    }

    pub(crate) fn tag(&self) -> String {
        self.tag
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(crate) fn set_tag(&self, tag: String) {
        *self
            .tag
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = tag;
    }
}

/// Options for [`Map::wait`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WaitOptions {
    /// Give up after this long. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Treat held components as done instead of failing.
    pub holds_ok: bool,
    /// Treat errored components as done instead of failing.
    pub errors_ok: bool,
}

impl WaitOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Default::default()
        }
    }
}

#[derive(Clone)]
pub struct Map {
    engine: Arc<Engine>,
    shared: Arc<MapShared>,
}

impl std::fmt::Debug for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Map(tag = {})", self.tag())
    }
}

impl std::fmt::Display for Map {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "map {}", self.tag())
    }
}

impl PartialEq for Map {
    fn eq(&self, other: &Self) -> bool {
        self.shared.id == other.shared.id
    }
}

impl Eq for Map {}

impl Map {
    pub(crate) fn new(engine: Arc<Engine>, shared: Arc<MapShared>) -> Self {
        Self { engine, shared }
    }

    pub fn id(&self) -> MapId {
        self.shared.id
    }

    pub fn tag(&self) -> String {
        self.shared.tag()
    }

    pub fn map_dir(&self) -> PathBuf {
        self.shared.dir.path().to_path_buf()
    }

    /// True until the map has been successfully removed.
    pub fn exists(&self) -> bool {
        self.shared.dir.exists()
    }

    fn ensure_exists(&self) -> Result<()> {
        if self.exists() {
            Ok(())
        } else {
            Err(MapError::MapWasRemoved(self.tag()))
        }
    }

    /// Maps submitted without a tag are transient until retagged.
    pub fn is_transient(&self) -> bool {
        self.shared.dir.is_transient()
    }

    /// Number of components
    pub async fn len(&self) -> Result<usize> {
        Ok(self.component_statuses().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn components(&self) -> Result<std::ops::Range<usize>> {
        Ok(0..self.len().await?)
    }

    pub async fn contains(&self, component: usize) -> Result<bool> {
        Ok(component < self.len().await?)
    }

    fn check_range(&self, component: usize, len: usize) -> Result<()> {
        if component >= len {
            return Err(MapError::ComponentOutOfRange {
                tag: self.tag(),
                component,
                len,
            });
        }
        Ok(())
    }

    /// Current status of each component, in component order.
    pub async fn component_statuses(&self) -> Result<Vec<ComponentStatus>> {
        self.ensure_exists()?;
        self.engine
            .queue
            .read()
            .await
            .statuses(&self.shared.id)
            .ok_or_else(|| MapError::MapWasRemoved(self.tag()))
    }

    async fn component_status(&self, component: usize) -> Result<ComponentStatus> {
        let statuses = self.component_statuses().await?;
        self.check_range(component, statuses.len())?;
        Ok(statuses[component])
    }

    /// Number of components in each status.
    pub async fn status_counts(&self) -> Result<StatusCounts> {
        Ok(self.component_statuses().await?.into_iter().collect())
    }

    /// Component indices grouped by status, each group sorted.
    pub async fn components_by_status(&self) -> Result<BTreeMap<ComponentStatus, Vec<usize>>> {
        let mut grouped: BTreeMap<ComponentStatus, Vec<usize>> = BTreeMap::new();
        for (component, status) in self.component_statuses().await?.into_iter().enumerate() {
            grouped.entry(status).or_default().push(component);
        }
        Ok(grouped)
    }

    /// One-line summary such as `Map foo (3 components): idle = 1 | running = 2 | ...`.
    pub async fn status(&self) -> Result<String> {
        let statuses = self.component_statuses().await?;
        let counts: StatusCounts = statuses.iter().copied().collect();
        let summary = ComponentStatus::display_statuses()
            .iter()
            .map(|status| format!("{} = {}", status, counts[*status]))
            .collect::<Vec<_>>()
            .join(" | ");
        Ok(format!(
            "Map {} ({} components): {}",
            self.tag(),
            statuses.len(),
            summary
        ))
    }

    /// True if every component has completed successfully.
    pub async fn is_done(&self) -> Result<bool> {
        Ok(self
            .component_statuses()
            .await?
            .iter()
            .all(|s| *s == ComponentStatus::Completed))
    }

    /// True if any component has neither completed nor errored.
    pub async fn is_active(&self) -> Result<bool> {
        Ok(self
            .component_statuses()
            .await?
            .iter()
            .any(|s| !s.is_finished()))
    }

    /// Holds of the held components, by component index.
    pub async fn holds(&self) -> Result<BTreeMap<usize, ComponentHold>> {
        self.ensure_exists()?;
        Ok(self.engine.queue.read().await.holds(&self.shared.id))
    }

    /// Table of held components with their hold codes and reasons.
    pub async fn hold_report(&self) -> Result<String> {
        let rows: Vec<Vec<String>> = self
            .holds()
            .await?
            .into_iter()
            .map(|(component, hold)| vec![component.to_string(), hold.code.to_string(), hold.reason])
            .collect();
        Ok(utils::table(
            &["Component", "Code", "Hold Reason"],
            &rows,
            &["Component", "Hold Reason"],
        ))
    }

    async fn act(&self, action: JobAction) -> Result<()> {
        self.ensure_exists()?;
        self.engine.act(&self.shared.id, action).await
    }

    /// Hold every component. Held components do not run until released;
    /// running components are stopped and start over after the release.
    pub async fn hold(&self) -> Result<()> {
        self.act(JobAction::Hold).await?;
        tracing::debug!(tag = %self.tag(), "Held map");
        Ok(())
    }

    /// Make held components idle again.
    pub async fn release(&self) -> Result<()> {
        self.act(JobAction::Release).await?;
        tracing::debug!(tag = %self.tag(), "Released map");
        Ok(())
    }

    /// Stop running components where they are, keeping their slots.
    pub async fn pause(&self) -> Result<()> {
        self.act(JobAction::Suspend).await?;
        tracing::debug!(tag = %self.tag(), "Paused map");
        Ok(())
    }

    /// Continue paused components.
    pub async fn resume(&self) -> Result<()> {
        self.act(JobAction::Continue).await?;
        tracing::debug!(tag = %self.tag(), "Resumed map");
        Ok(())
    }

    /// Give up the slots of running components; they go back to idle and start over.
    pub async fn vacate(&self) -> Result<()> {
        self.act(JobAction::Vacate).await?;
        tracing::debug!(tag = %self.tag(), "Vacated map");
        Ok(())
    }

    async fn edit(&self, memory_mb: Option<u64>, disk_kb: Option<u64>) -> Result<()> {
        if !self.is_active().await? {
            return Ok(());
        }

        let mut submission = self.shared.dir.load_submission().await?;
        if let Some(memory_mb) = memory_mb {
            submission.request_memory_mb = memory_mb;
        }
        if let Some(disk_kb) = disk_kb {
            submission.request_disk_kb = disk_kb;
        }
        self.shared.dir.save_submission(&submission).await?;
        self.engine.edit(&self.shared.id, memory_mb, disk_kb).await;

        tracing::debug!(tag = %self.tag(), memory_mb = ?memory_mb, disk_kb = ?disk_kb, "Edited map requests");
        Ok(())
    }

    /// Change the memory (MB) each component requests. Running components keep what
    /// they started with; vacate the map to restart them with the new request.
    pub async fn set_memory(&self, memory_mb: u64) -> Result<()> {
        self.edit(Some(memory_mb), None).await
    }

    /// Change the disk space (KB) each component requests.
    pub async fn set_disk(&self, disk_kb: u64) -> Result<()> {
        self.edit(None, Some(disk_kb)).await
    }

    /// Sleep until a status changes or `cap` elapses.
    async fn wait_for_change(&self, changes: &mut watch::Receiver<u64>, cap: Option<Duration>) {
        let mut pause = self.engine.config().poll_interval();
        if let Some(cap) = cap {
            pause = pause.min(cap);
        }
        let _ = tokio::time::timeout(pause, changes.changed()).await;
    }

    /// Wait until every component has completed.
    ///
    /// Fails as soon as a component is held or errored, unless `holds_ok` or
    /// `errors_ok` allow it.
    pub async fn wait(&self, options: WaitOptions) -> Result<()> {
        let start = Instant::now();
        let mut changes = self.engine.subscribe();

        loop {
            let statuses = self.component_statuses().await?;

            let done = |s: &ComponentStatus| {
                *s == ComponentStatus::Completed
                    || (options.holds_ok && *s == ComponentStatus::Held)
                    || (options.errors_ok && *s == ComponentStatus::Errored)
            };
            if statuses.iter().all(done) {
                return Ok(());
            }

            for (component, status) in statuses.iter().enumerate() {
                match status {
                    ComponentStatus::Held if !options.holds_ok => {
                        return Err(self.held_error(component).await?);
                    }
                    ComponentStatus::Errored if !options.errors_ok => {
                        let report = self.load_error(component).await?.report();
                        return Err(MapError::ComponentError {
                            tag: self.tag(),
                            component,
                            report,
                        });
                    }
                    ComponentStatus::Removed => return Err(MapError::MapWasRemoved(self.tag())),
                    _ => {}
                }
            }

            let remaining = match options.timeout {
                Some(timeout) => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        return Err(MapError::Timeout(timeout, self.to_string()));
                    }
                    Some(timeout - elapsed)
                }
                None => None,
            };
            self.wait_for_change(&mut changes, remaining).await;
        }
    }

    async fn held_error(&self, component: usize) -> Result<MapError> {
        let hold = self
            .holds()
            .await?
            .remove(&component)
            .unwrap_or_else(ComponentHold::by_user);
        Ok(MapError::ComponentHeld {
            tag: self.tag(),
            component,
            hold,
        })
    }

    /// Wait for a component to complete or error.
    async fn wait_for_component(&self, component: usize, timeout: Option<Duration>) -> Result<()> {
        let start = Instant::now();
        let mut changes = self.engine.subscribe();

        loop {
            match self.component_status(component).await? {
                ComponentStatus::Completed | ComponentStatus::Errored => return Ok(()),
                ComponentStatus::Held => return Err(self.held_error(component).await?),
                ComponentStatus::Removed => return Err(MapError::MapWasRemoved(self.tag())),
                _ => {}
            }

            let remaining = match timeout {
                Some(timeout) => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        return Err(if timeout.is_zero() {
                            MapError::OutputNotFound {
                                tag: self.tag(),
                                component,
                            }
                        } else {
                            MapError::Timeout(
                                timeout,
                                format!("component {} of {}", component, self),
                            )
                        });
                    }
                    Some(timeout - elapsed)
                }
                None => None,
            };
            self.wait_for_change(&mut changes, remaining).await;
        }
    }

    async fn load_outcome(&self, component: usize) -> Result<StoredOutcome> {
        self.shared
            .dir
            .load_outcome(component)
            .await?
            .ok_or_else(|| MapError::OutputNotFound {
                tag: self.tag(),
                component,
            })
    }

    async fn load_error(&self, component: usize) -> Result<ComponentError> {
        match self.load_outcome(component).await? {
            StoredOutcome::Ok { .. } => Err(MapError::ExpectedError {
                tag: self.tag(),
                component,
            }),
            StoredOutcome::Err { error } => {
                let input = self.shared.dir.load_input(component).await?;
                Ok(ComponentError::from_raw(self.tag(), component, input, error))
            }
        }
    }

    /// Output of a component: its standard output without trailing newlines.
    ///
    /// Waits up to `timeout` (`None` = forever) for the component to finish. A zero
    /// timeout does not wait and reports [`MapError::OutputNotFound`].
    pub async fn get(&self, component: usize, timeout: Option<Duration>) -> Result<String> {
        self.wait_for_component(component, timeout).await?;
        match self.load_outcome(component).await? {
            StoredOutcome::Ok { output } => Ok(output),
            StoredOutcome::Err { error } => {
                let input = self.shared.dir.load_input(component).await?;
                let report = ComponentError::from_raw(self.tag(), component, input, error).report();
                Err(MapError::ComponentError {
                    tag: self.tag(),
                    component,
                    report,
                })
            }
        }
    }

    /// Error of a failed component. Fails with [`MapError::ExpectedError`] if it succeeded.
    pub async fn get_err(&self, component: usize, timeout: Option<Duration>) -> Result<ComponentError> {
        self.wait_for_component(component, timeout).await?;
        self.load_error(component).await
    }

    /// Outputs of all components in input order, waiting up to `timeout` for each.
    pub async fn outputs(&self, timeout: Option<Duration>) -> Result<Vec<String>> {
        let mut outputs = Vec::new();
        for component in self.components().await? {
            outputs.push(self.get(component, timeout).await?);
        }
        Ok(outputs)
    }

    /// `(input, output)` pairs in input order.
    pub async fn outputs_with_inputs(
        &self,
        timeout: Option<Duration>,
    ) -> Result<Vec<(Vec<String>, String)>> {
        let mut pairs = Vec::new();
        for component in self.components().await? {
            let output = self.get(component, timeout).await?;
            let input = self.shared.dir.load_input(component).await?;
            pairs.push((input, output));
        }
        Ok(pairs)
    }

    /// Stream of `(component, output)` in the order components finish.
    ///
    /// The stream ends after the last output, or after yielding an error: a held or
    /// errored component, or [`MapError::Timeout`] once `timeout` has passed for the
    /// whole iteration.
    pub fn as_available(&self, timeout: Option<Duration>) -> ReceiverStream<Result<(usize, String)>> {
        let (tx, rx) = mpsc::channel(16);
        let map = self.clone();

        tokio::spawn(async move {
            let start = Instant::now();
            let mut changes = map.engine.subscribe();
            let mut remaining: BTreeSet<usize> = match map.components().await {
                Ok(components) => components.collect(),
                Err(e) => {
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            while !remaining.is_empty() {
                for component in remaining.clone() {
                    match map.get(component, Some(Duration::ZERO)).await {
                        Ok(output) => {
                            remaining.remove(&component);
                            if tx.send(Ok((component, output))).await.is_err() {
                                return;
                            }
                        }
                        Err(MapError::OutputNotFound { .. }) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
                if remaining.is_empty() {
                    break;
                }

                let cap = match timeout {
                    Some(timeout) => {
                        let elapsed = start.elapsed();
                        if elapsed >= timeout {
                            let _ = tx
                                .send(Err(MapError::Timeout(
                                    timeout,
                                    format!("more output from {}", map),
                                )))
                                .await;
                            return;
                        }
                        Some(timeout - elapsed)
                    }
                    None => None,
                };
                map.wait_for_change(&mut changes, cap).await;
            }
        });

        ReceiverStream::new(rx)
    }

    /// Input arguments of every component.
    pub async fn inputs(&self) -> Result<Vec<Vec<String>>> {
        let mut inputs = Vec::new();
        for component in self.components().await? {
            inputs.push(self.shared.dir.load_input(component).await?);
        }
        Ok(inputs)
    }

    /// Errors of the components that failed, by component index.
    pub async fn errors(&self) -> Result<BTreeMap<usize, ComponentError>> {
        let mut errors = BTreeMap::new();
        for (component, status) in self.component_statuses().await?.into_iter().enumerate() {
            if status == ComponentStatus::Errored {
                errors.insert(component, self.load_error(component).await?);
            }
        }
        Ok(errors)
    }

    /// Reports of the components that failed, in component order.
    pub async fn error_reports(&self) -> Result<Vec<String>> {
        Ok(self
            .errors()
            .await?
            .values()
            .map(ComponentError::report)
            .collect())
    }

    /// Standard output of a component, once it has finished.
    pub async fn stdout(&self, component: usize, timeout: Option<Duration>) -> Result<String> {
        self.check_range(component, self.len().await?)?;
        let path = self.shared.dir.stdout_file(component);
        utils::wait_for_path(&path, timeout, self.engine.config().poll_interval()).await?;
        Ok(tokio::fs::read_to_string(path).await?)
    }

    /// Standard error of a component, once it has finished.
    pub async fn stderr(&self, component: usize, timeout: Option<Duration>) -> Result<String> {
        self.check_range(component, self.len().await?)?;
        let path = self.shared.dir.stderr_file(component);
        utils::wait_for_path(&path, timeout, self.engine.config().poll_interval()).await?;
        Ok(tokio::fs::read_to_string(path).await?)
    }

    /// Directory holding the files a component wrote to its working directory.
    pub async fn output_files(&self, component: usize, timeout: Option<Duration>) -> Result<PathBuf> {
        self.wait_for_component(component, timeout).await?;
        Ok(self.shared.dir.output_files_dir(component))
    }

    /// Accumulated execution time of each component.
    pub async fn runtime(&self) -> Result<Vec<Duration>> {
        self.ensure_exists()?;
        Ok(self.engine.queue.read().await.runtimes(&self.shared.id))
    }

    /// Bytes stored in the map directory.
    pub async fn local_data(&self) -> Result<u64> {
        self.ensure_exists()?;
        let started = Instant::now();
        let size = utils::dir_size(self.shared.dir.path()).await?;
        tracing::debug!(
            tag = %self.tag(),
            size = %utils::num_bytes_to_str(size),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Measured map directory"
        );
        Ok(size)
    }

    /// Stop all components and delete all data of the map.
    ///
    /// Unless `force` is set, waits for every component process to exit before
    /// deleting data, and fails if the components cannot be removed.
    pub async fn remove(&self, force: bool) -> Result<()> {
        self.ensure_exists()?;
        let tag = self.tag();
        let id = self.shared.id;

        if let Err(e) = self.engine.act(&id, JobAction::Remove).await {
            if !force {
                return Err(e);
            }
            tracing::error!(tag = %tag, error = %e, "Error while force-removing map, continuing with cleanup");
        }

        if !force {
            let mut changes = self.engine.subscribe();
            while self.engine.has_processes(&id).await {
                self.wait_for_change(&mut changes, None).await;
            }
        }

        self.cleanup_local_data(&tag).await?;
        self.engine.unregister(&id).await;
        tracing::info!(tag = %tag, "Removed map");
        Ok(())
    }

    async fn cleanup_local_data(&self, tag: &str) -> Result<()> {
        let layout = self.engine.layout();
        let removed_tag_file = layout.removed_tag_file(&self.shared.id);
        {
            let _tags = self.engine.lock_tags().await;
            tokio::fs::rename(layout.tag_file(tag), &removed_tag_file).await?;
        }
        tracing::debug!(tag = %tag, "Moved tag file to the removed tags directory");

        let poll = self.engine.config().poll_interval();
        for attempt in 1..=REMOVE_ATTEMPTS {
            match tokio::fs::remove_dir_all(self.shared.dir.path()).await {
                Ok(()) => {
                    // The removed tag file lets clean() finish the job if we never get here
                    tokio::fs::remove_file(&removed_tag_file).await?;
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(tag = %tag, attempt, error = %e, "Failed to remove map directory, retrying");
                    tokio::time::sleep(poll).await;
                }
            }
        }
        tracing::error!(tag = %tag, "Failed to remove map directory, run clean to try again later");
        Ok(())
    }

    /// Run finished components again from scratch. `None` reruns the whole map.
    pub async fn rerun(&self, components: Option<&[usize]>) -> Result<()> {
        let statuses = self.component_statuses().await?;
        let components: BTreeSet<usize> = match components {
            Some(components) => components.iter().copied().collect(),
            None => (0..statuses.len()).collect(),
        };

        let unknown: Vec<usize> = components
            .iter()
            .copied()
            .filter(|c| *c >= statuses.len())
            .collect();
        if !unknown.is_empty() {
            return Err(MapError::CannotRerunComponents(format!(
                "components {:?} are not in map {}",
                unknown,
                self.tag()
            )));
        }

        let unfinished: Vec<usize> = components
            .iter()
            .copied()
            .filter(|c| !statuses[*c].is_finished())
            .collect();
        if !unfinished.is_empty() {
            return Err(MapError::CannotRerunComponents(format!(
                "components {:?} of map {} are not complete",
                unfinished,
                self.tag()
            )));
        }

        for component in &components {
            self.shared.dir.clear_component(*component).await?;
        }
        let components: Vec<usize> = components.into_iter().collect();
        let count = self.engine.resubmit(&self.shared.id, &components).await;
        tracing::info!(tag = %self.tag(), count, "Resubmitted components");
        Ok(())
    }

    /// Give the map a new tag. The old tag can be reused immediately.
    /// Retagged maps are no longer transient.
    pub async fn retag(&self, new_tag: &str) -> Result<()> {
        self.ensure_exists()?;
        let old_tag = self.tag();
        if new_tag == old_tag {
            return Err(MapError::CannotRetagMap(
                "cannot retag a map to the tag it already has".to_string(),
            ));
        }

        let layout = self.engine.layout();
        let _tags = self.engine.lock_tags().await;
        tags::raise_if_tag_is_invalid(new_tag)
            .and_then(|_| tags::raise_if_tag_already_exists(&layout.tags_dir(), new_tag))
            .map_err(|e| MapError::CannotRetagMap(e.to_string()))?;

        // Linking fails instead of overwriting a tag file created by someone else
        let (old_file, new_file) = (layout.tag_file(&old_tag), layout.tag_file(new_tag));
        match tokio::fs::hard_link(&old_file, &new_file).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(MapError::CannotRetagMap(
                    MapError::TagAlreadyExists(new_tag.to_string()).to_string(),
                ))
            }
            Err(e) => return Err(e.into()),
        }

        let rewritten: Result<()> = async {
            let mut submission = self.shared.dir.load_submission().await?;
            submission.tag = new_tag.to_string();
            self.shared.dir.save_submission(&submission).await
        }
        .await;
        if let Err(e) = rewritten {
            remove_file_if_exists(&new_file).await?;
            return Err(e);
        }
        tokio::fs::remove_file(&old_file).await?;
        self.shared.dir.mark_persistent().await?;
        self.engine.rename(&self.shared, &old_tag, new_tag).await;

        tracing::info!(old_tag = %old_tag, new_tag = %new_tag, "Retagged map");
        Ok(())
    }
}
