//! Background rendering of one track.
//!
//! A [`GenerationTask`] is a spawned render with an explicit terminal
//! outcome: `Succeeded`, `Failed` or `Cancelled`. Cancelling is a request
//! followed by an await: once [`GenerationTask::cancel`] returns, the
//! renderer has returned, its pending disk writes included, and nothing will
//! write to the artefact path anymore, so the caller may delete it.
//!
//! The engine owns exactly one [`GenerationSlot`]; launching into a busy
//! slot first cancels and cleans up whatever was there.

use crate::backends::TrackRenderer;
use crate::error::RenderError;
use crate::params::TrackParams;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

/// Renders in flight write here and are renamed on success.
pub fn partial_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.file_name().unwrap_or_default().to_os_string();
    name.push(".part");
    artifact.with_file_name(name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Succeeded(PathBuf),
    Failed(String),
    Cancelled,
}

pub struct GenerationTask {
    params: TrackParams,
    artifact: PathBuf,
    attempt: u32,
    started_at: Instant,
    finished_at: Option<Instant>,
    cancel: CancellationToken,
    /// Dropping an unfinished task cancels its render.
    _guard: DropGuard,
    handle: Option<JoinHandle<GenerationOutcome>>,
    outcome: Option<GenerationOutcome>,
}

impl GenerationTask {
    pub fn spawn(renderer: Arc<dyn TrackRenderer>, params: TrackParams, artifact: PathBuf) -> Self {
        Self::spawn_attempt(renderer, params, artifact, 1)
    }

    fn spawn_attempt(
        renderer: Arc<dyn TrackRenderer>,
        params: TrackParams,
        artifact: PathBuf,
        attempt: u32,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let job_params = params.clone();
        let job_artifact = artifact.clone();

        // the render is never dropped mid-flight: it sees the token, stops,
        // and the job cleans up before resolving
        let handle = tokio::spawn(async move {
            let result = renderer.render(&job_params, &job_artifact, &token).await;
            if token.is_cancelled() {
                remove_artifact(&job_artifact);
                return GenerationOutcome::Cancelled;
            }
            match result {
                Ok(()) if job_artifact.is_file() => GenerationOutcome::Succeeded(job_artifact.clone()),
                Ok(()) => GenerationOutcome::Failed("renderer wrote no file".to_string()),
                Err(RenderError::Cancelled) => GenerationOutcome::Cancelled,
                Err(err) => GenerationOutcome::Failed(err.to_string()),
            }
        });

        debug!(track_id = %params.id, attempt, artifact = %artifact.display(), "generation started");
        Self {
            params,
            artifact,
            attempt,
            started_at: Instant::now(),
            finished_at: None,
            _guard: cancel.clone().drop_guard(),
            cancel,
            handle: Some(handle),
            outcome: None,
        }
    }

    pub fn params(&self) -> &TrackParams {
        &self.params
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn outcome(&self) -> Option<&GenerationOutcome> {
        self.outcome.as_ref()
    }

    pub fn is_running(&self) -> bool {
        self.outcome.is_none()
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.outcome, Some(GenerationOutcome::Succeeded(_)))
    }

    /// Render time so far, or total render time once finished.
    pub fn elapsed(&self) -> Duration {
        self.finished_at
            .unwrap_or_else(Instant::now)
            .saturating_duration_since(self.started_at)
    }

    /// Resolves with the terminal outcome. Cancel safe: dropping the future
    /// leaves the task untouched.
    pub async fn finished(&mut self) -> GenerationOutcome {
        if let Some(outcome) = &self.outcome {
            return outcome.clone();
        }
        let outcome = match self.handle.as_mut() {
            Some(handle) => match handle.await {
                Ok(outcome) => outcome,
                Err(err) if err.is_cancelled() => GenerationOutcome::Cancelled,
                Err(err) => GenerationOutcome::Failed(format!("render task panicked: {err}")),
            },
            None => GenerationOutcome::Cancelled,
        };
        self.handle = None;
        self.finished_at = Some(Instant::now());
        self.outcome = Some(outcome.clone());
        outcome
    }

    /// Requests cancellation and waits until the render has stopped.
    ///
    /// A render that completed in the meantime keeps its `Succeeded` outcome.
    pub async fn cancel(&mut self) -> GenerationOutcome {
        if self.outcome.is_none() {
            self.cancel.cancel();
        }
        self.finished().await
    }

    /// Same recipe, same destination, next attempt.
    pub fn retry(self, renderer: Arc<dyn TrackRenderer>) -> Self {
        remove_artifact(&self.artifact);
        Self::spawn_attempt(renderer, self.params, self.artifact, self.attempt + 1)
    }

    /// Splits a finished task into its recipe and artefact.
    pub fn into_parts(self) -> (TrackParams, PathBuf, Duration) {
        let elapsed = self.elapsed();
        (self.params, self.artifact, elapsed)
    }
}

fn remove_artifact(artifact: &Path) {
    for path in [artifact.to_path_buf(), partial_path(artifact)] {
        match fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "removed unplayed artifact"),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), "cannot remove artifact: {err}"),
        }
    }
}

/// Holder for the engine's single live generation.
#[derive(Default)]
pub struct GenerationSlot {
    task: Option<GenerationTask>,
}

impl GenerationSlot {
    /// Cancels and cleans up any previous task, then starts a new one.
    pub async fn launch(
        &mut self,
        renderer: Arc<dyn TrackRenderer>,
        params: TrackParams,
        artifact: PathBuf,
    ) {
        self.discard().await;
        self.task = Some(GenerationTask::spawn(renderer, params, artifact));
    }

    /// Cancels (awaited) and deletes the unplayed artefact. Returns the
    /// recipe that was dropped, if any.
    pub async fn discard(&mut self) -> Option<TrackParams> {
        let mut task = self.task.take()?;
        let outcome = task.cancel().await;
        debug!(track_id = %task.params.id, ?outcome, "generation discarded");
        remove_artifact(&task.artifact);
        Some(task.params)
    }

    /// Relaunches the failed task in place.
    pub fn retry(&mut self, renderer: Arc<dyn TrackRenderer>) -> bool {
        match self.task.take() {
            Some(task) => {
                self.task = Some(task.retry(renderer));
                true
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.task.is_none()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(GenerationTask::is_running)
    }

    pub fn is_ready(&self) -> bool {
        self.task.as_ref().is_some_and(GenerationTask::is_ready)
    }

    pub fn task(&self) -> Option<&GenerationTask> {
        self.task.as_ref()
    }

    /// Hands over a successfully rendered task; the artefact is kept.
    pub fn take_ready(&mut self) -> Option<GenerationTask> {
        if self.is_ready() {
            self.task.take()
        } else {
            None
        }
    }

    /// Pending forever when the slot holds no running task.
    pub async fn finished(&mut self) -> GenerationOutcome {
        match self.task.as_mut() {
            Some(task) if task.is_running() => task.finished().await,
            _ => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{RawRecipe, TrackId};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Writes its partial file, then waits for `gate` before finishing.
    struct GatedRenderer {
        gate: Notify,
        fail: bool,
        calls: AtomicUsize,
    }

    impl GatedRenderer {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                gate: Notify::new(),
                fail,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TrackRenderer for GatedRenderer {
        async fn render(
            &self,
            _params: &TrackParams,
            dest: &Path,
            cancel: &CancellationToken,
        ) -> Result<(), RenderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let part = partial_path(dest);
            fs::write(&part, b"half")?;
            tokio::select! {
                _ = cancel.cancelled() => return Err(RenderError::Cancelled),
                _ = self.gate.notified() => {}
            }
            if self.fail {
                return Err(RenderError::Malformed("no audio".into()));
            }
            fs::rename(&part, dest)?;
            Ok(())
        }
    }

    /// Audio is already there: the write and the rename run on the
    /// blocking pool, slowly, whatever the token says.
    struct SlowDiskRenderer {
        persisting: AtomicBool,
    }

    #[async_trait]
    impl TrackRenderer for SlowDiskRenderer {
        async fn render(
            &self,
            _params: &TrackParams,
            dest: &Path,
            _cancel: &CancellationToken,
        ) -> Result<(), RenderError> {
            self.persisting.store(true, Ordering::SeqCst);
            let dest = dest.to_path_buf();
            tokio::task::spawn_blocking(move || {
                let part = partial_path(&dest);
                fs::write(&part, b"ID3 full")?;
                std::thread::sleep(Duration::from_millis(200));
                fs::rename(&part, &dest)
            })
            .await
            .map_err(|err| RenderError::Io(std::io::Error::other(err)))??;
            Ok(())
        }
    }

    fn params() -> TrackParams {
        TrackParams::stamp(RawRecipe::default().validate(), TrackId(1), "default", "")
    }

    #[test]
    fn test_partial_path() {
        assert_eq!(
            partial_path(Path::new("/r/tracks/001-x.mp3")),
            PathBuf::from("/r/tracks/001-x.mp3.part")
        );
    }

    #[tokio::test]
    async fn test_success_keeps_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = GatedRenderer::new(false);
        let artifact = dir.path().join("001.mp3");
        let mut task = GenerationTask::spawn(renderer.clone(), params(), artifact.clone());
        assert!(task.is_running());

        renderer.gate.notify_one();
        assert_eq!(task.finished().await, GenerationOutcome::Succeeded(artifact.clone()));
        assert!(task.is_ready());
        assert!(artifact.exists());
        // idempotent
        assert_eq!(task.finished().await, GenerationOutcome::Succeeded(artifact));
    }

    #[tokio::test]
    async fn test_cancel_is_awaited_and_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = GatedRenderer::new(false);
        let artifact = dir.path().join("001.mp3");
        let mut slot = GenerationSlot::default();
        slot.launch(renderer.clone(), params(), artifact.clone()).await;

        while !partial_path(&artifact).exists() {
            tokio::task::yield_now().await;
        }
        let dropped = slot.discard().await;
        assert_eq!(dropped.map(|p| p.id), Some(TrackId(1)));
        assert!(slot.is_empty());
        assert!(!partial_path(&artifact).exists());
        assert!(!artifact.exists());

        // the render has returned: releasing the gate writes nothing
        renderer.gate.notify_one();
        tokio::task::yield_now().await;
        assert!(!artifact.exists());
    }

    #[tokio::test]
    async fn test_discard_waits_for_pending_disk_write() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = Arc::new(SlowDiskRenderer {
            persisting: AtomicBool::new(false),
        });
        let artifact = dir.path().join("001.mp3");
        let mut slot = GenerationSlot::default();
        slot.launch(renderer.clone(), params(), artifact.clone()).await;

        while !renderer.persisting.load(Ordering::SeqCst) {
            tokio::task::yield_now().await;
        }
        slot.discard().await;
        assert!(!artifact.exists());
        assert!(!partial_path(&artifact).exists());

        // nothing lands after the discard
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!artifact.exists());
        assert!(!partial_path(&artifact).exists());
    }

    #[tokio::test]
    async fn test_cancel_before_completion_reports_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = GatedRenderer::new(false);
        let artifact = dir.path().join("001.mp3");
        let mut task = GenerationTask::spawn(renderer.clone(), params(), artifact.clone());
        while !partial_path(&artifact).exists() {
            tokio::task::yield_now().await;
        }
        assert_eq!(task.cancel().await, GenerationOutcome::Cancelled);
        assert!(!task.is_running());
        assert!(!partial_path(&artifact).exists());
    }

    #[tokio::test]
    async fn test_launch_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = GatedRenderer::new(false);
        let first = dir.path().join("001-a.mp3");
        let second = dir.path().join("001-b.mp3");
        let mut slot = GenerationSlot::default();

        slot.launch(renderer.clone(), params(), first.clone()).await;
        slot.launch(renderer.clone(), params(), second.clone()).await;
        assert_eq!(slot.task().unwrap().artifact(), second.as_path());
        assert!(!partial_path(&first).exists());

        renderer.gate.notify_one();
        assert_eq!(slot.finished().await, GenerationOutcome::Succeeded(second));
        assert!(slot.is_ready());
        assert!(slot.take_ready().is_some());
        assert!(slot.is_empty());
    }

    #[tokio::test]
    async fn test_failure_then_retry() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = GatedRenderer::new(true);
        let artifact = dir.path().join("001.mp3");
        let mut slot = GenerationSlot::default();
        slot.launch(renderer.clone(), params(), artifact.clone()).await;

        renderer.gate.notify_one();
        assert!(matches!(slot.finished().await, GenerationOutcome::Failed(_)));
        assert!(!slot.is_running());
        assert!(slot.take_ready().is_none());

        assert!(slot.retry(renderer.clone()));
        assert_eq!(slot.task().unwrap().attempt(), 2);
        assert!(slot.is_running());
        renderer.gate.notify_one();
        assert!(matches!(slot.finished().await, GenerationOutcome::Failed(_)));
        assert_eq!(renderer.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_slot_never_finishes() {
        let mut slot = GenerationSlot::default();
        let mut finished = tokio_test::task::spawn(slot.finished());
        tokio_test::assert_pending!(finished.poll());
    }
}
