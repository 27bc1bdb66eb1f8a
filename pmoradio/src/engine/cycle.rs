use super::{ticker, until, Flow, QueuedTrack, RadioEngine};
use crate::backends::ParamsRequest;
use crate::clock::PlaybackState;
use crate::error::Result;
use crate::events::{GenerationSummary, NowPlaying, RadioEvent};
use crate::generation::GenerationOutcome;
use crate::params::{TrackParams, TrackRecipe};
use crate::station::{MetricEntry, TrackRecord};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const STUCK_HINT: &str = " - vary significantly, change key, BPM range, and genre";

impl RadioEngine {
    /// One pass of the main loop. Returns early whenever the listener
    /// changed something; the caller simply runs it again.
    pub(super) async fn cycle(&mut self) -> Result<()> {
        // 1. pre-checks
        if self
            .sleep_deadline
            .is_some_and(|deadline| Instant::now() >= deadline)
        {
            self.expire_sleep().await;
            return Ok(());
        }

        if let Some(free_mb) = self.station.disk_free_mb() {
            if free_mb < self.settings.min_free_mb {
                warn!(radio = %self.station.name(), free_mb, "Not enough disk space, generation paused");
                self.errors.record(
                    "disk_check",
                    &format!("{free_mb:.0} MB free"),
                    None,
                    &format!("less than {} MB free", self.settings.min_free_mb),
                );
                self.events.broadcast(RadioEvent::DiskFull { free_mb });
                let recheck = self.settings.disk_recheck;
                self.idle(Some(recheck)).await;
                return Ok(());
            }
        }

        if self.station.is_first_run() && self.direction.is_empty() {
            debug!(radio = %self.station.name(), "waiting for a first vibe");
            self.idle(None).await;
            return Ok(());
        }

        let status = self.renderer.health().await;
        if !status.ok {
            info!(detail = ?status.detail, "Renderer not reachable yet");
            self.events.broadcast(RadioEvent::Waiting {
                message: "Renderer starting up…".to_string(),
            });
            let backoff = self.settings.renderer_down_backoff;
            self.idle(Some(backoff)).await;
            return Ok(());
        }

        // 2. keep the queued track audible before spending time on the next one
        self.ensure_audible();

        // 3. build the request
        let request = self.build_request();
        let message = request.message.clone();

        // 4. parameters, then rendering
        self.events.broadcast(RadioEvent::Thinking);
        let recipe = match self.request_params(request).await {
            None => return Ok(()),
            Some(Ok(recipe)) => recipe,
            Some(Err(err)) => {
                warn!(radio = %self.station.name(), "Parameter generation failed: {err:#}");
                self.errors
                    .record("llm_generate", &message, None, &format!("{err:#}"));
                self.events
                    .broadcast(RadioEvent::error("llm", "LLM failed, retrying..."));
                let backoff = self.settings.params_backoff;
                self.idle(Some(backoff)).await;
                return Ok(());
            }
        };

        self.pending_modifiers.clear();
        self.pending_mood = None;
        let params = TrackParams::stamp(
            recipe,
            self.station.next_track_id(),
            self.station.name(),
            &self.direction,
        );
        let artifact = self.station.artifact_path(&params);
        info!(
            radio = %self.station.name(),
            track_id = %params.id,
            "Generating: {}",
            params.recipe.summary()
        );
        self.events.broadcast(RadioEvent::GenerationStart {
            params: GenerationSummary::from(&params),
            warnings: params.recipe.warnings.clone(),
        });
        self.slot
            .launch(Arc::clone(&self.renderer), params, artifact)
            .await;

        // 5. and 6. wait, then advance (commit) or discard
        self.await_generation().await;
        Ok(())
    }

    async fn expire_sleep(&mut self) {
        info!(radio = %self.station.name(), "Sleep timer expired");
        self.sleep_deadline = None;
        self.slot.discard().await;
        self.clock.stop();
        self.events.broadcast(RadioEvent::SleepExpired);
        self.emit_playback();
        self.idle(None).await;
    }

    /// Restarts the queued track if the clock is not playing it.
    fn ensure_audible(&mut self) {
        let Some(artifact) = self.queued.as_ref().map(|q| q.artifact.clone()) else {
            return;
        };
        match self.clock.state() {
            PlaybackState::Playing | PlaybackState::Paused => {}
            PlaybackState::Ended => self.keep_audible(),
            PlaybackState::Idle => {
                if artifact.is_file() {
                    let duration = (self.probe)(&artifact);
                    self.clock.play(&artifact, duration);
                    self.emit_playback();
                } else {
                    self.queued = None;
                }
            }
        }
    }

    fn build_request(&self) -> ParamsRequest {
        let mut message = self.direction.clone();

        if let Some(last) = self.recent.last() {
            if self.settings.similarity.is_stuck(&last.recipe, &self.recent) {
                info!("Recent tracks are too similar, asking for variety");
                message.push_str(STUCK_HINT);
            }
        }

        let mut hints = Vec::new();
        if !self.pending_modifiers.is_empty() {
            hints.push(format!("modifiers: {}", self.pending_modifiers.join(", ")));
        }
        if let Some(mood) = self.pending_mood {
            hints.push(format!("mood: {}", mood.as_str()));
        }
        if !hints.is_empty() {
            message.push_str(&format!(" [{}]", hints.join("; ")));
        }

        ParamsRequest {
            message: message.trim().to_string(),
            taste_context: self.station.taste().context(self.station.name()),
            last: self.last_params.as_ref().map(|p| p.recipe.clone()),
            recent: self.recent.iter().map(|p| p.recipe.clone()).collect(),
        }
    }

    /// Waits for the parameter backend. `None` when the listener acted
    /// meanwhile: the half-built request is dropped.
    async fn request_params(
        &mut self,
        request: ParamsRequest,
    ) -> Option<anyhow::Result<TrackRecipe>> {
        let backend = Arc::clone(&self.params_backend);
        let call = async move { backend.generate(&request).await };
        tokio::pin!(call);
        let mut ticker = ticker();

        loop {
            if self.shutdown {
                return None;
            }
            self.keep_audible();
            let waiter = self.clock.waiter();
            let watch_clock = self.clock.is_audible();

            tokio::select! {
                biased;
                command = self.commands.recv() => match self.on_command(command).await {
                    Flow::Continue => {}
                    Flow::Reacted | Flow::Restart => {
                        debug!("parameter request abandoned");
                        return None;
                    }
                },
                _ = until(self.sleep_deadline) => return None,
                result = &mut call => return Some(result),
                completion = waiter.wait(), if watch_clock => self.on_clock(completion),
                _ = ticker.tick() => self.on_tick(),
            }
        }
    }

    /// Waits for the generation without ever blocking the listener.
    ///
    /// Nothing audible: the track starts as soon as it is ready. Something
    /// audible: the ready track waits for the natural end, or preempts when
    /// `interrupt_when_ready` is armed; an ended track whose successor is not
    /// ready is replayed.
    async fn await_generation(&mut self) {
        let mut ticker = ticker();
        loop {
            if self.shutdown {
                return;
            }
            if self.slot.is_ready() && (!self.clock.is_audible() || self.interrupt_when_ready) {
                self.advance();
                return;
            }
            if self.slot.is_empty() {
                return;
            }
            self.keep_audible();

            let waiter = self.clock.waiter();
            let watch_clock = self.clock.is_audible();
            let running = self.slot.is_running();

            tokio::select! {
                biased;
                command = self.commands.recv() => {
                    if self.on_command(command).await == Flow::Restart {
                        return;
                    }
                },
                _ = until(self.sleep_deadline) => return,
                outcome = self.slot.finished(), if running => {
                    if !self.on_generation_outcome(outcome).await {
                        return;
                    }
                },
                completion = waiter.wait(), if watch_clock => self.on_clock(completion),
                _ = ticker.tick() => self.on_tick(),
            }
        }
    }

    /// Returns whether to keep waiting on the slot.
    async fn on_generation_outcome(&mut self, outcome: GenerationOutcome) -> bool {
        match outcome {
            GenerationOutcome::Succeeded(artifact) => {
                info!(artifact = %artifact.display(), "Generation done");
                self.events.broadcast(RadioEvent::GenerationDone);
                true
            }
            GenerationOutcome::Cancelled => false,
            GenerationOutcome::Failed(reason) => {
                let Some(task) = self.slot.task() else {
                    return false;
                };
                let attempt = task.attempt();
                let params = task.params().clone();
                warn!(track_id = %params.id, attempt, "Generation failed: {reason}");
                self.errors
                    .record("acestep_generate", &params.prompt, Some(&params), &reason);

                if attempt < 2 {
                    self.events.broadcast(RadioEvent::error(
                        "generate",
                        format!("Generation failed: {reason}, retrying..."),
                    ));
                    self.slot.retry(Arc::clone(&self.renderer))
                } else {
                    self.events.broadcast(RadioEvent::error(
                        "generate",
                        format!("Retry failed: {reason}"),
                    ));
                    self.slot.discard().await;
                    let backoff = self.settings.render_backoff;
                    self.idle(Some(backoff)).await;
                    false
                }
            }
        }
    }

    /// Plays the ready track and commits it.
    pub(super) fn advance(&mut self) {
        let Some(task) = self.slot.take_ready() else {
            return;
        };
        let (params, artifact, generation_time) = task.into_parts();
        let duration = (self.probe)(&artifact);
        self.clock.play(&artifact, duration);
        self.commit(&params, &artifact, generation_time, duration);

        let queued = QueuedTrack { params, artifact };
        let now_playing = NowPlaying::new(
            &queued.params,
            &queued.file_name(),
            duration.map(|d| d.as_secs_f64()),
        );
        info!(
            radio = %self.station.name(),
            track_id = %queued.params.id,
            "Now playing: {}",
            queued.params.recipe.summary()
        );

        self.last_params = Some(queued.params.clone());
        self.recent.push(queued.params.clone());
        let excess = self.recent.len().saturating_sub(self.settings.recent_window);
        self.recent.drain(..excess);
        self.queued = Some(queued);
        self.interrupt_when_ready = false;

        self.events.broadcast(RadioEvent::NowPlaying(now_playing));
        self.emit_playback();
    }

    /// Recipe file, play count and metrics line. Failures are only logged.
    fn commit(
        &self,
        params: &TrackParams,
        artifact: &Path,
        generation_time: Duration,
        duration: Option<Duration>,
    ) {
        let generation_time_s = round2(generation_time.as_secs_f64());
        let audio_duration_s = duration.map(|d| round2(d.as_secs_f64()));
        let realtime_ratio = match (audio_duration_s, generation_time_s) {
            (Some(audio), gen) if gen > 0.0 => Some(round2(audio / gen)),
            _ => None,
        };
        let record = TrackRecord {
            params: params.clone(),
            reaction: "neutral".to_string(),
            favorited: false,
            generation_time_s,
            audio_duration_s,
            file_size_bytes: fs::metadata(artifact).ok().map(|m| m.len()),
            realtime_ratio,
        };

        if let Err(err) = self.station.write_record(artifact, &record) {
            warn!(artifact = %artifact.display(), "Cannot write track recipe: {err}");
        }
        match self.station.taste().increment_count() {
            Ok(count) => debug!(count, "generation count"),
            Err(err) => warn!("Cannot update taste profile: {err:#}"),
        }
        self.stations.append_metric(&MetricEntry::from(&record));
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
