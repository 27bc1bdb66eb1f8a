//! The radio engine.
//!
//! One tokio task owns every piece of mutable state: the playback clock,
//! the single generation slot, the queued track and the current station.
//! Everything else talks to it through a [`RadioHandle`], which sends
//! [`EngineCommand`]s over an mpsc channel and subscribes to the
//! [`EventSink`].
//!
//! The main loop repeats [`cycle`](RadioEngine::cycle): pre-checks, make
//! sure something is audible, ask the parameter backend for a recipe, launch
//! the render and wait. Every wait is a `tokio::select!` over the command
//! channel (first, `biased`), the sleep deadline, the generation, the clock
//! and a one second ticker; a handler always runs to completion before the
//! next wait starts.

mod commands;
mod cycle;

use crate::backends::{ParamsGenerator, TrackRenderer};
use crate::clock::{probe_duration, Completion, PlaybackClock, PlaybackState};
use crate::config_ext::EngineSettings;
use crate::error::{Error, Result};
use crate::events::{EngineSnapshot, EventEnvelope, EventSink, NowPlaying, RadioEvent};
use crate::generation::GenerationSlot;
use crate::params::TrackParams;
use crate::reaction::Mood;
use crate::report::ErrorLog;
use crate::station::{Station, StationManager};
use crate::surface::PlaybackSurface;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

const TICK: Duration = Duration::from_secs(1);

/// Commands accepted by the engine task.
#[derive(Debug)]
pub enum EngineCommand {
    /// Free text from the listener.
    Reaction(String),
    Skip,
    Like,
    Dislike,
    Save,
    Pause,
    Resume,
    TogglePause,
    /// Relative seek, in seconds.
    Seek(f64),
    SetVolume(i64),
    /// The playback surface reports the end of the audible track.
    TrackEnded,
    SwitchRadio(String),
    CreateRadio {
        name: String,
        vibe: String,
    },
    DeleteRadio(String),
    /// Wipes the current station back to its first run.
    CleanRadio,
    /// First direction given to a brand new station.
    FirstVibe(String),
    SetSleep {
        minutes: u32,
    },
    CancelSleep,
    SleepStatus,
    ListRadios,
    History,
    Snapshot(oneshot::Sender<EngineSnapshot>),
    Shutdown,
}

/// What a handled command means for the wait in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    /// Nothing the current wait cares about.
    Continue,
    /// The listener acted: idle waits end, a pending parameter request is
    /// abandoned, a running generation is kept.
    Reacted,
    /// Start the cycle over (the generation was discarded or the station changed).
    Restart,
}

/// The committed track that is playing (or paused, or looping).
#[derive(Debug, Clone)]
struct QueuedTrack {
    params: TrackParams,
    artifact: PathBuf,
}

impl QueuedTrack {
    fn file_name(&self) -> String {
        self.artifact
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default()
    }
}

/// Cloneable front door to a running engine.
#[derive(Debug, Clone)]
pub struct RadioHandle {
    commands: mpsc::Sender<EngineCommand>,
    events: EventSink,
}

impl RadioHandle {
    pub async fn send(&self, command: EngineCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| Error::EngineStopped)
    }

    /// Single entry point for listener feedback; safe at any time.
    pub async fn submit_reaction(&self, text: impl Into<String>) -> Result<()> {
        self.send(EngineCommand::Reaction(text.into())).await
    }

    pub async fn snapshot(&self) -> Result<EngineSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(EngineCommand::Snapshot(tx)).await?;
        rx.await.map_err(|_| Error::EngineStopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventSink {
        &self.events
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.send(EngineCommand::Shutdown).await
    }
}

pub struct RadioEngine {
    settings: EngineSettings,
    stations: StationManager,
    station: Station,
    params_backend: Arc<dyn ParamsGenerator>,
    renderer: Arc<dyn TrackRenderer>,
    clock: PlaybackClock,
    slot: GenerationSlot,
    queued: Option<QueuedTrack>,
    events: EventSink,
    errors: ErrorLog,
    commands: mpsc::Receiver<EngineCommand>,
    /// Listener text steering the next parameter request.
    direction: String,
    pending_modifiers: Vec<String>,
    pending_mood: Option<Mood>,
    last_params: Option<TrackParams>,
    /// Oldest first, at most `settings.recent_window`.
    recent: Vec<TrackParams>,
    /// Next ready track preempts the audible one.
    interrupt_when_ready: bool,
    sleep_deadline: Option<Instant>,
    shutdown: bool,
    probe: fn(&Path) -> Option<Duration>,
}

impl RadioEngine {
    /// Builds the engine on the currently selected station.
    pub fn new(
        settings: EngineSettings,
        stations: StationManager,
        params_backend: Arc<dyn ParamsGenerator>,
        renderer: Arc<dyn TrackRenderer>,
        surface: Arc<dyn PlaybackSurface>,
        errors: ErrorLog,
    ) -> Result<(Self, RadioHandle)> {
        let station = stations.current()?;
        let (tx, rx) = mpsc::channel(settings.command_buffer.max(1));
        let events = EventSink::new(settings.event_capacity);
        let handle = RadioHandle {
            commands: tx,
            events: events.clone(),
        };
        info!(radio = %station.name(), "Radio engine ready");
        let engine = Self {
            settings,
            stations,
            station,
            params_backend,
            renderer,
            clock: PlaybackClock::new(surface),
            slot: GenerationSlot::default(),
            queued: None,
            events,
            errors,
            commands: rx,
            direction: String::new(),
            pending_modifiers: Vec::new(),
            pending_mood: None,
            last_params: None,
            recent: Vec::new(),
            interrupt_when_ready: false,
            sleep_deadline: None,
            shutdown: false,
            probe: probe_duration,
        };
        Ok((engine, handle))
    }

    /// Replaces the audio duration probe (files produced by test renderers
    /// are not real audio).
    pub fn with_probe(mut self, probe: fn(&Path) -> Option<Duration>) -> Self {
        self.probe = probe;
        self
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Runs until [`EngineCommand::Shutdown`] or until every handle is dropped.
    pub async fn run(mut self) {
        info!(radio = %self.station.name(), "Starting radio engine");
        self.emit_playback();
        if self.station.is_first_run() {
            self.events.broadcast(RadioEvent::FirstRun {
                radio: self.station.name().to_string(),
            });
        }

        while !self.shutdown {
            if let Err(err) = self.cycle().await {
                error!(radio = %self.station.name(), "Engine cycle error: {err:?}");
                self.errors.record("cycle", &self.direction, None, &err.to_string());
                self.events
                    .broadcast(RadioEvent::error("cycle", err.to_string()));
                let backoff = self.settings.cycle_error_backoff;
                self.idle(Some(backoff)).await;
            }
        }

        self.slot.discard().await;
        self.clock.stop();
        info!(radio = %self.station.name(), "Radio engine stopped");
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            radio_name: self.station.name().to_string(),
            now_playing: self.now_playing(),
            playback: self.clock.snapshot(),
            is_first_run: self.station.is_first_run(),
            generating: self.slot.is_running(),
            sleep_remaining: self.sleep_remaining().map(format_remaining),
        }
    }

    fn now_playing(&self) -> Option<NowPlaying> {
        let queued = self.queued.as_ref()?;
        let duration = self.clock.duration().map(|d| d.as_secs_f64());
        Some(NowPlaying::new(&queued.params, &queued.file_name(), duration))
    }

    fn sleep_remaining(&self) -> Option<Duration> {
        self.sleep_deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    fn emit_playback(&self) {
        self.events
            .broadcast(RadioEvent::PlaybackState(self.clock.snapshot()));
    }

    /// Forgets everything tied to the previous station or session.
    fn reset_transient(&mut self) {
        self.queued = None;
        self.last_params = None;
        self.recent.clear();
        self.direction.clear();
        self.pending_modifiers.clear();
        self.pending_mood = None;
        self.interrupt_when_ready = false;
    }

    /// Loops the current track when it ran out.
    fn keep_audible(&mut self) {
        if self.clock.state() != PlaybackState::Ended {
            return;
        }
        if self.clock.replay() {
            debug!("next track not ready, replaying the current one");
        } else {
            self.queued = None;
        }
        self.emit_playback();
    }

    fn on_clock(&mut self, completion: Completion) {
        debug!(?completion, "playback epoch completed");
    }

    fn on_tick(&mut self) {
        if self.clock.state() == PlaybackState::Playing {
            self.events.broadcast(RadioEvent::Tick {
                elapsed: round1(self.clock.elapsed().as_secs_f64()),
                duration: self.clock.duration().map(|d| round1(d.as_secs_f64())),
            });
        }
        if let Some(task) = self.slot.task().filter(|t| t.is_running()) {
            self.events.broadcast(RadioEvent::GenerationProgress {
                elapsed: round1(task.elapsed().as_secs_f64()),
            });
        }
    }

    /// Handles one received command (or the channel closing).
    async fn on_command(&mut self, command: Option<EngineCommand>) -> Flow {
        let Some(command) = command else {
            warn!("All radio handles dropped, stopping engine");
            self.shutdown = true;
            return Flow::Restart;
        };
        match self.handle_command(command).await {
            Ok(flow) => flow,
            Err(err) => {
                error!(radio = %self.station.name(), "Engine command error: {err:?}");
                self.events.broadcast(RadioEvent::toast(err.to_string()));
                Flow::Reacted
            }
        }
    }

    /// Waits for a listener action, the sleep deadline or `timeout`.
    /// Keeps the audible track looping meanwhile.
    async fn idle(&mut self, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut ticker = ticker();
        loop {
            if self.shutdown {
                return;
            }
            self.keep_audible();
            let waiter = self.clock.waiter();
            let watch_clock = self.clock.is_audible();

            tokio::select! {
                biased;
                command = self.commands.recv() => match self.on_command(command).await {
                    Flow::Continue => {}
                    Flow::Reacted | Flow::Restart => return,
                },
                _ = until(self.sleep_deadline) => return,
                _ = until(deadline) => return,
                completion = waiter.wait(), if watch_clock => self.on_clock(completion),
                _ = ticker.tick() => self.on_tick(),
            }
        }
    }
}

fn ticker() -> Interval {
    let mut ticker = interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

/// Resolves at `deadline`, never when there is none.
async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// "1h 05m", "12m 30s", "45s".
pub fn format_remaining(remaining: Duration) -> String {
    let secs = remaining.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}
