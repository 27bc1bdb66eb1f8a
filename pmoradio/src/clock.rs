//! Playback clock.
//!
//! Tracks the position of the audible artefact without decoding it. Every
//! `play`/`seek`/`replay` opens a new *epoch*; each epoch resolves at most
//! once, to [`Completion::Finished`] (its timer expired or the surface
//! reported the end), [`Completion::Stopped`], or implicitly
//! [`Completion::Superseded`] when a newer epoch starts. A timer armed for an
//! old epoch can never complete the current one.

use crate::surface::PlaybackSurface;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// Seeking never lands closer than this to the end of a track.
pub const SEEK_END_MARGIN: Duration = Duration::from_millis(500);
/// Seek ceiling when the duration is unknown.
pub const MAX_UNKNOWN_POSITION: Duration = Duration::from_secs(24 * 3600);

/// An end report this early in an epoch is an echo of the previous one.
const STALE_END_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaybackState {
    Idle,
    Playing,
    Paused,
    Ended,
}

/// How an epoch of playback came to an end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Finished,
    Superseded,
    Stopped,
}

#[derive(Debug, Clone, Copy, Default)]
struct ClockSignal {
    epoch: u64,
    completion: Option<Completion>,
}

/// Owned handle resolving when the epoch it was taken in completes.
#[derive(Debug)]
pub struct CompletionWaiter {
    rx: watch::Receiver<ClockSignal>,
    epoch: u64,
}

impl CompletionWaiter {
    pub async fn wait(mut self) -> Completion {
        loop {
            let seen = *self.rx.borrow_and_update();
            if seen.epoch != self.epoch {
                return Completion::Superseded;
            }
            if let Some(completion) = seen.completion {
                return completion;
            }
            if self.rx.changed().await.is_err() {
                return Completion::Stopped;
            }
        }
    }
}

/// Snapshot of the transport, as broadcast in `playback_state`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlaybackSnapshot {
    pub state: PlaybackState,
    pub playing: bool,
    pub paused: bool,
    pub elapsed: f64,
    pub duration: Option<f64>,
    pub volume: u8,
    pub has_track: bool,
}

pub struct PlaybackClock {
    current: Option<PathBuf>,
    duration: Option<Duration>,
    /// Instant at which the clock was (re)started at `offset`.
    started_at: Option<Instant>,
    offset: Duration,
    paused_at: Option<Instant>,
    total_paused: Duration,
    volume: u8,
    epoch: u64,
    signal: Arc<watch::Sender<ClockSignal>>,
    timer: Option<AbortHandle>,
    surface: Arc<dyn PlaybackSurface>,
}

impl PlaybackClock {
    pub fn new(surface: Arc<dyn PlaybackSurface>) -> Self {
        let (tx, _rx) = watch::channel(ClockSignal::default());
        Self {
            current: None,
            duration: None,
            started_at: None,
            offset: Duration::ZERO,
            paused_at: None,
            total_paused: Duration::ZERO,
            volume: 80,
            epoch: 0,
            signal: Arc::new(tx),
            timer: None,
            surface,
        }
    }

    /// Starts `artifact` from the beginning, superseding whatever was audible.
    ///
    /// With an unknown `duration` no timer is armed: only an explicit
    /// [`mark_finished`](Self::mark_finished) can end the epoch.
    pub fn play(&mut self, artifact: &Path, duration: Option<Duration>) {
        self.current = Some(artifact.to_path_buf());
        self.duration = duration;
        self.restart_at(Duration::ZERO, false);
        self.surface.start(artifact, Duration::ZERO);
        debug!(artifact = %artifact.display(), ?duration, epoch = self.epoch, "clock play");
    }

    /// Restarts the current artefact from zero with the same duration.
    pub fn replay(&mut self) -> bool {
        let Some(path) = self.current.clone() else {
            return false;
        };
        if !path.exists() {
            debug!(artifact = %path.display(), "artifact vanished, stopping instead of replaying");
            self.stop();
            return false;
        }
        let duration = self.duration;
        self.play(&path, duration);
        true
    }

    pub fn pause(&mut self) -> bool {
        if self.state() != PlaybackState::Playing {
            return false;
        }
        self.paused_at = Some(Instant::now());
        self.disarm();
        self.surface.pause();
        true
    }

    pub fn resume(&mut self) -> bool {
        if self.state() != PlaybackState::Paused {
            return false;
        }
        if let Some(paused_at) = self.paused_at.take() {
            self.total_paused += Instant::now().saturating_duration_since(paused_at);
        }
        self.arm();
        if let Some(path) = &self.current {
            self.surface.resume(path, self.elapsed());
        }
        true
    }

    /// Moves the position by `delta` seconds, clamped to
    /// `[0, duration - SEEK_END_MARGIN]` (or [`MAX_UNKNOWN_POSITION`]).
    /// A non-finite delta is ignored. Keeps the paused state.
    /// Returns the new position.
    pub fn seek(&mut self, delta: f64) -> Duration {
        let Some(path) = self.current.clone() else {
            return Duration::ZERO;
        };
        let current = self.elapsed();
        if !delta.is_finite() {
            return current;
        }
        let mut target = (current.as_secs_f64() + delta).max(0.0);
        let last = match self.duration {
            Some(duration) => duration.saturating_sub(SEEK_END_MARGIN),
            None => MAX_UNKNOWN_POSITION,
        };
        target = target.min(last.as_secs_f64());
        let Ok(target) = Duration::try_from_secs_f64(target.max(0.0)) else {
            return current;
        };
        let paused = self.state() == PlaybackState::Paused;

        self.restart_at(target, paused);
        if !paused {
            self.surface.start(&path, target);
        }
        target
    }

    /// Tears down the timer, releases any waiter with `Stopped` and forgets the artefact.
    pub fn stop(&mut self) {
        self.disarm();
        self.signal.send_if_modified(|s| {
            if s.completion.is_none() {
                s.completion = Some(Completion::Stopped);
                true
            } else {
                false
            }
        });
        if self.current.take().is_some() {
            self.surface.stop();
        }
        self.duration = None;
        self.started_at = None;
        self.offset = Duration::ZERO;
        self.paused_at = None;
        self.total_paused = Duration::ZERO;
    }

    /// Completes the current epoch from an external end report.
    ///
    /// Reports arriving right after a restart are echoes of the previous
    /// epoch and are ignored.
    pub fn mark_finished(&mut self) -> bool {
        if !matches!(self.state(), PlaybackState::Playing | PlaybackState::Paused) {
            return false;
        }
        if self.elapsed() < STALE_END_GRACE
            && self.duration.map_or(true, |d| d > STALE_END_GRACE * 2)
        {
            debug!(epoch = self.epoch, "ignoring stale end report");
            return false;
        }
        self.disarm();
        // freezes `elapsed` when the duration is unknown
        self.paused_at.get_or_insert_with(Instant::now);
        Self::complete(&self.signal, self.epoch, Completion::Finished)
    }

    pub fn state(&self) -> PlaybackState {
        if self.current.is_none() {
            return PlaybackState::Idle;
        }
        let signal = *self.signal.borrow();
        if signal.epoch == self.epoch && signal.completion == Some(Completion::Finished) {
            return PlaybackState::Ended;
        }
        if self.paused_at.is_some() {
            PlaybackState::Paused
        } else {
            PlaybackState::Playing
        }
    }

    /// Playing or paused: something is (or will resume being) audible.
    pub fn is_audible(&self) -> bool {
        matches!(self.state(), PlaybackState::Playing | PlaybackState::Paused)
    }

    /// Position in the current artefact, clamped to `[0, duration]`.
    pub fn elapsed(&self) -> Duration {
        let Some(started_at) = self.started_at else {
            return Duration::ZERO;
        };
        if self.state() == PlaybackState::Ended {
            if let Some(duration) = self.duration {
                return duration;
            }
        }
        let now = self.paused_at.unwrap_or_else(Instant::now);
        let running = now
            .saturating_duration_since(started_at)
            .saturating_sub(self.total_paused);
        let position = self.offset.saturating_add(running);
        match self.duration {
            Some(duration) => position.min(duration),
            None => position,
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    pub fn current(&self) -> Option<&Path> {
        self.current.as_deref()
    }

    pub fn volume(&self) -> u8 {
        self.volume
    }

    pub fn set_volume(&mut self, level: i64) -> u8 {
        self.volume = level.clamp(0, 100) as u8;
        self.surface.set_volume(self.volume);
        self.volume
    }

    /// Waiter for the current epoch.
    pub fn waiter(&self) -> CompletionWaiter {
        CompletionWaiter {
            rx: self.signal.subscribe(),
            epoch: self.epoch,
        }
    }

    pub fn snapshot(&self) -> PlaybackSnapshot {
        let state = self.state();
        PlaybackSnapshot {
            state,
            playing: state == PlaybackState::Playing,
            paused: state == PlaybackState::Paused,
            elapsed: round1(self.elapsed().as_secs_f64()),
            duration: self.duration.map(|d| round1(d.as_secs_f64())),
            volume: self.volume,
            has_track: self.current.is_some(),
        }
    }

    fn restart_at(&mut self, position: Duration, paused: bool) {
        let now = Instant::now();
        self.epoch += 1;
        let epoch = self.epoch;
        self.signal.send_replace(ClockSignal {
            epoch,
            completion: None,
        });
        self.started_at = Some(now);
        self.offset = position;
        self.total_paused = Duration::ZERO;
        self.paused_at = paused.then_some(now);
        if paused {
            self.disarm();
        } else {
            self.arm();
        }
    }

    fn arm(&mut self) {
        self.disarm();
        let Some(duration) = self.duration else {
            return;
        };
        let remaining = duration.saturating_sub(self.elapsed());
        let signal = Arc::clone(&self.signal);
        let epoch = self.epoch;
        let handle = tokio::spawn(async move {
            sleep(remaining).await;
            Self::complete(&signal, epoch, Completion::Finished);
        });
        self.timer = Some(handle.abort_handle());
    }

    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn complete(signal: &watch::Sender<ClockSignal>, epoch: u64, completion: Completion) -> bool {
        signal.send_if_modified(|s| {
            if s.epoch == epoch && s.completion.is_none() {
                s.completion = Some(completion);
                true
            } else {
                false
            }
        })
    }
}

impl Drop for PlaybackClock {
    fn drop(&mut self) {
        self.disarm();
        if self.current.is_some() {
            self.surface.stop();
        }
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Reads the duration of an audio file from its container, without decoding.
///
/// Falls back to summing packet durations when the header carries no frame
/// count (VBR MP3 without a Xing header). Returns `None` for unreadable files.
pub fn probe_duration(path: &Path) -> Option<Duration> {
    use symphonia::core::codecs::CODEC_TYPE_NULL;
    use symphonia::core::formats::FormatOptions;
    use symphonia::core::io::MediaSourceStream;
    use symphonia::core::meta::MetadataOptions;
    use symphonia::core::probe::Hint;

    let file = std::fs::File::open(path).ok()?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .ok()?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    let seconds = |frames: u64| -> Option<f64> {
        if let Some(tb) = params.time_base {
            let time = tb.calc_time(frames);
            return Some(time.seconds as f64 + time.frac);
        }
        params.sample_rate.map(|rate| frames as f64 / rate as f64)
    };

    if let Some(frames) = params.n_frames {
        return seconds(frames).map(Duration::from_secs_f64);
    }

    let mut total = 0u64;
    while let Ok(packet) = format.next_packet() {
        if packet.track_id() == track_id {
            total += packet.dur;
        }
    }
    if total == 0 {
        return None;
    }
    seconds(total).map(Duration::from_secs_f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::surface::SilentSurface;
    use tokio::time::advance;
    use tokio_test::{assert_pending, task};

    fn clock() -> PlaybackClock {
        PlaybackClock::new(Arc::new(SilentSurface))
    }

    fn artifact(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, b"audio").unwrap();
        path
    }

    fn secs(d: Duration) -> f64 {
        d.as_secs_f64()
    }

    #[tokio::test(start_paused = true)]
    async fn test_elapsed_freezes_while_paused() {
        let dir = tempfile::tempdir().unwrap();
        let mut clock = clock();
        clock.play(&artifact(&dir, "a.mp3"), Some(Duration::from_secs(120)));

        advance(Duration::from_secs(10)).await;
        assert!(clock.pause());
        assert!(!clock.pause());
        let frozen = clock.elapsed();
        advance(Duration::from_secs(30)).await;
        assert_eq!(clock.elapsed(), frozen);
        assert_eq!(clock.state(), PlaybackState::Paused);

        assert!(clock.resume());
        advance(Duration::from_secs(5)).await;
        assert!((secs(clock.elapsed()) - 15.0).abs() < 0.01);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_for_remaining_time_after_resume() {
        let dir = tempfile::tempdir().unwrap();
        let mut clock = clock();
        clock.play(&artifact(&dir, "a.mp3"), Some(Duration::from_secs(20)));
        let waiter = clock.waiter();

        advance(Duration::from_secs(15)).await;
        clock.pause();
        advance(Duration::from_secs(60)).await;
        assert_eq!(clock.state(), PlaybackState::Paused);

        clock.resume();
        let mut wait = task::spawn(waiter.wait());
        assert_pending!(wait.poll());

        advance(Duration::from_secs(6)).await;
        assert_eq!(wait.await, Completion::Finished);
        assert_eq!(clock.state(), PlaybackState::Ended);
        assert_eq!(clock.elapsed(), Duration::from_secs(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_round_trip_and_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let mut clock = clock();
        clock.play(&artifact(&dir, "a.mp3"), Some(Duration::from_secs(120)));
        advance(Duration::from_secs(30)).await;

        let before = secs(clock.elapsed());
        clock.seek(5.0);
        clock.seek(-5.0);
        assert!((secs(clock.elapsed()) - before).abs() < 0.01);

        assert_eq!(clock.seek(-500.0), Duration::ZERO);
        assert_eq!(clock.seek(500.0), Duration::from_millis(119_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_while_paused_stays_paused() {
        let dir = tempfile::tempdir().unwrap();
        let mut clock = clock();
        clock.play(&artifact(&dir, "a.mp3"), Some(Duration::from_secs(60)));
        advance(Duration::from_secs(10)).await;
        clock.pause();

        clock.seek(20.0);
        assert_eq!(clock.state(), PlaybackState::Paused);
        advance(Duration::from_secs(100)).await;
        assert!((secs(clock.elapsed()) - 30.0).abs() < 0.01);
        assert_eq!(clock.state(), PlaybackState::Paused);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_epoch_supersedes_stale_timer() {
        let dir = tempfile::tempdir().unwrap();
        let mut clock = clock();
        let a = artifact(&dir, "a.mp3");
        clock.play(&a, Some(Duration::from_secs(10)));
        let first = clock.waiter();

        advance(Duration::from_secs(8)).await;
        clock.replay();
        assert_eq!(first.wait().await, Completion::Superseded);

        // the first arm would have fired at t=10
        advance(Duration::from_secs(4)).await;
        assert_eq!(clock.state(), PlaybackState::Playing);

        let second = clock.waiter();
        advance(Duration::from_secs(7)).await;
        assert_eq!(second.wait().await, Completion::Finished);
        assert_eq!(clock.state(), PlaybackState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_releases_waiter_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut clock = clock();
        clock.play(&artifact(&dir, "a.mp3"), Some(Duration::from_secs(10)));
        let waiter = clock.waiter();

        clock.stop();
        assert_eq!(waiter.wait().await, Completion::Stopped);
        assert_eq!(clock.state(), PlaybackState::Idle);
        assert!(clock.current().is_none());
        assert_eq!(clock.elapsed(), Duration::ZERO);

        advance(Duration::from_secs(30)).await;
        assert_eq!(clock.state(), PlaybackState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_duration_never_ends_on_its_own() {
        let dir = tempfile::tempdir().unwrap();
        let mut clock = clock();
        clock.play(&artifact(&dir, "a.mp3"), None);

        advance(Duration::from_secs(3600)).await;
        assert_eq!(clock.state(), PlaybackState::Playing);

        assert!(clock.mark_finished());
        assert_eq!(clock.state(), PlaybackState::Ended);
    }

    #[tokio::test(start_paused = true)]
    async fn test_seek_without_duration_rejects_huge_deltas() {
        let dir = tempfile::tempdir().unwrap();
        let mut clock = clock();
        clock.play(&artifact(&dir, "a.mp3"), None);
        advance(Duration::from_secs(10)).await;

        assert_eq!(clock.seek(f64::NAN), Duration::from_secs(10));
        assert_eq!(clock.seek(f64::INFINITY), Duration::from_secs(10));
        assert_eq!(clock.seek(30.0), Duration::from_secs(40));
        assert_eq!(clock.seek(1e20), MAX_UNKNOWN_POSITION);
        assert_eq!(clock.state(), PlaybackState::Playing);

        advance(Duration::from_secs(5)).await;
        assert_eq!(clock.elapsed(), MAX_UNKNOWN_POSITION + Duration::from_secs(5));
        assert_eq!(clock.seek(-1e20), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_end_report_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut clock = clock();
        clock.play(&artifact(&dir, "a.mp3"), Some(Duration::from_secs(120)));
        advance(Duration::from_millis(500)).await;
        assert!(!clock.mark_finished());
        assert_eq!(clock.state(), PlaybackState::Playing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_of_deleted_artifact_stops() {
        let dir = tempfile::tempdir().unwrap();
        let mut clock = clock();
        let a = artifact(&dir, "a.mp3");
        clock.play(&a, Some(Duration::from_secs(10)));
        std::fs::remove_file(&a).unwrap();

        assert!(!clock.replay());
        assert_eq!(clock.state(), PlaybackState::Idle);
    }

    #[test]
    fn test_volume_is_clamped() {
        let mut clock = clock();
        assert_eq!(clock.set_volume(140), 100);
        assert_eq!(clock.set_volume(-3), 0);
    }

    #[test]
    fn test_probe_wav_duration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tone.wav");
        let rate: u32 = 8000;
        let data_len: u32 = rate * 2;

        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        wav.extend_from_slice(&(36 + data_len).to_le_bytes());
        wav.extend_from_slice(b"WAVEfmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
        wav.extend_from_slice(&1u16.to_le_bytes()); // mono
        wav.extend_from_slice(&rate.to_le_bytes());
        wav.extend_from_slice(&rate.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&8u16.to_le_bytes());
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&data_len.to_le_bytes());
        wav.extend(std::iter::repeat(128u8).take(data_len as usize));
        std::fs::write(&path, wav).unwrap();

        let duration = probe_duration(&path).unwrap();
        assert!((duration.as_secs_f64() - 2.0).abs() < 0.01);

        assert!(probe_duration(&dir.path().join("missing.mp3")).is_none());
    }
}
