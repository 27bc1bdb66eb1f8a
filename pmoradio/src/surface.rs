//! Playback surfaces: whatever actually makes sound.
//!
//! The [`PlaybackClock`](crate::PlaybackClock) owns the timeline and drives a
//! surface with plain commands. A surface may also report "track ended" on
//! its own (browser `ended` event); the host forwards that report to the
//! engine as [`EngineCommand::TrackEnded`](crate::EngineCommand::TrackEnded).

use std::path::Path;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Receives transport commands from the playback clock.
///
/// Calls are synchronous and must not block: implementations spawn or signal
/// and return immediately.
pub trait PlaybackSurface: Send + Sync {
    fn start(&self, path: &Path, offset: Duration);
    fn pause(&self);
    fn resume(&self, path: &Path, offset: Duration);
    fn stop(&self);
    fn set_volume(&self, _level: u8) {}
}

/// Surface for remote (browser) playback: the clients render audio from the
/// broadcast events, so nothing happens locally.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentSurface;

impl PlaybackSurface for SilentSurface {
    fn start(&self, _path: &Path, _offset: Duration) {}
    fn pause(&self) {}
    fn resume(&self, _path: &Path, _offset: Duration) {}
    fn stop(&self) {}
}

/// Plays through an external command line player.
///
/// The template is split on whitespace; `{path}` and `{offset}` (seconds,
/// fractional) are substituted per argument, e.g.
/// `ffplay -nodisp -autoexit -loglevel quiet -ss {offset} {path}`.
/// Pausing kills the process, resuming respawns it at the frozen position.
pub struct CommandSurface {
    template: Vec<String>,
    child: Mutex<Option<Child>>,
}

impl CommandSurface {
    /// Returns `None` for an empty template.
    pub fn new(template: &str) -> Option<Self> {
        let template: Vec<String> = template.split_whitespace().map(str::to_string).collect();
        if template.is_empty() {
            return None;
        }
        Some(Self {
            template,
            child: Mutex::new(None),
        })
    }

    fn args_for(&self, path: &Path, offset: Duration) -> Vec<String> {
        let path = path.to_string_lossy();
        let offset = format!("{:.2}", offset.as_secs_f64());
        self.template
            .iter()
            .map(|arg| arg.replace("{path}", &path).replace("{offset}", &offset))
            .collect()
    }

    fn kill_current(&self) {
        let mut guard = self.child.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(mut child) = guard.take() {
            if let Err(err) = child.start_kill() {
                debug!("player process already gone: {err}");
            }
        }
    }

    fn spawn(&self, path: &Path, offset: Duration) {
        self.kill_current();
        let args = self.args_for(path, offset);
        let Some((program, rest)) = args.split_first() else {
            return;
        };
        let spawned = Command::new(program)
            .args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Ok(child) => {
                debug!(program = %program, offset = ?offset, "player started");
                *self.child.lock().unwrap_or_else(|p| p.into_inner()) = Some(child);
            }
            Err(err) => warn!(program = %program, "failed to start player: {err}"),
        }
    }
}

impl PlaybackSurface for CommandSurface {
    fn start(&self, path: &Path, offset: Duration) {
        self.spawn(path, offset);
    }

    fn pause(&self) {
        self.kill_current();
    }

    fn resume(&self, path: &Path, offset: Duration) {
        self.spawn(path, offset);
    }

    fn stop(&self) {
        self.kill_current();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_surface_substitutes_placeholders() {
        let surface = CommandSurface::new("ffplay -nodisp -ss {offset} {path}").unwrap();
        let args = surface.args_for(Path::new("/tmp/a b.mp3"), Duration::from_millis(12_500));
        assert_eq!(args, vec!["ffplay", "-nodisp", "-ss", "12.50", "/tmp/a b.mp3"]);
    }

    #[test]
    fn test_empty_template_is_rejected() {
        assert!(CommandSurface::new("   ").is_none());
    }
}
