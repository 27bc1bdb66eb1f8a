use super::{format_remaining, EngineCommand, Flow, RadioEngine};
use crate::error::Result;
use crate::events::RadioEvent;
use crate::reaction::{
    clean_radio_name, is_off_topic, Command, Direction, Reaction, Signal, HELP_TEXT,
    OFF_TOPIC_REPLY,
};
use crate::station::{update_recipe, DEFAULT_STATION};
use serde_json::json;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const DISLIKE_PREFIX: &str = "Shift direction noticeably: change genre or energy. ";

impl RadioEngine {
    pub(super) async fn handle_command(&mut self, command: EngineCommand) -> Result<Flow> {
        debug!(radio = %self.station.name(), ?command, "Engine command");

        let flow = match command {
            EngineCommand::Reaction(text) => self.handle_reaction(&text).await?,
            EngineCommand::Skip => self.apply_reaction(Reaction::from_signal(Signal::Skipped)).await?,
            EngineCommand::Like => self.apply_reaction(Reaction::from_signal(Signal::Liked)).await?,
            EngineCommand::Dislike => {
                self.apply_reaction(Reaction::from_signal(Signal::Disliked)).await?
            }
            EngineCommand::Save => self.apply_reaction(Reaction::parse("save")).await?,
            EngineCommand::Pause => {
                if self.clock.pause() {
                    self.emit_playback();
                }
                Flow::Continue
            }
            EngineCommand::Resume => {
                if self.clock.resume() {
                    self.emit_playback();
                }
                Flow::Continue
            }
            EngineCommand::TogglePause => {
                if self.clock.pause() || self.clock.resume() {
                    self.emit_playback();
                }
                Flow::Continue
            }
            EngineCommand::Seek(delta) => {
                let position = self.clock.seek(delta);
                debug!(delta, position = position.as_secs_f64(), "seek");
                self.emit_playback();
                Flow::Continue
            }
            EngineCommand::SetVolume(level) => {
                self.clock.set_volume(level);
                self.emit_playback();
                Flow::Continue
            }
            EngineCommand::TrackEnded => {
                if self.clock.mark_finished() {
                    debug!("track end reported by the playback surface");
                }
                Flow::Continue
            }
            EngineCommand::SwitchRadio(name) => self.switch_station(&name).await?,
            EngineCommand::CreateRadio { name, vibe } => self.create_station(&name, &vibe).await?,
            EngineCommand::DeleteRadio(name) => self.delete_station(&name).await?,
            EngineCommand::CleanRadio => self.clean_station().await?,
            EngineCommand::FirstVibe(vibe) => self.first_vibe(&vibe),
            EngineCommand::SetSleep { minutes } => self.set_sleep(minutes),
            EngineCommand::CancelSleep => self.cancel_sleep(),
            EngineCommand::SleepStatus => {
                self.sleep_status();
                Flow::Continue
            }
            EngineCommand::ListRadios => {
                self.list_radios();
                Flow::Continue
            }
            EngineCommand::History => {
                self.history();
                Flow::Continue
            }
            EngineCommand::Snapshot(reply) => {
                // the requester may have given up
                let _ = reply.send(self.snapshot());
                Flow::Continue
            }
            EngineCommand::Shutdown => {
                info!(radio = %self.station.name(), "Shutdown requested");
                self.shutdown = true;
                Flow::Restart
            }
        };
        Ok(flow)
    }

    async fn handle_reaction(&mut self, text: &str) -> Result<Flow> {
        if is_off_topic(text) {
            self.events.broadcast(RadioEvent::toast(OFF_TOPIC_REPLY));
            return Ok(Flow::Continue);
        }
        self.apply_reaction(Reaction::parse(text)).await
    }

    /// Applies a parsed reaction: commands, then sentiment on the audible
    /// track, then the direction for the tracks to come.
    async fn apply_reaction(&mut self, reaction: Reaction) -> Result<Flow> {
        info!(radio = %self.station.name(), raw = %reaction.raw, "Reaction");
        self.events
            .broadcast(RadioEvent::ReactionFeedback(reaction.clone()));

        let mut flow = Flow::Continue;
        if let Some(command) = &reaction.command {
            flow = self.run_command(command).await?;
            if flow == Flow::Restart {
                return Ok(flow);
            }
        }

        if let Some(signal) = reaction.signal {
            self.record_signal(signal);
            match signal {
                Signal::Skipped => {
                    self.clock.stop();
                    self.queued = None;
                    self.interrupt_when_ready = true;
                    self.emit_playback();
                }
                Signal::Disliked => {
                    self.interrupt_when_ready = true;
                    self.direction = format!("{DISLIKE_PREFIX}{}", reaction.raw.trim());
                }
                Signal::Liked => {}
            }
            flow = Flow::Reacted;
        }

        for modifier in &reaction.modifiers {
            if !self.pending_modifiers.contains(modifier) {
                self.pending_modifiers.push(modifier.clone());
            }
            if let Err(err) = self.station.taste().note(modifier) {
                warn!("Cannot save preference: {err:#}");
            }
        }
        if reaction.mood.is_some() {
            self.pending_mood = reaction.mood;
        }
        if reaction.mood.is_some() || reaction.direction == Some(Direction::Reset) {
            if let Err(err) = self.station.taste().set_direction(&reaction.raw) {
                warn!("Cannot save direction: {err:#}");
            }
        }

        if reaction.command.is_none()
            && reaction.signal != Some(Signal::Disliked)
            && !reaction.raw.trim().is_empty()
        {
            self.direction = reaction.raw.trim().to_string();
        }

        if reaction.wants_change() {
            if let Some(dropped) = self.slot.discard().await {
                info!(track_id = %dropped.id, "Discarded the pending track");
            }
            self.events.broadcast(RadioEvent::Regenerating {
                reason: reaction.raw.clone(),
            });
            return Ok(Flow::Restart);
        }
        if !reaction.is_pure_command() && flow == Flow::Continue {
            flow = Flow::Reacted;
        }
        Ok(flow)
    }

    /// Sentiment goes to the audible track, never the one being rendered.
    fn record_signal(&self, signal: Signal) {
        let Some(queued) = &self.queued else {
            debug!(?signal, "no audible track to react to");
            return;
        };
        if let Err(err) = self.station.taste().record(signal, &queued.params) {
            warn!("Cannot record reaction: {err:#}");
        }
        let reaction = match signal {
            Signal::Liked => "liked",
            Signal::Disliked => "disliked",
            Signal::Skipped => "skipped",
        };
        if let Err(err) = update_recipe(&queued.artifact, json!({ "reaction": reaction })) {
            debug!(artifact = %queued.artifact.display(), "Cannot update recipe: {err}");
        }
    }

    async fn run_command(&mut self, command: &Command) -> Result<Flow> {
        let flow = match command {
            Command::Quit => {
                if self.clock.pause() {
                    self.emit_playback();
                }
                self.events
                    .broadcast(RadioEvent::toast("Paused. Say anything to start again."));
                Flow::Reacted
            }
            Command::ListRadios => {
                self.list_radios();
                Flow::Continue
            }
            Command::SwitchRadio { radio } => self.switch_station(radio).await?,
            Command::CreateRadio { radio } => self.create_station(radio, "").await?,
            Command::DeleteRadio { radio } => self.delete_station(radio).await?,
            Command::Save => {
                self.save_current();
                Flow::Reacted
            }
            Command::What => {
                if let Some(now_playing) = self.now_playing() {
                    self.events.broadcast(RadioEvent::TrackInfo(now_playing));
                } else {
                    self.events.broadcast(RadioEvent::toast("Nothing playing yet."));
                }
                Flow::Continue
            }
            Command::History => {
                self.history();
                Flow::Continue
            }
            Command::Share => {
                let message = match &self.queued {
                    Some(queued) => format!(
                        "Share this track: /audio/{}/{}",
                        self.station.name(),
                        queued.file_name()
                    ),
                    None => "Nothing to share yet.".to_string(),
                };
                self.events.broadcast(RadioEvent::toast(message));
                Flow::Continue
            }
            Command::OpenFolder => {
                self.events.broadcast(RadioEvent::toast(format!(
                    "Tracks are in {}",
                    self.station.tracks_dir().display()
                )));
                Flow::Continue
            }
            Command::Help => {
                self.events.broadcast(RadioEvent::toast(HELP_TEXT));
                Flow::Continue
            }
            Command::SleepTimer { minutes } => self.set_sleep(*minutes),
            Command::CancelSleep => self.cancel_sleep(),
            Command::SleepStatus => {
                self.sleep_status();
                Flow::Continue
            }
        };
        Ok(flow)
    }

    fn save_current(&self) {
        let Some(queued) = &self.queued else {
            self.events.broadcast(RadioEvent::toast("No track to save yet."));
            return;
        };
        match self.station.mark_favorite(&queued.artifact) {
            Ok(dest) => {
                if let Err(err) = update_recipe(
                    &queued.artifact,
                    json!({ "reaction": "liked", "favorited": true }),
                ) {
                    debug!("Cannot update recipe: {err}");
                }
                // the favourite copy carries the same flags
                let _ = update_recipe(&dest, json!({ "reaction": "liked", "favorited": true }));
                info!(favorite = %dest.display(), "Saved to favorites");
                self.events.broadcast(RadioEvent::toast(format!(
                    "Saved to favorites: {}",
                    queued.file_name()
                )));
            }
            Err(err) => {
                warn!("Cannot save favorite: {err}");
                self.events
                    .broadcast(RadioEvent::toast(format!("Could not save: {err}")));
            }
        }
    }

    fn list_radios(&self) {
        self.events.broadcast(RadioEvent::RadioList {
            radios: self.stations.summaries(),
            current: self.station.name().to_string(),
        });
    }

    fn history(&self) {
        self.events.broadcast(RadioEvent::History {
            radio: self.station.name().to_string(),
            tracks: self.station.history(10),
        });
    }

    /// Hard reset onto another station (created when missing).
    async fn switch_station(&mut self, name: &str) -> Result<Flow> {
        let name = clean_radio_name(name);
        if name.is_empty() {
            self.events
                .broadcast(RadioEvent::toast("That is not a valid radio name."));
            return Ok(Flow::Continue);
        }
        if name == self.station.name() {
            self.events
                .broadcast(RadioEvent::toast(format!("Already on '{name}'.")));
            return Ok(Flow::Continue);
        }

        let is_new = !self.stations.exists(&name);
        self.slot.discard().await;
        self.clock.stop();
        self.station = self.stations.switch_to(&name)?;
        self.reset_transient();
        info!(radio = %name, is_new, "Switched radio");

        self.events
            .broadcast(RadioEvent::RadioSwitched { name, is_new });
        self.emit_playback();
        if self.station.is_first_run() {
            self.events.broadcast(RadioEvent::FirstRun {
                radio: self.station.name().to_string(),
            });
        }
        Ok(Flow::Restart)
    }

    async fn create_station(&mut self, name: &str, vibe: &str) -> Result<Flow> {
        let flow = self.switch_station(name).await?;
        if flow == Flow::Restart && !vibe.trim().is_empty() {
            self.first_vibe(vibe);
        }
        Ok(flow)
    }

    async fn delete_station(&mut self, name: &str) -> Result<Flow> {
        let name = clean_radio_name(name);
        if !self.stations.exists(&name) {
            self.events
                .broadcast(RadioEvent::toast(format!("No radio named '{name}'.")));
            return Ok(Flow::Continue);
        }

        let was_current = name == self.station.name();
        if was_current {
            self.slot.discard().await;
            self.clock.stop();
        }
        self.stations.delete(&name)?;
        info!(radio = %name, "Deleted radio");
        self.events
            .broadcast(RadioEvent::toast(format!("Deleted radio '{name}'")));

        if !was_current {
            return Ok(Flow::Continue);
        }
        self.station = self.stations.switch_to(DEFAULT_STATION)?;
        self.reset_transient();
        self.events.broadcast(RadioEvent::RadioSwitched {
            name: self.station.name().to_string(),
            is_new: false,
        });
        self.emit_playback();
        if self.station.is_first_run() {
            self.events.broadcast(RadioEvent::FirstRun {
                radio: self.station.name().to_string(),
            });
        }
        Ok(Flow::Restart)
    }

    /// Forgets taste, tracks and favourites of the current station.
    async fn clean_station(&mut self) -> Result<Flow> {
        self.slot.discard().await;
        self.clock.stop();
        self.station.full_reset()?;
        self.reset_transient();
        info!(radio = %self.station.name(), "Radio cleaned");
        self.emit_playback();
        self.events.broadcast(RadioEvent::toast(format!(
            "Radio '{}' starts from scratch.",
            self.station.name()
        )));
        self.events.broadcast(RadioEvent::FirstRun {
            radio: self.station.name().to_string(),
        });
        Ok(Flow::Restart)
    }

    fn first_vibe(&mut self, vibe: &str) -> Flow {
        let vibe = vibe.trim();
        if vibe.is_empty() {
            return Flow::Continue;
        }
        let taste = self.station.taste();
        if let Err(err) = taste.note(vibe).and_then(|()| taste.set_direction(vibe)) {
            warn!("Cannot save first vibe: {err:#}");
        }
        self.direction = vibe.to_string();
        info!(radio = %self.station.name(), vibe, "First vibe");
        Flow::Restart
    }

    fn set_sleep(&mut self, minutes: u32) -> Flow {
        if minutes == 0 {
            return self.cancel_sleep();
        }
        let duration = Duration::from_secs(u64::from(minutes) * 60);
        self.sleep_deadline = Some(Instant::now() + duration);
        info!(minutes, "Sleep timer set");
        self.events.broadcast(RadioEvent::SleepSet {
            minutes,
            remaining: format_remaining(duration),
        });
        Flow::Reacted
    }

    fn cancel_sleep(&mut self) -> Flow {
        if self.sleep_deadline.take().is_some() {
            info!("Sleep timer cancelled");
            self.events.broadcast(RadioEvent::SleepCancelled);
        } else {
            self.events
                .broadcast(RadioEvent::toast("No sleep timer set."));
        }
        Flow::Reacted
    }

    fn sleep_status(&self) {
        let remaining = self.sleep_remaining();
        self.events.broadcast(RadioEvent::SleepStatus {
            active: remaining.is_some(),
            remaining: remaining.map(format_remaining),
        });
    }
}
