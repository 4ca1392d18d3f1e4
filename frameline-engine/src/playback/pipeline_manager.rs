//! Playback pipeline state machine
//!
//! Tracks play/pause/seek/buffering state and derives the current media time
//! from sync points: `(wall time, media time)` pairs captured whenever the
//! rate, the pause state or the time changes. Between sync points the time is
//! `media + (now - wall) * rate` while playing and constant otherwise.
//!
//! Once [`PlaybackState::Errored`] is reached every mutator is a silent no-op.
//! Status and seek callbacks always run with the state lock released, after
//! the new state and time have been stored.

use crate::media::{ClientId, PipelineClient, PlaybackState, PlayerClock};
use frameline_common::sync::TrackedMutex;
use frameline_common::{SharedClock, SyncContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Called after every state transition with the new state
pub type StatusCallback = Box<dyn Fn(PlaybackState) + Send + Sync>;

/// Called when the media time jumps; consumers flush and restart buffers
pub type SeekCallback = Box<dyn Fn() + Send + Sync>;

struct State {
    status: PlaybackState,
    prev_media_time: f64,
    prev_wall_time: Duration,
    playback_rate: f64,
    duration: Option<f64>,
    autoplay: bool,
}

impl State {
    fn time_for(&self, wall_time: Duration) -> f64 {
        if self.status != PlaybackState::Playing {
            return self.prev_media_time;
        }
        let wall_diff = wall_time.saturating_sub(self.prev_wall_time).as_secs_f64();
        let time = self.prev_media_time + wall_diff * self.playback_rate;
        self.clamp(time)
    }

    fn clamp(&self, time: f64) -> f64 {
        match self.duration {
            Some(duration) => time.min(duration),
            None => time,
        }
    }

    fn sync_point(&mut self, wall_time: Duration) {
        self.prev_media_time = self.time_for(wall_time);
        self.prev_wall_time = wall_time;
    }
}

#[derive(Default)]
struct Clients {
    next_id: ClientId,
    entries: Vec<(ClientId, Arc<dyn PipelineClient>)>,
}

/// Pipeline state plus media clock
pub struct PipelineManager {
    state: TrackedMutex<State>,
    clients: TrackedMutex<Clients>,
    clock: SharedClock,
    on_status_changed: StatusCallback,
    on_seek: SeekCallback,
}

impl PipelineManager {
    pub fn new(ctx: &SyncContext, on_status_changed: StatusCallback, on_seek: SeekCallback) -> Self {
        let clock = Arc::clone(ctx.clock());
        Self {
            state: TrackedMutex::new(
                "PipelineManager",
                Arc::clone(ctx.tracker()),
                State {
                    status: PlaybackState::Initializing,
                    prev_media_time: 0.0,
                    prev_wall_time: clock.now(),
                    playback_rate: 1.0,
                    duration: None,
                    autoplay: false,
                },
            ),
            clients: TrackedMutex::new("PipelineClients", Arc::clone(ctx.tracker()), Clients::default()),
            clock,
            on_status_changed,
            on_seek,
        }
    }

    /// Initialization data arrived; start paused, or stalled if `play` was requested
    pub fn done_initializing(&self) {
        let transition = {
            let mut state = self.state.lock();
            if state.status != PlaybackState::Initializing {
                if state.status != PlaybackState::Errored {
                    warn!("done_initializing called in state {}", state.status);
                }
                return;
            }
            let new = if state.autoplay {
                PlaybackState::Stalled
            } else {
                PlaybackState::Paused
            };
            Self::transition(&mut state, new)
        };
        self.notify(transition);
    }

    pub fn playback_state(&self) -> PlaybackState {
        self.state.lock_shared().status
    }

    /// Media duration; `None` until known
    pub fn duration(&self) -> Option<f64> {
        self.state.lock_shared().duration
    }

    /// Set the duration, seeking to it if the current time lies beyond it
    pub fn set_duration(&self, duration: Option<f64>) {
        let mut state = self.state.lock();
        if state.status == PlaybackState::Errored {
            return;
        }
        let wall_time = self.clock.now();
        let time = state.time_for(wall_time);
        state.duration = duration;
        let Some(duration) = duration else {
            return;
        };
        if time <= duration {
            return;
        }

        debug!("Duration {:.3} is before the current time; seeking", duration);
        state.prev_media_time = duration;
        state.prev_wall_time = wall_time;
        let status = state.status;
        let new = match status {
            PlaybackState::Playing | PlaybackState::Stalled => Some(PlaybackState::SeekingPlay),
            PlaybackState::Paused | PlaybackState::Ended => Some(PlaybackState::SeekingPause),
            _ => None,
        };
        let transition = new.and_then(|new| Self::transition(&mut state, new));
        drop(state);
        self.run_seek();
        self.notify(transition);
    }

    pub fn current_time(&self) -> f64 {
        let now = self.clock.now();
        self.state.lock_shared().time_for(now)
    }

    /// Seek to `time`, clamped to `[0, duration]`
    ///
    /// Ignored while initializing.
    pub fn set_current_time(&self, time: f64) {
        let mut state = self.state.lock();
        if matches!(state.status, PlaybackState::Initializing | PlaybackState::Errored) {
            return;
        }
        state.prev_media_time = state.clamp(time.max(0.0));
        state.prev_wall_time = self.clock.now();
        let status = state.status;
        let new = match status {
            PlaybackState::Playing | PlaybackState::Stalled | PlaybackState::SeekingPlay => {
                Some(PlaybackState::SeekingPlay)
            }
            PlaybackState::Paused | PlaybackState::Ended | PlaybackState::SeekingPause => {
                Some(PlaybackState::SeekingPause)
            }
            _ => None,
        };
        debug!("Seek to {:.3}", state.prev_media_time);
        let transition = new.and_then(|new| Self::transition(&mut state, new));
        drop(state);
        self.run_seek();
        self.notify(transition);
    }

    pub fn playback_rate(&self) -> f64 {
        self.state.lock_shared().playback_rate
    }

    /// Change the rate; time up to now keeps the old rate
    pub fn set_playback_rate(&self, rate: f64) {
        let old = {
            let mut state = self.state.lock();
            if state.status == PlaybackState::Errored || state.playback_rate == rate {
                return;
            }
            state.sync_point(self.clock.now());
            std::mem::replace(&mut state.playback_rate, rate)
        };
        for client in self.client_snapshot() {
            client.on_playback_rate_changed(old, rate);
        }
    }

    pub fn play(&self) {
        let mut state = self.state.lock();
        if state.status == PlaybackState::Errored {
            return;
        }
        state.sync_point(self.clock.now());
        let status = state.status;
        let transition = match status {
            // Assume stalled; the monitor moves to Playing once data is there
            PlaybackState::Paused => Self::transition(&mut state, PlaybackState::Stalled),
            PlaybackState::Ended => {
                state.prev_media_time = 0.0;
                let transition = Self::transition(&mut state, PlaybackState::SeekingPlay);
                drop(state);
                self.run_seek();
                self.notify(transition);
                return;
            }
            PlaybackState::SeekingPause => Self::transition(&mut state, PlaybackState::SeekingPlay),
            PlaybackState::Initializing => {
                state.autoplay = true;
                None
            }
            _ => None,
        };
        drop(state);
        self.notify(transition);
    }

    pub fn pause(&self) {
        let transition = {
            let mut state = self.state.lock();
            if state.status == PlaybackState::Errored {
                return;
            }
            state.sync_point(self.clock.now());
            let status = state.status;
            match status {
                PlaybackState::Playing | PlaybackState::Stalled => {
                    Self::transition(&mut state, PlaybackState::Paused)
                }
                PlaybackState::SeekingPlay => Self::transition(&mut state, PlaybackState::SeekingPause),
                PlaybackState::Initializing => {
                    state.autoplay = false;
                    None
                }
                _ => None,
            }
        };
        self.notify(transition);
    }

    /// Not enough data to keep playing
    pub fn buffering_started(&self) {
        let transition = {
            let mut state = self.state.lock();
            if state.status != PlaybackState::Playing {
                return;
            }
            state.sync_point(self.clock.now());
            Self::transition(&mut state, PlaybackState::Stalled)
        };
        self.notify(transition);
    }

    /// Enough data to play from the current time
    pub fn can_play(&self) {
        let transition = {
            let mut state = self.state.lock();
            if state.status == PlaybackState::Errored {
                return;
            }
            state.sync_point(self.clock.now());
            let status = state.status;
            match status {
                PlaybackState::Stalled | PlaybackState::SeekingPlay => {
                    Self::transition(&mut state, PlaybackState::Playing)
                }
                PlaybackState::SeekingPause => Self::transition(&mut state, PlaybackState::Paused),
                _ => None,
            }
        };
        self.notify(transition);
    }

    /// Playback reached the duration
    pub fn on_ended(&self) {
        let transition = {
            let mut state = self.state.lock();
            if matches!(state.status, PlaybackState::Ended | PlaybackState::Errored) {
                return;
            }
            let Some(duration) = state.duration else {
                warn!("on_ended called without a known duration");
                return;
            };
            state.prev_wall_time = self.clock.now();
            state.prev_media_time = duration;
            Self::transition(&mut state, PlaybackState::Ended)
        };
        self.notify(transition);
    }

    /// Enter the terminal error state; only the first call has an effect
    pub fn on_error(&self) {
        let transition = {
            let mut state = self.state.lock();
            if state.status == PlaybackState::Errored {
                return;
            }
            state.sync_point(self.clock.now());
            Self::transition(&mut state, PlaybackState::Errored)
        };
        info!("Pipeline entered the error state");
        self.notify(transition);
    }

    /// Return to `Initializing` with time 0 and unknown duration, for a new load
    ///
    /// The playback rate is kept. Ignored once errored.
    pub fn reset(&self) {
        let transition = {
            let mut state = self.state.lock();
            if state.status == PlaybackState::Errored {
                return;
            }
            state.prev_media_time = 0.0;
            state.prev_wall_time = self.clock.now();
            state.duration = None;
            state.autoplay = false;
            Self::transition(&mut state, PlaybackState::Initializing)
        };
        self.notify(transition);
    }

    pub fn add_client(&self, client: Arc<dyn PipelineClient>) -> ClientId {
        let mut clients = self.clients.lock();
        clients.next_id += 1;
        let id = clients.next_id;
        clients.entries.push((id, client));
        id
    }

    pub fn remove_client(&self, id: ClientId) {
        self.clients.lock().entries.retain(|(cid, _)| *cid != id);
    }

    fn transition(state: &mut State, new: PlaybackState) -> Option<(PlaybackState, PlaybackState)> {
        let old = state.status;
        if old == new {
            return None;
        }
        state.status = new;
        Some((old, new))
    }

    /// Run the seek callback and notify clients; the new time is already visible
    fn run_seek(&self) {
        (self.on_seek)();
        for client in self.client_snapshot() {
            client.on_seeking();
        }
    }

    fn notify(&self, transition: Option<(PlaybackState, PlaybackState)>) {
        let Some((old, new)) = transition else {
            return;
        };
        debug!("Pipeline state {} -> {}", old, new);
        (self.on_status_changed)(new);
        for client in self.client_snapshot() {
            client.on_playback_state_changed(old, new);
        }
    }

    fn client_snapshot(&self) -> Vec<Arc<dyn PipelineClient>> {
        self.clients
            .lock_shared()
            .entries
            .iter()
            .map(|(_, client)| Arc::clone(client))
            .collect()
    }
}

impl PlayerClock for PipelineManager {
    fn current_time(&self) -> f64 {
        PipelineManager::current_time(self)
    }

    fn playback_rate(&self) -> f64 {
        PipelineManager::playback_rate(self)
    }

    fn playback_state(&self) -> PlaybackState {
        PipelineManager::playback_state(self)
    }

    fn add_client(&self, client: Arc<dyn PipelineClient>) -> ClientId {
        PipelineManager::add_client(self, client)
    }

    fn remove_client(&self, id: ClientId) {
        PipelineManager::remove_client(self, id)
    }
}
