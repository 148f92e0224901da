//! Script runner: projects the installed script into per-screen timelines.
//!
//! Once per main-loop tick, `update` evaluates every scripted screen over a
//! short look-ahead horizon and hands the resulting timeline to that
//! screen's frame player. Players are started lazily the first time a
//! script references their connector and torn down with the runner.
//!
//! Timeline keys sit on a fixed grid (multiples of the screen's update
//! period on the monotonic clock), so consecutive ticks re-derive identical
//! keys for the overlapping span and the player's wakeup suppression does
//! its job.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{debug, info, trace, warn};

use crate::clock::{Clock, MonoTime};
use crate::display::{
    DisplayAtom, DisplayDriver, DisplayLayer, DisplayMode, DriverError, Rect, Screen,
};
use crate::mainloop::ScriptTick;
use crate::media::{FileInfo, MediaError, MediaSource};
use crate::player::{start_frame_player, FramePlayer, PlayerFault};
use crate::script::{Curve, ModeRequest, ScreenScript, Script};
use crate::timeline::Timeline;

/// How far ahead of the current instant timelines are populated, in
/// main-loop periods. Two periods ride out one late tick.
const HORIZON_PERIODS: f64 = 2.0;

/// Everything the runner needs from the outside world.
pub struct RunnerContext {
    pub clock: Arc<dyn Clock>,
    pub driver: Arc<dyn DisplayDriver>,
    pub media: Arc<dyn MediaSource>,
    /// Fills scripts that do not carry their own `zero_time`.
    pub default_zero_time: f64,
}

struct PlayerSlot {
    player: Box<dyn FramePlayer>,
    mode: DisplayMode,
}

pub struct ScriptRunner {
    cx: RunnerContext,
    /// Connector inventory, scanned once at startup.
    screens: Vec<Screen>,
    /// Live players keyed by connector name.
    players: HashMap<String, PlayerSlot>,
    fault_tx: Sender<PlayerFault>,
    /// Media paths already complained about, to keep the log readable.
    missing_warned: HashSet<String>,
}

impl ScriptRunner {
    pub fn new(cx: RunnerContext, fault_tx: Sender<PlayerFault>) -> Result<ScriptRunner, DriverError> {
        let screens = cx.driver.scan_screens()?;
        info!(
            "Script runner ready: {} connector(s): {}",
            screens.len(),
            screens
                .iter()
                .map(|s| s.connector.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(ScriptRunner {
            cx,
            screens,
            players: HashMap::new(),
            fault_tx,
            missing_warned: HashSet::new(),
        })
    }

    /// Probe a media file for the control plane.
    pub fn file_info(&self, path: &str) -> Result<FileInfo, MediaError> {
        self.cx.media.file_info(path)
    }

    /// Live connector scan for the control plane.
    pub fn screens(&self) -> Result<Vec<Screen>, DriverError> {
        self.cx.driver.scan_screens()
    }

    /// Deadline of the most recently realized atom on `screen`, if a player
    /// is running there.
    pub fn last_shown(&self, screen: &str) -> Option<MonoTime> {
        self.players.get(screen).map(|slot| slot.player.last_shown())
    }

    /// Tear down every frame player, joining their threads. Called by the
    /// supervisor after the main loop has stopped ticking.
    pub fn shutdown(&mut self) {
        if !self.players.is_empty() {
            info!("Stopping {} frame player(s)", self.players.len());
            self.players.clear();
        }
    }

    /// One tick: evaluate `script` and hand each screen its timeline.
    /// Screens that dropped out of the script get an explicit empty one.
    pub fn update(&mut self, script: &Script) {
        let now = self.cx.clock.now();
        let zero_time = script.zero_time.unwrap_or(self.cx.default_zero_time);
        let script_now = self.cx.clock.real() - zero_time;
        let horizon =
            Duration::from_secs_f64(HORIZON_PERIODS / script.main_loop_hz.max(f64::MIN_POSITIVE));
        trace!("Runner tick: mono={} script_t={:.3}s", now, script_now);

        for (name, screen_script) in &script.screens {
            let Some(mode) = self.ensure_player(name, screen_script.mode) else {
                continue;
            };
            let timeline = build_timeline(
                screen_script,
                mode,
                self.cx.media.as_ref(),
                now,
                script_now,
                horizon,
                &mut self.missing_warned,
            );
            debug!("Screen {}: {} atom(s) toward {}", name, timeline.len(), now + horizon);
            self.players[name].player.set_timeline(timeline);
        }

        for (name, slot) in &self.players {
            if !script.screens.contains_key(name) {
                slot.player.set_timeline(Timeline::new());
            }
        }
    }

    /// Make sure a player runs on `name` in a mode satisfying `request`.
    /// Returns the mode in force, or None when the screen cannot be driven
    /// (unknown connector, unadvertised mode) — both warn-and-skip cases.
    fn ensure_player(&mut self, name: &str, request: Option<ModeRequest>) -> Option<DisplayMode> {
        let screen = match self.screens.iter().find(|s| s.connector == name) {
            Some(screen) => screen.clone(),
            None => {
                if self.missing_warned.insert(format!("screen:{}", name)) {
                    warn!("Script names unknown screen {}", name);
                }
                return None;
            }
        };

        let mode = match request {
            Some(ModeRequest(width, height, hz)) => {
                let wanted = DisplayMode { width, height, hz };
                if !screen.modes.contains(&wanted) {
                    if self.missing_warned.insert(format!("mode:{}:{}", name, wanted)) {
                        warn!("Screen {} does not advertise mode {}", name, wanted);
                    }
                    return None;
                }
                wanted
            }
            None => match screen.active_mode.or_else(|| screen.modes.first().copied()) {
                Some(mode) => mode,
                None => {
                    warn!("Screen {} has no usable mode", name);
                    return None;
                }
            },
        };

        match self.players.get(name) {
            Some(slot) if slot.mode == mode => {}
            Some(_) => {
                info!("Screen {}: mode change to {}, restarting player", name, mode);
                self.players.remove(name);
                self.start_player(name, screen.id, mode);
            }
            None => self.start_player(name, screen.id, mode),
        }
        Some(mode)
    }
}

impl ScriptTick for ScriptRunner {
    fn tick(&mut self, script: &Script) {
        self.update(script);
    }
}

impl ScriptRunner {
    fn start_player(&mut self, name: &str, connector_id: u32, mode: DisplayMode) {
        let player = start_frame_player(
            Arc::clone(&self.cx.clock),
            Arc::clone(&self.cx.driver),
            connector_id,
            mode,
            self.fault_tx.clone(),
        );
        self.players.insert(name.to_string(), PlayerSlot { player, mode });
    }
}

/// Assemble one screen's timeline over `[now, now + horizon]`.
///
/// Keys are multiples of the update period so they are stable across ticks.
/// The grid starts at the period boundary at or before `now`, so a freshly
/// installed script has an atom that is due immediately.
fn build_timeline(
    screen: &ScreenScript,
    mode: DisplayMode,
    media: &dyn MediaSource,
    now: MonoTime,
    script_now: f64,
    horizon: Duration,
    missing_warned: &mut HashSet<String>,
) -> Timeline {
    let update_hz = screen.update_hz.unwrap_or(f64::from(mode.hz));
    let period_ns = ((1e9 / update_hz) as u128).max(1);
    let first_index = now.as_nanos() / period_ns;
    let steps = (horizon.as_nanos() / period_ns) + 1;

    let mut timeline = Timeline::new();
    for index in first_index..=first_index + steps {
        let key = MonoTime::from_nanos(index * period_ns);
        let script_t = script_now + (key.as_secs_f64() - now.as_secs_f64());

        let mut atom = DisplayAtom::default();
        for layer in &screen.layers {
            if !layer.covers(script_t) {
                continue;
            }
            let source_t = layer.source_time_at(script_t);
            if source_t < 0.0 {
                continue;
            }
            let frame = match media.frame_at(&layer.media, source_t) {
                Ok(frame) => frame,
                Err(e) => {
                    if missing_warned.insert(layer.media.clone()) {
                        warn!("Layer media unavailable: {}", e);
                    }
                    continue;
                }
            };

            let eval_pair = |pair: &Option<[Curve; 2]>, dx: f64, dy: f64| match pair {
                Some([x, y]) => (x.at(script_t), y.at(script_t)),
                None => (dx, dy),
            };
            let (from_x, from_y) = eval_pair(&layer.from_xy, 0.0, 0.0);
            let (from_w, from_h) =
                eval_pair(&layer.from_size, f64::from(frame.width()), f64::from(frame.height()));
            let (to_x, to_y) = eval_pair(&layer.to_xy, 0.0, 0.0);
            let (to_w, to_h) =
                eval_pair(&layer.to_size, f64::from(mode.width), f64::from(mode.height));
            let opacity = layer
                .opacity
                .as_ref()
                .map(|c| c.at(script_t))
                .unwrap_or(1.0)
                .clamp(0.0, 1.0);

            atom.layers.push(DisplayLayer {
                frame,
                from: Rect::new(from_x, from_y, from_w, from_h),
                to: Rect::new(to_x, to_y, to_w, to_h),
                opacity,
            });
        }
        timeline.insert(key, atom);
    }
    timeline
}
