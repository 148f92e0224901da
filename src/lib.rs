//! PLAYOUT - Frame-accurate video playout server library
//!
//! Re-exports all modules for use by binary targets.

// Playback core (clock, timeline, player, loop)
pub mod clock;
pub mod mainloop;
pub mod player;
pub mod timeline;

// External contracts and their development implementations
pub mod display;
pub mod media;
pub mod virtual_driver;

// Script model and projection
pub mod runner;
pub mod script;

// App modules
pub mod cli;
pub mod server;

// Re-export commonly used types
pub use clock::{Clock, ManualClock, MonoTime, SystemClock, WakeFlag, WakeReason};
pub use display::{DisplayAtom, DisplayDriver, DisplayLayer, DisplayMode, Frame, Screen};
pub use mainloop::{LoopHandle, MainLoop, ScriptTick};
pub use player::{start_frame_player, FramePlayer, PlayerFault};
pub use runner::{RunnerContext, ScriptRunner};
pub use script::{parse_script, Script};
pub use timeline::Timeline;
pub use virtual_driver::VirtualDriver;
