//! Hardware-free display backend with simulated vsync pacing.
//!
//! Implements [`DisplayDriver`] over fabricated connectors. `update` records
//! the atom and marks the flip pending for one refresh interval on the bound
//! clock, so the frame players experience the same backpressure rhythm a
//! real display controller produces. Selected with `--dev virtual`; also the
//! workhorse driver for the test suite.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use log::{debug, trace};

use crate::clock::{Clock, MonoTime};
use crate::display::{DisplayAtom, DisplayDriver, DisplayMode, DriverError, Screen};

struct ConnectorState {
    screen: Screen,
    /// Pending flip retires when the clock passes this instant.
    flip_done_at: MonoTime,
    last_atom: Option<DisplayAtom>,
    flips: u64,
}

pub struct VirtualDriver {
    clock: Arc<dyn Clock>,
    connectors: Mutex<HashMap<u32, ConnectorState>>,
}

impl VirtualDriver {
    /// One 1920x1080@60 connector named VIRT-1.
    pub fn new(clock: Arc<dyn Clock>) -> VirtualDriver {
        let mode = DisplayMode { width: 1920, height: 1080, hz: 60 };
        Self::with_screens(
            clock,
            vec![Screen {
                id: 1,
                connector: "VIRT-1".to_string(),
                detected: true,
                active_mode: Some(mode),
                modes: vec![mode, DisplayMode { width: 1280, height: 720, hz: 60 }],
            }],
        )
    }

    pub fn with_screens(clock: Arc<dyn Clock>, screens: Vec<Screen>) -> VirtualDriver {
        let connectors = screens
            .into_iter()
            .map(|screen| {
                (
                    screen.id,
                    ConnectorState {
                        screen,
                        flip_done_at: MonoTime::ZERO,
                        last_atom: None,
                        flips: 0,
                    },
                )
            })
            .collect();
        VirtualDriver { clock, connectors: Mutex::new(connectors) }
    }

    /// Flip count for a connector, for tests and diagnostics.
    pub fn flips(&self, connector_id: u32) -> u64 {
        self.connectors
            .lock()
            .unwrap()
            .get(&connector_id)
            .map(|c| c.flips)
            .unwrap_or(0)
    }

    /// The most recently submitted atom, if any.
    pub fn last_atom(&self, connector_id: u32) -> Option<DisplayAtom> {
        self.connectors
            .lock()
            .unwrap()
            .get(&connector_id)
            .and_then(|c| c.last_atom.clone())
    }
}

impl DisplayDriver for VirtualDriver {
    fn scan_screens(&self) -> Result<Vec<Screen>, DriverError> {
        let connectors = self.connectors.lock().unwrap();
        let mut screens: Vec<Screen> = connectors.values().map(|c| c.screen.clone()).collect();
        screens.sort_by_key(|s| s.id);
        Ok(screens)
    }

    fn update(
        &self,
        connector_id: u32,
        mode: &DisplayMode,
        atom: &DisplayAtom,
    ) -> Result<(), DriverError> {
        let mut connectors = self.connectors.lock().unwrap();
        let connector = connectors
            .get_mut(&connector_id)
            .ok_or(DriverError::UnknownConnector(connector_id))?;
        if !connector.screen.modes.contains(mode) {
            return Err(DriverError::UnsupportedMode {
                connector: connector.screen.connector.clone(),
                mode: *mode,
            });
        }

        let now = self.clock.now();
        connector.flip_done_at = now + mode.refresh_interval();
        connector.last_atom = Some(atom.clone());
        connector.flips += 1;
        debug!(
            "VIRT flip #{} on {} ({} layers)",
            connector.flips,
            connector.screen.connector,
            atom.layers.len()
        );
        Ok(())
    }

    fn update_done_yet(&self, connector_id: u32) -> Result<bool, DriverError> {
        let connectors = self.connectors.lock().unwrap();
        let connector = connectors
            .get(&connector_id)
            .ok_or(DriverError::UnknownConnector(connector_id))?;
        let done = self.clock.now() >= connector.flip_done_at;
        if !done {
            trace!("VIRT flip pending on {}", connector.screen.connector);
        }
        Ok(done)
    }
}
