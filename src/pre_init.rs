//! Background warm-up of the next episode's game instance.
//!
//! The slot owns a [`GameInstance`] in non-blocking mode. Each call to
//! [`PreInitSlot::tick`] moves it at most one step further along
//! start, connect, initialize; once it is ready every tick sends a keepalive
//! `wait` so the game does not idle out. Nothing here ever blocks on the
//! network.

use std::sync::Arc;
use tracing::debug;

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::instance::{ConnectionState, GameInstance, IoMode};
use crate::process::{PortInspector, ProcessSpec};

pub struct PreInitSlot {
    instance: GameInstance,
}

impl PreInitSlot {
    pub fn new(spec: ProcessSpec, inspector: Arc<dyn PortInspector>, tuning: SupervisorConfig) -> Self {
        Self {
            instance: GameInstance::new(spec, IoMode::NonBlocking, inspector, tuning),
        }
    }

    pub fn port(&self) -> u16 {
        self.instance.port()
    }

    pub fn state(&self) -> ConnectionState {
        self.instance.state()
    }

    /// Whether the slot got far enough to be worth promoting.
    pub fn is_promotable(&self) -> bool {
        self.instance.is_started()
    }

    /// Advances the background instance by one non-blocking operation.
    pub fn tick(&mut self) -> Result<()> {
        let before = self.instance.state();
        match before {
            ConnectionState::NotStarted => self.instance.start()?,
            ConnectionState::Started => {
                self.instance.try_connect()?;
            }
            ConnectionState::Connected => {
                self.instance.try_initialize()?;
            }
            ConnectionState::Ready => self.instance.send_wait()?,
            ConnectionState::Closed => {}
        }
        let after = self.instance.state();
        if after != before {
            debug!(port = self.port(), from = ?before, to = ?after, "pre-init slot advanced");
        }
        Ok(())
    }

    /// Hands the instance over for use as the primary, switched to blocking mode.
    pub fn into_instance(self) -> Result<GameInstance> {
        let mut instance = self.instance;
        instance.set_mode(IoMode::Blocking)?;
        Ok(instance)
    }

    pub fn close(&mut self) -> Result<()> {
        self.instance.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::PortStatus;
    use std::io;

    struct FreePorts;

    impl PortInspector for FreePorts {
        fn status(&self, _port: u16) -> io::Result<PortStatus> {
            Ok(PortStatus::Free)
        }

        fn kill(&self, _pid: u32) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn fresh_slot_is_not_promotable() {
        let spec = ProcessSpec {
            identifier: "env_9000".into(),
            executable: "/nonexistent/game".into(),
            host: "127.0.0.1".into(),
            port: 9001,
            config_path: "/nonexistent/game.json".into(),
            work_dir_root: std::env::temp_dir(),
            training_mode: true,
        };
        let mut slot = PreInitSlot::new(spec, Arc::new(FreePorts), SupervisorConfig::default());
        assert_eq!(slot.port(), 9001);
        assert_eq!(slot.state(), ConnectionState::NotStarted);
        assert!(!slot.is_promotable());
        slot.close().unwrap();
        assert_eq!(slot.state(), ConnectionState::Closed);
        // a closed slot ignores further ticks
        slot.tick().unwrap();
    }
}
