use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{HarnessConfig, ObservationSpec};
use crate::error::{HarnessError, Result};
use crate::instance::{ConnectionState, GameInstance, IoMode};
use crate::observation::{Observation, ObservationPipeline};
use crate::pre_init::PreInitSlot;
use crate::process::{PortInspector, ProcNetInspector, ProcessSpec};
use crate::protocol::{Info, StepMessage};

// =============================================================================
// Action Mask
// =============================================================================

/// One `0.0`/`1.0` entry per discrete action; `1.0` means legal.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionMask {
    mask: Vec<f32>,
}

impl ActionMask {
    /// Before the game has said anything only action 0 is allowed.
    pub fn initial(num_actions: usize) -> Self {
        let mut mask = vec![0.0; num_actions];
        if let Some(first) = mask.first_mut() {
            *first = 1.0;
        }
        Self { mask }
    }

    /// Rewrites every entry from the server's invalid-action list. Indices
    /// outside the action range are ignored.
    pub fn update(&mut self, invalid_actions: &[i64]) {
        self.mask.fill(1.0);
        for &a in invalid_actions {
            let Ok(idx) = usize::try_from(a) else { continue };
            if let Some(slot) = self.mask.get_mut(idx) {
                *slot = 0.0;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.mask.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mask.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.mask
    }

    pub fn is_valid(&self, action: usize) -> bool {
        self.mask.get(action).is_some_and(|&m| m > 0.0)
    }

    pub fn valid_actions(&self) -> Vec<usize> {
        (0..self.mask.len()).filter(|&a| self.is_valid(a)).collect()
    }
}

// =============================================================================
// Harness
// =============================================================================

#[derive(Debug, Clone)]
pub struct ResetResult {
    pub observation: Observation,
    pub action_mask: ActionMask,
    pub info: Info,
}

#[derive(Debug, Clone)]
pub struct StepResult {
    pub observation: Observation,
    pub action_mask: ActionMask,
    pub reward: f64,
    pub done: bool,
    pub info: Info,
}

/// Reset/step front end over one external game process, with an optional
/// second process warming up in the background for the next episode.
pub struct GameEnv {
    config: HarnessConfig,
    inspector: Arc<dyn PortInspector>,
    primary: Option<GameInstance>,
    primary_port: u16,
    pre_init: Option<PreInitSlot>,
    pre_init_port: Option<u16>,
    mask: ActionMask,
    pipeline: ObservationPipeline,
}

impl GameEnv {
    pub fn new(config: HarnessConfig) -> Result<Self> {
        Self::with_inspector(config, Arc::new(ProcNetInspector))
    }

    pub fn with_inspector(config: HarnessConfig, inspector: Arc<dyn PortInspector>) -> Result<Self> {
        let spec = config.validate()?;
        Ok(Self {
            primary_port: config.port,
            pre_init_port: config.pre_init_port,
            mask: ActionMask::initial(config.env.num_actions),
            pipeline: ObservationPipeline::new(spec),
            primary: None,
            pre_init: None,
            inspector,
            config,
        })
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn num_actions(&self) -> usize {
        self.config.env.num_actions
    }

    pub fn action_mask(&self) -> &ActionMask {
        &self.mask
    }

    pub fn observation_spec(&self) -> &ObservationSpec {
        self.pipeline.spec()
    }

    pub fn observation_shape(&self) -> Vec<usize> {
        self.pipeline.spec().shape()
    }

    pub fn primary_port(&self) -> u16 {
        self.primary_port
    }

    pub fn primary_state(&self) -> Option<ConnectionState> {
        self.primary.as_ref().map(GameInstance::state)
    }

    pub fn pre_init_port(&self) -> Option<u16> {
        self.pre_init_port
    }

    pub fn pre_init_state(&self) -> Option<ConnectionState> {
        self.pre_init.as_ref().map(PreInitSlot::state)
    }

    fn process_spec(&self, port: u16) -> ProcessSpec {
        ProcessSpec {
            identifier: self.config.identifier.clone(),
            executable: self.config.game_exe.clone(),
            host: self.config.host.clone(),
            port,
            config_path: self.config.game_config_path.clone(),
            work_dir_root: self.config.work_dir.clone(),
            training_mode: self.config.training_mode,
        }
    }

    /// Moves the background instance into the primary role if it got anywhere,
    /// swapping the two ports. Otherwise a fresh primary is built.
    fn take_next_primary(&mut self) -> Result<GameInstance> {
        match self.pre_init.take() {
            Some(slot) if slot.is_promotable() => {
                let vacated = self.primary_port;
                self.primary_port = slot.port();
                self.pre_init_port = Some(vacated);
                info!(
                    port = self.primary_port,
                    state = ?slot.state(),
                    vacated,
                    "promoting pre-initialized game instance"
                );
                slot.into_instance()
            }
            Some(mut slot) => {
                debug!(port = slot.port(), "discarding pre-init slot that never started");
                slot.close()?;
                Ok(self.fresh_instance(self.primary_port))
            }
            None => Ok(self.fresh_instance(self.primary_port)),
        }
    }

    fn fresh_instance(&self, port: u16) -> GameInstance {
        GameInstance::new(
            self.process_spec(port),
            IoMode::Blocking,
            self.inspector.clone(),
            self.config.supervisor.clone(),
        )
    }

    pub fn reset(&mut self) -> Result<ResetResult> {
        if let Some(mut old) = self.primary.take() {
            old.close()?;
        }
        let next = self.take_next_primary()?;

        if let Some(port) = self.pre_init_port {
            let mut slot = PreInitSlot::new(
                self.process_spec(port),
                self.inspector.clone(),
                self.config.supervisor.clone(),
            );
            let started = slot.tick();
            self.pre_init = Some(slot);
            started?;
        }

        let startup_delay = self.config.supervisor.startup_delay;
        let primary = self.primary.insert(next);
        if !primary.is_started() {
            primary.start()?;
        }
        if !primary.is_connected() {
            std::thread::sleep(startup_delay);
            primary.connect()?;
        }
        if !primary.is_initialized() {
            primary.initialize()?;
        }
        let handshake = primary
            .init_message()
            .cloned()
            .ok_or_else(|| HarnessError::invalid_state("primary ready without handshake"))?;

        if let Some(slot) = self.pre_init.as_mut() {
            slot.tick()?;
            if slot.state() == ConnectionState::Connected {
                slot.tick()?;
            }
        }

        let expected = self.config.env.num_actions;
        if handshake.num_actions != expected {
            return Err(HarnessError::ConfigMismatch {
                expected,
                actual: handshake.num_actions,
            });
        }
        self.mask.update(&handshake.invalid_actions);
        let observation = self.pipeline.read(&handshake.observation)?;
        info!(port = self.primary_port, "episode reset");

        Ok(ResetResult {
            observation,
            action_mask: self.mask.clone(),
            info: handshake.info,
        })
    }

    pub fn step(&mut self, action: usize) -> Result<StepResult> {
        if action >= self.num_actions() {
            return Err(HarnessError::invalid_state(format!(
                "action {action} out of range for {} actions",
                self.num_actions()
            )));
        }
        if let Some(slot) = self.pre_init.as_mut() {
            slot.tick()?;
        }
        let primary = self
            .primary
            .as_mut()
            .ok_or_else(|| HarnessError::invalid_state("step() called before reset()"))?;
        primary.send_action(action)?;

        match primary.receive_state()? {
            StepMessage::Terminal { reward } => {
                debug!(port = self.primary_port, reward, "episode finished");
                Ok(StepResult {
                    observation: self.pipeline.zeros(),
                    // the pre-terminal mask is kept on purpose
                    action_mask: self.mask.clone(),
                    reward,
                    done: true,
                    info: Info::new(),
                })
            }
            StepMessage::Running {
                reward,
                observation,
                info,
                invalid_actions,
            } => {
                let observation = self.pipeline.read(&observation)?;
                self.mask.update(&invalid_actions);
                Ok(StepResult {
                    observation,
                    action_mask: self.mask.clone(),
                    reward,
                    done: false,
                    info,
                })
            }
        }
    }

    /// Shuts down the primary and the pre-init instance. Both are attempted
    /// even if the first fails; the first error is returned.
    pub fn close(&mut self) -> Result<()> {
        let primary = match self.primary.take() {
            Some(mut p) => p.close(),
            None => Ok(()),
        };
        let slot = match self.pre_init.take() {
            Some(mut s) => s.close(),
            None => Ok(()),
        };
        primary.and(slot)
    }
}

impl Drop for GameEnv {
    fn drop(&mut self) {
        if self.primary.is_none() && self.pre_init.is_none() {
            return;
        }
        if let Err(e) = self.close() {
            warn!(port = self.primary_port, error = %e, "failed to close game environment");
        }
    }
}
