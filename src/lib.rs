pub mod config;
pub mod env;
pub mod error;
pub mod eval;
pub mod instance;
pub mod observation;
pub mod pre_init;
pub mod process;
pub mod protocol;
pub mod transport;

pub use config::{EnvConfig, GameConfig, HarnessConfig, ObservationSpec, SupervisorConfig};
pub use env::{ActionMask, GameEnv, ResetResult, StepResult};
pub use error::{HarnessError, Result};
pub use eval::{EpisodeStats, Policy, run_episodes};
pub use instance::{ConnectionState, GameInstance, IoMode};
pub use observation::{Observation, ObservationPipeline, ObservationStack};
pub use pre_init::PreInitSlot;
pub use process::{GameProcess, PortInspector, PortStatus, ProcNetInspector, ProcessSpec};
pub use protocol::{Command, Handshake, Info, StepMessage};
pub use transport::Transport;
