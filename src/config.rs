use serde::Deserialize;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{HarnessError, Result};

pub const DEFAULT_HOST: &str = "127.0.0.1";

// =============================================================================
// Game Config File
// =============================================================================

/// The JSON game configuration shared with the external game process.
#[derive(Debug, Clone, Deserialize)]
pub struct GameConfig {
    pub game_exe: PathBuf,
    #[serde(default)]
    pub config_name: Option<String>,
    pub env_config: EnvConfig,
}

impl GameConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let reader = std::io::BufReader::new(file);
        let config: GameConfig = serde_json::from_reader(reader)?;
        config.env_config.observation_spec()?;
        Ok(config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EnvConfig {
    pub num_actions: usize,
    #[serde(default)]
    pub observation_includes_image: bool,
    /// Target image size as `[width, height]`.
    #[serde(default)]
    pub image_resize_to: Option<[u32; 2]>,
    #[serde(default)]
    pub observation_stack: Option<usize>,
    #[serde(default)]
    pub num_observation_features: Option<usize>,
    #[serde(default)]
    pub pre_init: bool,
    #[serde(default)]
    pub time_limit: Option<u64>,
}

/// Shape of what the observation pipeline hands back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationSpec {
    Image {
        stack: usize,
        width: u32,
        height: u32,
    },
    Features {
        len: usize,
    },
}

impl ObservationSpec {
    pub fn shape(&self) -> Vec<usize> {
        match *self {
            ObservationSpec::Image {
                stack,
                width,
                height,
            } => vec![stack, height as usize, width as usize],
            ObservationSpec::Features { len } => vec![len],
        }
    }
}

impl EnvConfig {
    pub fn observation_spec(&self) -> Result<ObservationSpec> {
        if self.num_actions == 0 {
            return Err(HarnessError::config("num_actions must be at least 1"));
        }
        if self.observation_includes_image {
            let [width, height] = self.image_resize_to.ok_or_else(|| {
                HarnessError::config("image observations require image_resize_to")
            })?;
            if width == 0 || height == 0 {
                return Err(HarnessError::config(format!(
                    "image_resize_to must be non-zero, got [{width}, {height}]"
                )));
            }
            let stack = self.observation_stack.unwrap_or(1);
            if stack == 0 {
                return Err(HarnessError::config("observation_stack must be at least 1"));
            }
            Ok(ObservationSpec::Image {
                stack,
                width,
                height,
            })
        } else {
            if self.observation_stack.is_some() {
                return Err(HarnessError::config(
                    "observation_stack with vector observations is not supported",
                ));
            }
            let len = self.num_observation_features.ok_or_else(|| {
                HarnessError::config("vector observations require num_observation_features")
            })?;
            Ok(ObservationSpec::Features { len })
        }
    }
}

// =============================================================================
// Supervisor Tuning Knobs
// =============================================================================

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub port_check_attempts: u32,
    pub port_kill_grace: Duration,
    pub connect_attempts: u32,
    pub connect_backoff: Duration,
    pub io_timeout: Duration,
    pub shutdown_timeout: Duration,
    pub startup_delay: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            port_check_attempts: 5,
            port_kill_grace: Duration::from_secs(5),
            connect_attempts: 10,
            connect_backoff: Duration::from_secs(1),
            io_timeout: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(60),
            startup_delay: Duration::from_secs(1),
        }
    }
}

// =============================================================================
// Harness Config
// =============================================================================

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub identifier: String,
    pub game_exe: PathBuf,
    pub host: String,
    pub port: u16,
    pub pre_init_port: Option<u16>,
    pub game_config_path: PathBuf,
    pub work_dir: PathBuf,
    pub training_mode: bool,
    pub env: EnvConfig,
    pub supervisor: SupervisorConfig,
}

impl HarnessConfig {
    /// Builds the harness settings for one environment slot. The identifier
    /// and private work dir are derived from the primary port; the pre-init
    /// port is dropped unless the game config enables pre-init.
    pub fn from_game_config(
        game: &GameConfig,
        game_config_path: PathBuf,
        work_dir_root: &Path,
        port: u16,
        pre_init_port: Option<u16>,
        training_mode: bool,
    ) -> Self {
        let identifier = format!("env_{port}");
        Self {
            work_dir: work_dir_root.join(&identifier),
            identifier,
            game_exe: game.game_exe.clone(),
            host: DEFAULT_HOST.to_string(),
            port,
            pre_init_port: pre_init_port.filter(|_| game.env_config.pre_init),
            game_config_path,
            training_mode,
            env: game.env_config.clone(),
            supervisor: SupervisorConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<ObservationSpec> {
        if self.identifier.is_empty() {
            return Err(HarnessError::config("missing required parameter 'identifier'"));
        }
        if self.game_exe.as_os_str().is_empty() {
            return Err(HarnessError::config("missing required parameter 'game_exe'"));
        }
        if self.game_config_path.as_os_str().is_empty() {
            return Err(HarnessError::config(
                "missing required parameter 'game_config_path'",
            ));
        }
        if self.work_dir.as_os_str().is_empty() {
            return Err(HarnessError::config("missing required parameter 'work_dir'"));
        }
        if self.port == 0 {
            return Err(HarnessError::config("missing required parameter 'port'"));
        }
        if self.pre_init_port.is_some() && !self.env.pre_init {
            return Err(HarnessError::config(
                "pre-init port given but pre_init is disabled in env_config",
            ));
        }
        if self.pre_init_port == Some(self.port) {
            return Err(HarnessError::config(format!(
                "pre-init port must differ from primary port {}",
                self.port
            )));
        }
        self.env.observation_spec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_env() -> EnvConfig {
        EnvConfig {
            num_actions: 4,
            observation_includes_image: true,
            image_resize_to: Some([84, 64]),
            observation_stack: Some(4),
            num_observation_features: None,
            pre_init: true,
            time_limit: Some(500),
        }
    }

    #[test]
    fn image_spec_is_channels_height_width() {
        let spec = image_env().observation_spec().unwrap();
        assert_eq!(
            spec,
            ObservationSpec::Image {
                stack: 4,
                width: 84,
                height: 64
            }
        );
        assert_eq!(spec.shape(), vec![4, 64, 84]);
    }

    #[test]
    fn stack_defaults_to_one() {
        let mut env = image_env();
        env.observation_stack = None;
        assert_eq!(env.observation_spec().unwrap().shape(), vec![1, 64, 84]);
    }

    #[test]
    fn stacking_vector_observations_is_rejected() {
        let env = EnvConfig {
            observation_includes_image: false,
            image_resize_to: None,
            num_observation_features: Some(8),
            ..image_env()
        };
        let err = env.observation_spec().unwrap_err();
        assert!(matches!(err, HarnessError::Config(_)));
    }

    #[test]
    fn parses_game_config_json() {
        let json = r#"{
            "game_exe": "/opt/game/Game.x86_64",
            "config_name": "platformer",
            "env_config": {
                "num_actions": 12,
                "observation_includes_image": false,
                "num_observation_features": 6,
                "pre_init": true,
                "time_limit": 1000
            }
        }"#;
        let config: GameConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.env_config.num_actions, 12);
        assert!(config.env_config.pre_init);
        assert_eq!(
            config.env_config.observation_spec().unwrap(),
            ObservationSpec::Features { len: 6 }
        );
    }

    #[test]
    fn harness_config_derives_identity_from_port() {
        let game = GameConfig {
            game_exe: "/opt/game/Game".into(),
            config_name: None,
            env_config: EnvConfig {
                pre_init: false,
                ..image_env()
            },
        };
        let config = HarnessConfig::from_game_config(
            &game,
            "/opt/game/config.json".into(),
            Path::new("/tmp/work"),
            12000,
            Some(12001),
            true,
        );
        assert_eq!(config.identifier, "env_12000");
        assert_eq!(config.work_dir, PathBuf::from("/tmp/work/env_12000"));
        assert_eq!(config.pre_init_port, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn pre_init_port_requires_pre_init_enabled() {
        let mut config = HarnessConfig::from_game_config(
            &GameConfig {
                game_exe: "/opt/game/Game".into(),
                config_name: None,
                env_config: image_env(),
            },
            "/opt/game/config.json".into(),
            Path::new("/tmp/work"),
            12000,
            Some(12001),
            false,
        );
        assert_eq!(config.pre_init_port, Some(12001));
        assert!(config.validate().is_ok());

        config.env.pre_init = false;
        assert!(matches!(config.validate(), Err(HarnessError::Config(_))));
    }

    #[test]
    fn harness_config_rejects_shared_ports() {
        let config = HarnessConfig {
            identifier: "env_12000".into(),
            game_exe: "/opt/game/Game".into(),
            host: DEFAULT_HOST.into(),
            port: 12000,
            pre_init_port: Some(12000),
            game_config_path: "/opt/game/config.json".into(),
            work_dir: "/tmp/work".into(),
            training_mode: true,
            env: image_env(),
            supervisor: SupervisorConfig::default(),
        };
        assert!(matches!(config.validate(), Err(HarnessError::Config(_))));
    }
}
