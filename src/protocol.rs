//! Typed messages exchanged with the game process.
//!
//! Every frame on the wire is a JSON object. The server side does not tag its
//! messages, so which variant a frame decodes into is decided by where it
//! arrives in the conversation: a handshake while initializing, a step result
//! after an action was sent.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{HarnessError, Result};

pub type Info = Map<String, Value>;

// =============================================================================
// Client -> Server
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Command {
    Action { action: i64 },
    Wait { wait: bool },
}

impl Command {
    pub fn action(action: usize) -> Self {
        Command::Action {
            action: action as i64,
        }
    }

    pub fn wait() -> Self {
        Command::Wait { wait: true }
    }
}

// =============================================================================
// Server -> Client
// =============================================================================

/// The server-ready message that completes initialization.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub num_actions: usize,
    pub invalid_actions: Vec<i64>,
    pub observation: Value,
    pub info: Info,
}

#[derive(Deserialize)]
struct ReadyFlag {
    ready: bool,
}

impl Handshake {
    /// Returns `Ok(None)` for a well-formed handshake whose `ready` flag is
    /// still false.
    pub fn decode(msg: Value) -> Result<Option<Handshake>> {
        let flag: ReadyFlag = serde_json::from_value(msg.clone())
            .map_err(|e| HarnessError::protocol(format!("bad handshake: {e}")))?;
        if !flag.ready {
            return Ok(None);
        }
        let handshake = serde_json::from_value(msg)
            .map_err(|e| HarnessError::protocol(format!("bad handshake: {e}")))?;
        Ok(Some(handshake))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepMessage {
    Running {
        reward: f64,
        observation: Value,
        info: Info,
        invalid_actions: Vec<i64>,
    },
    /// Observation, info and invalid actions are ignored on a terminal step.
    Terminal { reward: f64 },
}

#[derive(Deserialize)]
struct StepHeader {
    reward: f64,
    done: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunningBody {
    observation: Value,
    info: Info,
    invalid_actions: Vec<i64>,
}

impl StepMessage {
    pub fn decode(msg: Value) -> Result<StepMessage> {
        let header: StepHeader = serde_json::from_value(msg.clone())
            .map_err(|e| HarnessError::protocol(format!("bad step result: {e}")))?;
        if header.done {
            return Ok(StepMessage::Terminal {
                reward: header.reward,
            });
        }
        let body: RunningBody = serde_json::from_value(msg)
            .map_err(|e| HarnessError::protocol(format!("bad step result: {e}")))?;
        Ok(StepMessage::Running {
            reward: header.reward,
            observation: body.observation,
            info: body.info,
            invalid_actions: body.invalid_actions,
        })
    }

    pub fn is_done(&self) -> bool {
        matches!(self, StepMessage::Terminal { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn commands_serialize_to_wire_shape() {
        assert_eq!(
            serde_json::to_value(Command::action(3)).unwrap(),
            json!({"action": 3})
        );
        assert_eq!(
            serde_json::to_value(Command::wait()).unwrap(),
            json!({"wait": true})
        );
    }

    #[test]
    fn not_ready_handshake_needs_only_the_flag() {
        assert_eq!(Handshake::decode(json!({"ready": false})).unwrap(), None);
    }

    #[test]
    fn ready_handshake_requires_all_fields() {
        let err = Handshake::decode(json!({"ready": true, "numActions": 4})).unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(_)));

        let hs = Handshake::decode(json!({
            "ready": true,
            "numActions": 4,
            "invalidActions": [2],
            "observation": [0.5, 1.0],
            "info": {"scene": "menu"}
        }))
        .unwrap()
        .unwrap();
        assert_eq!(hs.num_actions, 4);
        assert_eq!(hs.invalid_actions, vec![2]);
        assert_eq!(hs.info.get("scene"), Some(&json!("menu")));
    }

    #[test]
    fn info_is_required() {
        let err = Handshake::decode(json!({
            "ready": true,
            "numActions": 2,
            "invalidActions": [],
            "observation": [0.0]
        }))
        .unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(_)));

        let err = StepMessage::decode(json!({
            "reward": 1.0,
            "done": false,
            "observation": [0.0],
            "invalidActions": []
        }))
        .unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(_)));
    }

    #[test]
    fn missing_ready_flag_is_a_protocol_error() {
        assert!(Handshake::decode(json!({"numActions": 4})).is_err());
    }

    #[test]
    fn terminal_step_ignores_payload() {
        let msg = StepMessage::decode(json!({"reward": -1.0, "done": true})).unwrap();
        assert_eq!(msg, StepMessage::Terminal { reward: -1.0 });
        assert!(msg.is_done());
    }

    #[test]
    fn running_step_requires_invalid_actions() {
        let err = StepMessage::decode(json!({
            "reward": 0.0,
            "done": false,
            "observation": [1.0]
        }))
        .unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(_)));
    }
}
