#![allow(dead_code)]

use game_env_harness::config::{DEFAULT_HOST, EnvConfig, HarnessConfig, SupervisorConfig};
use game_env_harness::process::{PortInspector, PortStatus};
use game_env_harness::transport::Transport;
use serde_json::{Value, json};
use std::io;
use std::net::{TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Reports every port as free. The fake game servers live in the test
/// process itself, which a real inspector would flag as a foreign holder.
pub struct FreePorts;

impl PortInspector for FreePorts {
    fn status(&self, _port: u16) -> io::Result<PortStatus> {
        Ok(PortStatus::Free)
    }

    fn kill(&self, _pid: u32) -> io::Result<()> {
        Ok(())
    }
}

/// Reports an unrelated process holding `port` the first time it is asked,
/// and every port as free afterwards. Records any kill request.
pub struct ConflictOnce {
    port: u16,
    tripped: AtomicBool,
    killed: Mutex<Vec<u32>>,
}

impl ConflictOnce {
    pub fn new(port: u16) -> Self {
        Self {
            port,
            tripped: AtomicBool::new(false),
            killed: Mutex::new(Vec::new()),
        }
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }
}

impl PortInspector for ConflictOnce {
    fn status(&self, port: u16) -> io::Result<PortStatus> {
        if port == self.port && !self.tripped.swap(true, Ordering::SeqCst) {
            return Ok(PortStatus::HeldBy {
                pid: 4242,
                name: "postgres".to_string(),
            });
        }
        Ok(PortStatus::Free)
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        self.killed.lock().unwrap().push(pid);
        Ok(())
    }
}

pub type Reply = Box<dyn Fn(usize) -> Value + Send + Sync>;

/// Builds the ready handshake for the n-th accepted connection.
pub type Greeting = Box<dyn Fn(usize) -> Value + Send + Sync>;

/// A game server speaking the wire protocol on a loopback port. Each accepted
/// connection gets a not-ready handshake, then its greeting, then one reply
/// per action from `reply(step_index)`. Keepalive waits are recorded but not
/// answered.
pub struct FakeGame {
    pub port: u16,
    received: Arc<Mutex<Vec<Value>>>,
}

impl FakeGame {
    pub fn spawn(handshake: Value, reply: Reply) -> Self {
        Self::spawn_with(Box::new(move |_| handshake.clone()), reply)
    }

    pub fn spawn_with(greeting: Greeting, reply: Reply) -> Self {
        let listener = TcpListener::bind((DEFAULT_HOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = received.clone();
        std::thread::spawn(move || {
            for (conn, stream) in listener.incoming().enumerate() {
                let Ok(stream) = stream else { break };
                serve(stream, &greeting(conn), &reply, &log);
            }
        });
        Self { port, received }
    }

    pub fn received(&self) -> Vec<Value> {
        self.received.lock().unwrap().clone()
    }

    pub fn actions(&self) -> Vec<i64> {
        self.received()
            .iter()
            .filter_map(|m| m.get("action").and_then(Value::as_i64))
            .collect()
    }

    pub fn waits(&self) -> usize {
        self.received()
            .iter()
            .filter(|m| m.get("wait").is_some())
            .count()
    }
}

fn serve(stream: TcpStream, handshake: &Value, reply: &Reply, log: &Mutex<Vec<Value>>) {
    let mut transport = Transport::new(stream);
    if transport.send(&json!({"ready": false})).is_err() || transport.send(handshake).is_err() {
        return;
    }
    let mut step = 0;
    // the client closing its socket ends the conversation
    while let Ok(msg) = transport.receive() {
        log.lock().unwrap().push(msg.clone());
        if msg.get("action").is_some() {
            if transport.send(&reply(step)).is_err() {
                return;
            }
            step += 1;
        }
    }
}

pub fn handshake(num_actions: usize, invalid: &[i64], observation: Value) -> Value {
    json!({
        "ready": true,
        "numActions": num_actions,
        "invalidActions": invalid,
        "observation": observation,
        "info": {"scene": "start"},
    })
}

/// Writes a 1x1 gray image and returns the `{"img": ...}` payload for it.
pub fn gray_frame(path: &Path, level: u8) -> Value {
    image::RgbImage::from_pixel(1, 1, image::Rgb([level, level, level]))
        .save(path)
        .unwrap();
    json!({"img": path.to_str().unwrap()})
}

/// Writes a shell script that just stays alive until killed.
pub fn stub_game(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join("stub_game.sh");
    std::fs::write(&path, "#!/bin/sh\nexec sleep 300\n").unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn fast_supervisor() -> SupervisorConfig {
    SupervisorConfig {
        port_check_attempts: 1,
        port_kill_grace: Duration::ZERO,
        connect_attempts: 20,
        connect_backoff: Duration::from_millis(50),
        io_timeout: Duration::from_secs(10),
        shutdown_timeout: Duration::from_secs(10),
        startup_delay: Duration::ZERO,
    }
}

pub fn feature_env(num_actions: usize, features: usize) -> EnvConfig {
    EnvConfig {
        num_actions,
        observation_includes_image: false,
        image_resize_to: None,
        observation_stack: None,
        num_observation_features: Some(features),
        pre_init: false,
        time_limit: None,
    }
}

pub fn image_env(num_actions: usize, stack: usize) -> EnvConfig {
    EnvConfig {
        num_actions,
        observation_includes_image: true,
        image_resize_to: Some([1, 1]),
        observation_stack: Some(stack),
        num_observation_features: None,
        pre_init: false,
        time_limit: None,
    }
}

pub fn harness_config(
    scratch: &Path,
    port: u16,
    pre_init_port: Option<u16>,
    env: EnvConfig,
) -> HarnessConfig {
    HarnessConfig {
        identifier: format!("env_{port}"),
        game_exe: stub_game(scratch),
        host: DEFAULT_HOST.to_string(),
        port,
        pre_init_port,
        game_config_path: scratch.join("game.json"),
        work_dir: scratch.join("work"),
        training_mode: true,
        env,
        supervisor: fast_supervisor(),
    }
}
