use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::SupervisorConfig;
use crate::error::{HarnessError, Result};
use crate::process::{GameProcess, PortInspector, ProcessSpec};
use crate::protocol::{Command, Handshake, StepMessage};
use crate::transport::Transport;

/// Lifecycle of one supervised (process, connection) pair. Progress only moves
/// forward, except that `Closed` can be entered from anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    NotStarted,
    Started,
    Connected,
    Ready,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    /// Operations wait (bounded by the io timeout) until they complete.
    Blocking,
    /// Operations make one attempt and report whether they got anywhere.
    NonBlocking,
}

// =============================================================================
// Socket Helpers
// =============================================================================

fn open_socket(addr: &SocketAddr, mode: IoMode, timeout: Duration) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(*addr), Type::STREAM, Some(Protocol::TCP))?;
    configure_socket(&socket, mode, timeout)?;
    Ok(socket)
}

fn configure_socket(socket: &Socket, mode: IoMode, timeout: Duration) -> io::Result<()> {
    match mode {
        IoMode::Blocking => {
            socket.set_nonblocking(false)?;
            socket.set_read_timeout(Some(timeout))?;
            socket.set_write_timeout(Some(timeout))?;
        }
        IoMode::NonBlocking => socket.set_nonblocking(true)?,
    }
    Ok(())
}

#[cfg(unix)]
fn is_already_connected(err: &io::Error) -> bool {
    err.raw_os_error() == Some(nix::libc::EISCONN)
}

#[cfg(not(unix))]
fn is_already_connected(err: &io::Error) -> bool {
    // WSAEISCONN
    err.raw_os_error() == Some(10056)
}

#[cfg(unix)]
fn is_connect_pending(err: &io::Error) -> bool {
    use nix::libc::{EALREADY, EINPROGRESS};
    err.kind() == io::ErrorKind::WouldBlock
        || matches!(err.raw_os_error(), Some(code) if code == EINPROGRESS || code == EALREADY)
}

#[cfg(not(unix))]
fn is_connect_pending(err: &io::Error) -> bool {
    // WSAEWOULDBLOCK, WSAEINPROGRESS, WSAEALREADY
    err.kind() == io::ErrorKind::WouldBlock
        || matches!(err.raw_os_error(), Some(10035 | 10036 | 10037))
}

fn is_connect_retryable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused | io::ErrorKind::TimedOut
    )
}

/// Calls `try_once` with attempt numbers `1..=max_attempts` until it succeeds,
/// sleeping `backoff` between refused or timed-out attempts. Any other error
/// is returned immediately. `Ok(false)` means every attempt was refused.
pub(crate) fn connect_with_retry<F>(max_attempts: u32, backoff: Duration, mut try_once: F) -> io::Result<bool>
where
    F: FnMut(u32) -> io::Result<()>,
{
    for attempt in 1..=max_attempts {
        match try_once(attempt) {
            Ok(()) => return Ok(true),
            Err(e) if is_connect_retryable(&e) => {
                debug!(attempt, max_attempts, error = %e, "connect attempt failed");
                if attempt < max_attempts {
                    std::thread::sleep(backoff);
                }
            }
            Err(e) => return Err(e),
        }
    }
    Ok(false)
}

// =============================================================================
// Game Instance
// =============================================================================

pub struct GameInstance {
    process: GameProcess,
    transport: Option<Transport<Socket>>,
    addr: Option<SocketAddr>,
    mode: IoMode,
    state: ConnectionState,
    init_msg: Option<Handshake>,
    inspector: Arc<dyn PortInspector>,
    tuning: SupervisorConfig,
}

impl GameInstance {
    pub fn new(
        spec: ProcessSpec,
        mode: IoMode,
        inspector: Arc<dyn PortInspector>,
        tuning: SupervisorConfig,
    ) -> Self {
        Self {
            process: GameProcess::new(spec),
            transport: None,
            addr: None,
            mode,
            state: ConnectionState::NotStarted,
            init_msg: None,
            inspector,
            tuning,
        }
    }

    pub fn port(&self) -> u16 {
        self.process.port()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.state >= ConnectionState::Started && self.state != ConnectionState::Closed
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connected | ConnectionState::Ready
        )
    }

    pub fn is_initialized(&self) -> bool {
        self.state == ConnectionState::Ready
    }

    pub fn init_message(&self) -> Option<&Handshake> {
        self.init_msg.as_ref()
    }

    fn expect_mode(&self, mode: IoMode, op: &str) -> Result<()> {
        if self.mode != mode {
            return Err(HarnessError::invalid_state(format!(
                "{op} requires {mode:?} mode, instance on port {} is {:?}",
                self.port(),
                self.mode
            )));
        }
        Ok(())
    }

    fn expect_state(&self, state: ConnectionState, op: &str) -> Result<()> {
        if self.state != state {
            return Err(HarnessError::invalid_state(format!(
                "{op} requires {state:?}, instance on port {} is {:?}",
                self.port(),
                self.state
            )));
        }
        Ok(())
    }

    fn transport_mut(&mut self) -> Result<&mut Transport<Socket>> {
        let port = self.process.port();
        self.transport
            .as_mut()
            .ok_or_else(|| HarnessError::invalid_state(format!("no socket for port {port}")))
    }

    fn reopen_socket(&mut self) -> Result<()> {
        let addr = self
            .addr
            .ok_or_else(|| HarnessError::invalid_state("socket address not resolved"))?;
        let socket = open_socket(&addr, self.mode, self.tuning.io_timeout)?;
        self.transport_mut()?.replace_stream(socket);
        Ok(())
    }

    pub fn set_mode(&mut self, mode: IoMode) -> Result<()> {
        if self.mode == mode {
            return Ok(());
        }
        self.mode = mode;
        if self.state == ConnectionState::Started && self.transport.is_some() {
            // a connect left pending in the old mode cannot be resumed
            return self.reopen_socket();
        }
        let timeout = self.tuning.io_timeout;
        if let Some(transport) = self.transport.as_ref() {
            configure_socket(transport.stream(), mode, timeout)?;
        }
        Ok(())
    }

    /// Spawns the game process and opens an unconnected socket toward it.
    pub fn start(&mut self) -> Result<()> {
        self.expect_state(ConnectionState::NotStarted, "start")?;
        let spec = self.process.spec();
        let addr = (spec.host.as_str(), spec.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| {
                HarnessError::config(format!("host {} did not resolve", spec.host))
            })?;
        self.process.start(self.inspector.as_ref(), &self.tuning)?;
        let socket = open_socket(&addr, self.mode, self.tuning.io_timeout)?;
        self.addr = Some(addr);
        self.transport = Some(Transport::new(socket));
        self.state = ConnectionState::Started;
        Ok(())
    }

    /// Blocking connect with bounded retries.
    pub fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            warn!(port = self.port(), "connect() called on an already connected game instance");
            return Ok(());
        }
        self.expect_state(ConnectionState::Started, "connect")?;
        self.expect_mode(IoMode::Blocking, "connect")?;

        let addr = self
            .addr
            .ok_or_else(|| HarnessError::invalid_state("socket address not resolved"))?;
        let target = SockAddr::from(addr);
        let timeout = self.tuning.io_timeout;
        let mode = self.mode;
        let max_attempts = self.tuning.connect_attempts;
        let transport = self
            .transport
            .as_mut()
            .ok_or_else(|| HarnessError::invalid_state("connect before start"))?;

        let connected = connect_with_retry(max_attempts, self.tuning.connect_backoff, |attempt| {
            if attempt > 1 {
                transport.replace_stream(open_socket(&addr, mode, timeout)?);
            }
            match transport.stream().connect_timeout(&target, timeout) {
                Err(e) if is_already_connected(&e) => Ok(()),
                other => other,
            }
        })?;
        if !connected {
            return Err(HarnessError::ConnectFailed {
                host: addr.ip().to_string(),
                port: addr.port(),
                attempts: max_attempts,
            });
        }
        info!(port = addr.port(), "connected to game instance");
        self.state = ConnectionState::Connected;
        Ok(())
    }

    /// One non-blocking connect attempt. Returns whether the connection is up.
    pub fn try_connect(&mut self) -> Result<bool> {
        if self.is_connected() {
            return Ok(true);
        }
        self.expect_state(ConnectionState::Started, "try_connect")?;
        self.expect_mode(IoMode::NonBlocking, "try_connect")?;

        let addr = self
            .addr
            .ok_or_else(|| HarnessError::invalid_state("socket address not resolved"))?;
        let result = self.transport_mut()?.stream().connect(&SockAddr::from(addr));
        match result {
            Ok(()) => {}
            Err(e) if is_already_connected(&e) => {}
            Err(e) if is_connect_pending(&e) => return Ok(false),
            Err(e) if is_connect_retryable(&e) => {
                // a failed socket cannot be reused for the next attempt
                debug!(port = addr.port(), error = %e, "background connect refused");
                self.reopen_socket()?;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }
        debug!(port = addr.port(), "background instance connected");
        self.state = ConnectionState::Connected;
        Ok(true)
    }

    /// Blocks until the server sends a handshake with `ready = true`.
    pub fn initialize(&mut self) -> Result<()> {
        if self.is_initialized() {
            warn!(port = self.port(), "initialize() called on an already initialized game instance");
            return Ok(());
        }
        self.expect_state(ConnectionState::Connected, "initialize")?;
        self.expect_mode(IoMode::Blocking, "initialize")?;
        loop {
            let msg = self.transport_mut()?.receive()?;
            if let Some(handshake) = Handshake::decode(msg)? {
                info!(port = self.port(), num_actions = handshake.num_actions, "game instance ready");
                self.init_msg = Some(handshake);
                self.state = ConnectionState::Ready;
                return Ok(());
            }
        }
    }

    /// One non-blocking receive. Returns whether the instance is now ready.
    pub fn try_initialize(&mut self) -> Result<bool> {
        if self.is_initialized() {
            return Ok(true);
        }
        self.expect_state(ConnectionState::Connected, "try_initialize")?;
        self.expect_mode(IoMode::NonBlocking, "try_initialize")?;
        let Some(msg) = self.transport_mut()?.poll()? else {
            return Ok(false);
        };
        match Handshake::decode(msg)? {
            Some(handshake) => {
                debug!(port = self.port(), "background instance ready");
                self.init_msg = Some(handshake);
                self.state = ConnectionState::Ready;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn send_action(&mut self, action: usize) -> Result<()> {
        self.expect_state(ConnectionState::Ready, "send_action")?;
        self.transport_mut()?.send(&Command::action(action))
    }

    /// Keeps a warmed-up instance in its holding pattern.
    pub fn send_wait(&mut self) -> Result<()> {
        self.expect_state(ConnectionState::Ready, "send_wait")?;
        self.transport_mut()?.send(&Command::wait())
    }

    pub fn receive_state(&mut self) -> Result<StepMessage> {
        self.expect_state(ConnectionState::Ready, "receive_state")?;
        self.expect_mode(IoMode::Blocking, "receive_state")?;
        let msg = self.transport_mut()?.receive()?;
        StepMessage::decode(msg)
    }

    /// Closes the socket, then kills the process. Safe from any state.
    pub fn close(&mut self) -> Result<()> {
        if let Some(transport) = self.transport.take() {
            let socket = transport.into_inner();
            let _ = socket.shutdown(Shutdown::Both);
        }
        self.state = ConnectionState::Closed;
        let pid = self.process.pid();
        self.process.close(self.tuning.shutdown_timeout)?;
        if let Some(pid) = pid {
            debug!(port = self.port(), pid, "game instance closed");
        }
        Ok(())
    }
}
