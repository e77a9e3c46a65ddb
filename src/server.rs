// server.rs — unix-socket listener and the single-client session loop
//
// The server owns one listener and at most one client at a time. Both
// descriptors are published into mutex-protected slots so teardown from
// another thread can take and close them; a slot is always cleared before
// the descriptor is dropped. The accept and read paths poll with short
// timeouts so the stop flag is honored promptly.

use std::fs;
use std::io::{self, ErrorKind};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::codec::LineReader;
use crate::completion::CompletionBoard;
use crate::core::Core;
use crate::dispatch::{Dispatcher, SessionAction};
use crate::input::InputShadow;

const ACCEPT_RETRY: Duration = Duration::from_millis(10);
const READ_TIMEOUT: Duration = Duration::from_millis(200);

// ── endpoint parsing ──────────────────────────────────────────────────────────

/// Resolve an `--agent-server` endpoint to a socket path. Accepts a bare
/// filesystem path or a `unix:` prefix; `tcp:` is explicitly rejected.
pub fn socket_path_from_endpoint(endpoint: &str) -> io::Result<PathBuf> {
    let path = endpoint.strip_prefix("unix:").unwrap_or(endpoint);
    if path.starts_with("tcp:") {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "tcp: endpoints are not implemented",
        ));
    }
    if path.is_empty() {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            "invalid unix socket path",
        ));
    }
    Ok(PathBuf::from(path))
}

// ── shared server state ───────────────────────────────────────────────────────

struct ServerShared {
    stop: Arc<AtomicBool>,
    socket_path: PathBuf,
    listener: Mutex<Option<UnixListener>>,
    client: Mutex<Option<UnixStream>>,
}

impl ServerShared {
    fn take_listener(&self) -> Option<UnixListener> {
        self.listener.lock().unwrap().take()
    }

    fn take_client(&self) -> Option<UnixStream> {
        self.client.lock().unwrap().take()
    }
}

// ── server handle ─────────────────────────────────────────────────────────────

/// Owns the agent server thread. `start` binds synchronously so bootstrap
/// failures surface immediately; the accept/session loop runs until `stop`
/// (or a successful `shutdown` command from a client).
pub struct AgentServer {
    shared: Arc<ServerShared>,
    thread: Option<JoinHandle<()>>,
}

impl AgentServer {
    pub fn start(
        endpoint: &str,
        core: Arc<dyn Core>,
        shadow: Arc<InputShadow>,
        board: Arc<CompletionBoard>,
    ) -> io::Result<Self> {
        let socket_path = socket_path_from_endpoint(endpoint)?;

        // clear a stale socket from a previous run
        let _ = fs::remove_file(&socket_path);
        let listener = UnixListener::bind(&socket_path)?;
        listener.set_nonblocking(true)?;
        tracing::info!("agent server listening on {}", socket_path.display());

        let stop = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(ServerShared {
            stop: stop.clone(),
            socket_path,
            listener: Mutex::new(Some(listener)),
            client: Mutex::new(None),
        });

        let dispatcher = Dispatcher::new(core, shadow, board, stop);
        let thread = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("agent-server".into())
                .spawn(move || run_loop(&shared, &dispatcher))?
        };

        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// The flag a successful `shutdown` command raises; the host polls it
    /// to know when to wind down the emulator.
    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.shared.stop.clone()
    }

    pub fn socket_path(&self) -> &Path {
        &self.shared.socket_path
    }

    /// Stop the server: raise the flag, close the client then the
    /// listener, unlink the socket path, and join the thread.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);

        if let Some(client) = self.shared.take_client() {
            let _ = client.shutdown(std::net::Shutdown::Both);
        }
        if let Some(listener) = self.shared.take_listener() {
            drop(listener);
            let _ = fs::remove_file(&self.shared.socket_path);
        }

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for AgentServer {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── accept loop ───────────────────────────────────────────────────────────────

fn run_loop(shared: &ServerShared, dispatcher: &Dispatcher) {
    while !shared.stop.load(Ordering::SeqCst) {
        let accepted = {
            let guard = shared.listener.lock().unwrap();
            match guard.as_ref() {
                Some(listener) => listener.accept(),
                None => break, // teardown took the listener
            }
        };

        let stream = match accepted {
            Ok((stream, _)) => stream,
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_RETRY);
                continue;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                if !shared.stop.load(Ordering::SeqCst) {
                    tracing::warn!("agent accept error: {e}");
                    std::thread::sleep(ACCEPT_RETRY);
                }
                continue;
            }
        };

        tracing::info!("agent client connected");
        if let Err(e) = serve_client(shared, dispatcher, stream) {
            tracing::debug!("agent session ended with error: {e}");
        }
        // clear the slot before the descriptor goes away
        drop(shared.take_client());
        tracing::info!("agent client disconnected");
    }

    if let Some(listener) = shared.take_listener() {
        drop(listener);
        let _ = fs::remove_file(&shared.socket_path);
    }
    tracing::info!("agent server stopped");
}

// ── session ───────────────────────────────────────────────────────────────────

fn serve_client(
    shared: &ServerShared,
    dispatcher: &Dispatcher,
    stream: UnixStream,
) -> io::Result<()> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    *shared.client.lock().unwrap() = Some(stream.try_clone()?);

    let mut reader = LineReader::new(stream.try_clone()?);
    let mut writer = stream;

    while !shared.stop.load(Ordering::SeqCst) {
        let line = match reader.next_line() {
            Ok(Some(line)) => line,
            Ok(None) => break, // EOF
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                continue;
            }
            Err(e) => return Err(e),
        };
        if line.text.is_empty() {
            continue;
        }

        let (response, action) = dispatcher.handle(&line);
        response.write_to(&mut writer)?;
        if action == SessionAction::Terminate {
            break;
        }
    }
    Ok(())
}

// ── tests ─────────────────────────────────────────────────────────────────────
