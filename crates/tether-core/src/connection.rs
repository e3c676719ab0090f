//! Link to the external audio server
//!
//! A [`Connection`] owns at most one open [`ServerClient`]. The backend holds
//! the connection; the port engine borrows it through an `Arc` and never
//! outlives it.
//!
//! The server may drop us at any time (device unplugged, server killed). The
//! shutdown hook installed at open time flips `connected`, moves the dead
//! client aside and runs the disconnect listeners on whatever thread the
//! server used to deliver the notice. The dead client is closed later from
//! the control side (next `open` or `close`), never from inside the server's
//! own callback.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;

use crate::error::{ConnectionError, ServerError};
use crate::rt;
use crate::server::{AudioServer, ServerClient, ShutdownHook};
use crate::sync::lock;

/// Receives the server's reason when it drops the connection
pub type DisconnectListener = Box<dyn Fn(&str) + Send + Sync>;

/// Token returned by [`Connection::on_disconnect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Shared {
    connected: AtomicBool,
    /// Present exactly while connected
    client: Mutex<Option<Arc<dyn ServerClient>>>,
    /// Client the server dropped, waiting to be closed by the control side
    dead: Mutex<Option<Arc<dyn ServerClient>>>,
    /// Bumped on every open and close so a late shutdown notice from an old
    /// client cannot mark a newer one down
    generation: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, DisconnectListener)>>,
    next_listener: AtomicU64,
}

impl Shared {
    fn server_shutdown(&self, generation: u64, reason: &str) {
        if self.generation.load(Ordering::Acquire) != generation {
            log::debug!("[CONN] ignoring shutdown notice for a previous client");
            return;
        }
        self.connected.store(false, Ordering::Release);
        let dead = lock(&self.client).take();
        if dead.is_some() {
            *lock(&self.dead) = dead;
        }
        log::warn!("[CONN] server dropped the connection: {}", reason);
        for (_, listener) in lock(&self.listeners).iter() {
            listener(reason);
        }
    }
}

/// Clears the in-flight flag when an open attempt ends
struct OpenAttempt<'a>(&'a AtomicBool);

impl Drop for OpenAttempt<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Connection {
    server: Arc<dyn AudioServer>,
    requested_name: String,
    session_id: Option<String>,
    assigned_name: Mutex<Option<String>>,
    opening: AtomicBool,
    in_control: bool,
    shared: Arc<Shared>,
}

impl Connection {
    /// Create an unopened connection
    ///
    /// Whether a server is already running is sampled here: if none is, we
    /// are considered to be in control of the server we later talk to.
    pub fn new(
        server: Arc<dyn AudioServer>,
        client_name: impl Into<String>,
        session_id: Option<String>,
    ) -> Self {
        let in_control = !server.is_running();
        Self {
            server,
            requested_name: client_name.into(),
            session_id,
            assigned_name: Mutex::new(None),
            opening: AtomicBool::new(false),
            in_control,
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                client: Mutex::new(None),
                dead: Mutex::new(None),
                generation: AtomicU64::new(0),
                listeners: Mutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
            }),
        }
    }

    /// Open a client on the server
    ///
    /// No-op if already open. Fails fast without retrying.
    pub fn open(&self) -> Result<(), ConnectionError> {
        if self.connected() {
            return Ok(());
        }
        if self.opening.swap(true, Ordering::AcqRel) {
            return Err(ConnectionError::OpenInProgress);
        }
        let _attempt = OpenAttempt(&self.opening);
        self.reap_dead_client();

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let weak: Weak<Shared> = Arc::downgrade(&self.shared);
        let hook: ShutdownHook = Arc::new(move |reason: &str| {
            if let Some(shared) = weak.upgrade() {
                shared.server_shutdown(generation, reason);
            }
        });

        let client = self
            .server
            .open(&self.requested_name, self.session_id.as_deref(), hook)
            .map_err(|e| match e {
                ServerError::Rejected { reason, .. } => ConnectionError::NameRejected(reason),
                ServerError::Unavailable(reason) => ConnectionError::ServerUnreachable(reason),
                other => ConnectionError::ServerUnreachable(other.to_string()),
            })?;

        let assigned = client.name();
        if assigned != self.requested_name {
            log::info!(
                "[CONN] server assigned name '{}' (requested '{}')",
                assigned,
                self.requested_name
            );
        }
        *lock(&self.assigned_name) = Some(assigned);
        *lock(&self.shared.client) = Some(client);
        self.shared.connected.store(true, Ordering::Release);
        log::info!("[CONN] connected to {} server", self.server.name());
        Ok(())
    }

    /// Release the client
    ///
    /// No-op when already closed. Refused on the realtime thread.
    pub fn close(&self) -> Result<(), ConnectionError> {
        if rt::is_process_thread() {
            return Err(ConnectionError::RealtimeThread);
        }
        let client = lock(&self.shared.client).take();
        self.shared.connected.store(false, Ordering::Release);
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        if let Some(client) = client {
            client.close();
            log::info!("[CONN] disconnected from {} server", self.server.name());
        }
        self.reap_dead_client();
        Ok(())
    }

    /// Close a client the server shut down
    fn reap_dead_client(&self) {
        let dead = lock(&self.shared.dead).take();
        if let Some(client) = dead {
            client.close();
            log::debug!("[CONN] closed client '{}' dropped by the server", client.name());
        }
    }

    /// Lock-free connection state
    pub fn connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    /// Open client, if connected
    pub fn client(&self) -> Option<Arc<dyn ServerClient>> {
        if !self.connected() {
            return None;
        }
        lock(&self.shared.client).clone()
    }

    /// Name the server assigned, or the requested name before first open
    pub fn client_name(&self) -> String {
        lock(&self.assigned_name)
            .clone()
            .unwrap_or_else(|| self.requested_name.clone())
    }

    pub fn requested_name(&self) -> &str {
        &self.requested_name
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn server(&self) -> &Arc<dyn AudioServer> {
        &self.server
    }

    /// True if no server was running when this connection was created
    pub fn in_control(&self) -> bool {
        self.in_control
    }

    /// Probe for a reachable server with a throw-away client
    pub fn server_running(&self) -> bool {
        self.connected() || self.server.is_running()
    }

    /// Call `listener` with the reason whenever the server drops us
    pub fn on_disconnect(&self, listener: DisconnectListener) -> ListenerId {
        let id = ListenerId(self.shared.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.shared.listeners).push((id, listener));
        id
    }

    pub fn remove_disconnect_listener(&self, id: ListenerId) {
        lock(&self.shared.listeners).retain(|(existing, _)| *existing != id);
    }

    /// Spawn a thread scheduled like the server's process thread
    pub fn spawn_realtime<F>(
        &self,
        name: &str,
        stack_size: usize,
        f: F,
    ) -> Result<JoinHandle<()>, ConnectionError>
    where
        F: FnOnce() + Send + 'static,
    {
        let client = self.client().ok_or(ConnectionError::NotConnected)?;
        client
            .spawn_realtime(name, stack_size, Box::new(f))
            .map_err(|e| ConnectionError::ThreadSpawn(e.to_string()))
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::error!("[CONN] close on drop failed: {}", e);
        }
    }
}
