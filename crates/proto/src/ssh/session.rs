//! The transport-layer session core.
//!
//! A [`Session`] owns one SSH connection from identification exchange to
//! disconnect: it feeds arriving bytes through the packet decoder,
//! dispatches decoded messages by opcode, drives the key exchange state
//! machine, queues non-transport writes while a key exchange is running,
//! tracks rekey triggers and timeouts, and routes everything else to the
//! current upstream [`Service`].
//!
//! # Locking
//!
//! The session is driven by an external asynchronous I/O runtime that
//! delivers byte arrivals as calls to [`Session::data_received`]. Internally
//! four locks serialize the moving parts, always acquired in this order:
//!
//! 1. decoder: inbound framing and inline dispatch
//! 2. core: KEX fields, proposals, current service
//! 3. pending: the queue of writes parked during key exchange
//! 4. encoder: outbound framing and the handoff to the I/O session
//!
//! The codec never blocks or awaits while holding a lock; a partial packet
//! simply ends the decode pass.

use crate::ssh::buffer::Buffer;
use crate::ssh::codec::{Decoder, Encoder, TrafficCounters};
use crate::ssh::crypto::{Cipher, CipherMode, Compression, Digest, Mac, Random};
use crate::ssh::factory::FactoryManager;
use crate::ssh::future::{KexFuture, SshFuture, WriteFuture};
use crate::ssh::io::IoSession;
use crate::ssh::kex::{create_kex, derive_keys, resize_key, KexState};
use crate::ssh::listener::{
    ChannelEvent, ChannelListener, ListenerSet, SessionEvent, SessionListener,
};
use crate::ssh::message::{
    disconnect, disconnect_code, MessageType, SSH_MSG_KEX_FIRST, SSH_MSG_KEX_LAST,
};
use crate::ssh::negotiation::{self, Proposal, ProposalSlot};
use crate::ssh::service::Service;
use crate::ssh::version::{read_identification, Version};
use skiff_platform::{SkiffError, SkiffResult};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Which side of the connection this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We initiated the connection.
    Client,
    /// We accepted the connection.
    Server,
}

impl Role {
    /// Whether this is the server side.
    pub fn is_server(&self) -> bool {
        matches!(self, Role::Server)
    }
}

/// Which timeout, if any, tore the session down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TimeoutStatus {
    /// No timeout has fired.
    NoTimeout = 0,
    /// The peer did not authenticate in time.
    AuthTimeout = 1,
    /// The session sat idle past the limit.
    IdleTimeout = 2,
}

impl TimeoutStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TimeoutStatus::AuthTimeout,
            2 => TimeoutStatus::IdleTimeout,
            _ => TimeoutStatus::NoTimeout,
        }
    }
}

struct PendingPacket {
    buffer: Buffer,
    future: Arc<WriteFuture>,
}

/// Session state guarded by the core lock.
struct SessionCore {
    local_version: String,
    remote_version: Option<String>,
    session_id: Option<Vec<u8>>,
    local_proposal: Option<Proposal>,
    remote_proposal: Option<Proposal>,
    negotiated: Option<Proposal>,
    local_kexinit: Option<Vec<u8>>,
    remote_kexinit: Option<Vec<u8>>,
    kex: Option<Box<dyn crate::ssh::kex::KeyExchange>>,
    current_service: Option<(String, Box<dyn Service>)>,
    pending_service: Option<(String, Arc<SshFuture<()>>)>,
    username: Option<String>,
}

/// One SSH connection's transport state machine.
pub struct Session {
    /// Back-reference handed to services and completion listeners.
    me: Weak<Session>,
    role: Role,
    manager: Arc<FactoryManager>,
    io: Arc<dyn IoSession>,

    core: Mutex<SessionCore>,
    decoder: Mutex<Decoder>,
    encoder: Mutex<Encoder>,
    random: Mutex<Box<dyn Random>>,

    ident_received: AtomicBool,
    authed: AtomicBool,
    closing: AtomicBool,

    kex_state: AtomicU8,
    kex_future: Mutex<Option<Arc<KexFuture>>>,
    pending: Mutex<VecDeque<PendingPacket>>,

    request_lock: Mutex<()>,
    request_slot: Mutex<Option<Option<Buffer>>>,
    request_cond: Condvar,

    in_counters: TrafficCounters,
    out_counters: TrafficCounters,
    last_ingress_seq: AtomicU32,

    epoch: Instant,
    last_key_time: AtomicU64,
    auth_deadline: AtomicU64,
    idle_deadline: AtomicU64,
    auth_timeout_ms: u64,
    idle_timeout_ms: u64,
    disconnect_timeout_ms: u64,
    rekey_bytes_limit: u64,
    rekey_time_limit_ms: u64,
    timeout_status: AtomicU8,

    attributes: Mutex<HashMap<String, String>>,
    session_listeners: ListenerSet<dyn SessionListener>,
    channel_listeners: ListenerSet<dyn ChannelListener>,
}

impl Session {
    /// Creates a session over an established byte stream and starts it:
    /// the identification banner and the initial `SSH_MSG_KEXINIT` go out
    /// immediately.
    pub fn new(
        role: Role,
        manager: Arc<FactoryManager>,
        io: Arc<dyn IoSession>,
    ) -> SkiffResult<Arc<Self>> {
        let auth_timeout_ms = manager.auth_timeout_ms();
        let idle_timeout_ms = manager.idle_timeout_ms();
        let local_version = manager.version().to_string();

        let session = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            role,
            io,
            core: Mutex::new(SessionCore {
                local_version,
                remote_version: None,
                session_id: None,
                local_proposal: None,
                remote_proposal: None,
                negotiated: None,
                local_kexinit: None,
                remote_kexinit: None,
                kex: None,
                current_service: None,
                pending_service: None,
                username: None,
            }),
            decoder: Mutex::new(Decoder::new()),
            encoder: Mutex::new(Encoder::new(manager.create_random())),
            random: Mutex::new(manager.create_random()),
            ident_received: AtomicBool::new(false),
            authed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            kex_state: AtomicU8::new(KexState::Unknown as u8),
            kex_future: Mutex::new(None),
            pending: Mutex::new(VecDeque::new()),
            request_lock: Mutex::new(()),
            request_slot: Mutex::new(None),
            request_cond: Condvar::new(),
            in_counters: TrafficCounters::default(),
            out_counters: TrafficCounters::default(),
            last_ingress_seq: AtomicU32::new(0),
            epoch: Instant::now(),
            last_key_time: AtomicU64::new(0),
            auth_deadline: AtomicU64::new(auth_timeout_ms),
            idle_deadline: AtomicU64::new(idle_timeout_ms),
            auth_timeout_ms,
            idle_timeout_ms,
            disconnect_timeout_ms: manager.disconnect_timeout_ms(),
            rekey_bytes_limit: manager.rekey_bytes_limit(),
            rekey_time_limit_ms: manager.rekey_time_limit_ms(),
            timeout_status: AtomicU8::new(TimeoutStatus::NoTimeout as u8),
            attributes: Mutex::new(HashMap::new()),
            session_listeners: ListenerSet::new(),
            channel_listeners: ListenerSet::new(),
            manager,
        });

        session.start()?;
        Ok(session)
    }

    fn start(&self) -> SkiffResult<()> {
        let ident = self.core.lock().expect("core poisoned").local_version.clone();
        debug!(%ident, "Send identification");
        self.io
            .write(Buffer::from_vec(format!("{}\r\n", ident).into_bytes()));

        let mut core = self.core.lock().expect("core poisoned");
        self.kex_state
            .store(KexState::Init as u8, Ordering::Release);
        self.send_kex_init(&mut core)?;
        Ok(())
    }

    // --- accessors ---

    /// The owning `Arc`, recovered from the back-reference.
    ///
    /// Valid for the session's whole lifetime: every caller reaches the
    /// session through an `Arc` in the first place.
    fn arc(&self) -> Arc<Session> {
        self.me.upgrade().expect("session still referenced")
    }

    /// This session's side of the connection.
    pub fn role(&self) -> Role {
        self.role
    }

    /// The shared factory manager.
    pub fn factory_manager(&self) -> &Arc<FactoryManager> {
        &self.manager
    }

    /// Our identification string (without line ending).
    pub fn local_version(&self) -> String {
        self.core.lock().expect("core poisoned").local_version.clone()
    }

    /// The peer's identification string, once received.
    pub fn remote_version(&self) -> Option<String> {
        self.core.lock().expect("core poisoned").remote_version.clone()
    }

    /// The session id (exchange hash of the first key exchange).
    pub fn session_id(&self) -> Option<Vec<u8>> {
        self.core.lock().expect("core poisoned").session_id.clone()
    }

    /// The negotiated algorithm for one proposal slot.
    pub fn negotiated(&self, slot: ProposalSlot) -> Option<String> {
        self.core
            .lock()
            .expect("core poisoned")
            .negotiated
            .as_ref()
            .map(|p| p.get(slot).to_string())
    }

    /// Current key exchange state.
    pub fn kex_state(&self) -> KexState {
        KexState::from_u8(self.kex_state.load(Ordering::Acquire))
    }

    fn cas_kex_state(&self, from: KexState, to: KexState) -> bool {
        self.kex_state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether the upstream service reported authentication.
    pub fn is_authenticated(&self) -> bool {
        self.authed.load(Ordering::Acquire)
    }

    /// Marks the session authenticated and fires the event.
    ///
    /// The userauth service must call this after sending
    /// `SSH_MSG_USERAUTH_SUCCESS` and before the next ingress packet is
    /// dispatched, so delayed compression activates on the right packet.
    pub fn set_authenticated(&self) {
        self.authed.store(true, Ordering::Release);
        self.fire_session_event(SessionEvent::Authenticated);
    }

    /// The authenticated username, if set.
    pub fn username(&self) -> Option<String> {
        self.core.lock().expect("core poisoned").username.clone()
    }

    /// Records the authenticated username.
    pub fn set_username(&self, username: &str) {
        self.core.lock().expect("core poisoned").username = Some(username.to_string());
    }

    /// Whether the session has started closing.
    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Which timeout fired, if any.
    pub fn timeout_status(&self) -> TimeoutStatus {
        TimeoutStatus::from_u8(self.timeout_status.load(Ordering::Acquire))
    }

    /// Bytes sent since the last key installation.
    pub fn out_bytes(&self) -> u64 {
        self.out_counters.bytes()
    }

    /// Bytes received since the last key installation.
    pub fn in_bytes(&self) -> u64 {
        self.in_counters.bytes()
    }

    /// Reads a user attribute.
    pub fn attribute(&self, key: &str) -> Option<String> {
        self.attributes
            .lock()
            .expect("attributes poisoned")
            .get(key)
            .cloned()
    }

    /// Sets a user attribute, returning the previous value.
    pub fn set_attribute(&self, key: &str, value: impl Into<String>) -> Option<String> {
        self.attributes
            .lock()
            .expect("attributes poisoned")
            .insert(key.to_string(), value.into())
    }

    // --- listeners ---

    /// Registers a session listener (rejected once closing).
    pub fn add_session_listener(&self, listener: Arc<dyn SessionListener>) -> bool {
        self.session_listeners.add(listener)
    }

    /// Removes a session listener.
    pub fn remove_session_listener(&self, listener: &Arc<dyn SessionListener>) -> bool {
        self.session_listeners.remove(listener)
    }

    /// Registers a channel listener (rejected once closing).
    pub fn add_channel_listener(&self, listener: Arc<dyn ChannelListener>) -> bool {
        self.channel_listeners.add(listener)
    }

    /// Removes a channel listener.
    pub fn remove_channel_listener(&self, listener: &Arc<dyn ChannelListener>) -> bool {
        self.channel_listeners.remove(listener)
    }

    fn fire_session_event(&self, event: SessionEvent) {
        self.session_listeners.dispatch(|l| l.session_event(event));
    }

    /// Fans a channel event out to every channel listener.
    pub fn fire_channel_event(&self, channel_id: u32, event: ChannelEvent) {
        self.channel_listeners
            .dispatch(|l| l.channel_event(channel_id, event));
    }

    // --- ingress ---

    /// Main input point: appends received bytes and decodes as far as
    /// possible, dispatching every complete packet.
    ///
    /// On a fatal error the session disconnects (with the mapped reason
    /// code) or closes, and the error is also returned to the caller.
    pub fn data_received(&self, data: &[u8]) -> SkiffResult<()> {
        let result = self.do_data_received(data);
        if let Err(err) = &result {
            self.handle_failure(err);
        }
        result
    }

    fn do_data_received(&self, data: &[u8]) -> SkiffResult<()> {
        let mut decoder = self.decoder.lock().expect("decoder poisoned");
        decoder.feed(data);

        if !self.ident_received.load(Ordering::Acquire) {
            match read_identification(decoder.buffer_mut(), self.role.is_server())? {
                Some(line) => {
                    Version::parse(&line)?;
                    info!(ident = %line, "Peer identification");
                    self.core.lock().expect("core poisoned").remote_version = Some(line);
                    self.ident_received.store(true, Ordering::Release);
                    decoder.buffer_mut().compact();
                }
                None => return Ok(()),
            }
        }

        loop {
            let authed = self.authed.load(Ordering::Acquire);
            match decoder.decode_step(authed, &self.in_counters)? {
                Some(mut packet) => {
                    self.last_ingress_seq
                        .store(decoder.seq().wrapping_sub(1), Ordering::Relaxed);
                    self.handle_message(&mut decoder, &mut packet)?;
                }
                None => break,
            }
        }
        Ok(())
    }

    /// Mirrors the I/O layer's exception path: fatal errors try a single
    /// disconnect, anything else closes outright. Errors while already
    /// closing are ignored.
    fn handle_failure(&self, err: &SkiffError) {
        if self.is_closing() {
            return;
        }
        warn!(%err, "Exception caught");
        if let Some(code) = disconnect_code(err) {
            match self.disconnect(code, &err.to_string()) {
                Ok(_) => return,
                Err(inner) => debug!(%inner, code, "Exception while disconnect"),
            }
        }
        self.close(true);
    }

    fn handle_message(
        &self,
        decoder: &mut Decoder,
        buffer: &mut Buffer,
    ) -> SkiffResult<()> {
        let result = self.do_handle_message(decoder, buffer);
        if let Err(err) = &result {
            // An ongoing KEX must observe the failure.
            if let Some(future) = self.kex_future.lock().expect("kex future poisoned").as_ref() {
                future.fail(clone_error(err));
            }
        }
        result
    }

    fn do_handle_message(
        &self,
        decoder: &mut Decoder,
        buffer: &mut Buffer,
    ) -> SkiffResult<()> {
        let cmd = buffer.get_u8()?;
        match MessageType::from_u8(cmd) {
            Some(MessageType::Disconnect) => {
                let code = buffer.get_u32()?;
                let msg = buffer.get_string()?;
                debug!(code, %msg, "Received SSH_MSG_DISCONNECT");
                self.close(true);
            }
            Some(MessageType::Ignore) => {
                debug!("Received SSH_MSG_IGNORE");
            }
            Some(MessageType::Unimplemented) => {
                let seq = buffer.get_u32()?;
                debug!(seq, "Received SSH_MSG_UNIMPLEMENTED");
            }
            Some(MessageType::Debug) => {
                let display_flag = buffer.get_bool()?;
                let msg = buffer.get_string()?;
                debug!(display = display_flag, %msg, "Received SSH_MSG_DEBUG");
            }
            Some(MessageType::ServiceRequest) => self.handle_service_request(buffer)?,
            Some(MessageType::ServiceAccept) => self.handle_service_accept()?,
            Some(MessageType::KexInit) => self.handle_kex_init(buffer)?,
            Some(MessageType::NewKeys) => self.handle_new_keys(decoder, cmd)?,
            None => {
                if (SSH_MSG_KEX_FIRST..=SSH_MSG_KEX_LAST).contains(&cmd) {
                    self.validate_kex_state(cmd, KexState::Run)?;
                    buffer.set_rpos(buffer.rpos() - 1);
                    self.handle_kex_message(buffer)?;
                } else {
                    {
                        let mut core = self.core.lock().expect("core poisoned");
                        let session = self.arc();
                        let (_, service) = core.current_service.as_mut().ok_or_else(|| {
                            SkiffError::Protocol(format!("Unsupported command {}", cmd))
                        })?;
                        service.process(&session, cmd, buffer)?;
                    }
                    self.reset_idle_timeout();
                }
            }
        }
        self.check_rekey()
    }

    fn validate_kex_state(&self, cmd: u8, expected: KexState) -> SkiffResult<()> {
        let actual = self.kex_state();
        if actual != expected {
            return Err(SkiffError::Protocol(format!(
                "Received KEX command={} while in state={:?} instead of {:?}",
                cmd, actual, expected
            )));
        }
        Ok(())
    }

    // --- services ---

    fn handle_service_request(&self, buffer: &mut Buffer) -> SkiffResult<()> {
        let service = buffer.get_string()?;
        debug!(%service, "Received SSH_MSG_SERVICE_REQUEST");
        self.validate_kex_state(MessageType::ServiceRequest as u8, KexState::Done)?;
        if let Err(err) = self.start_service(&service) {
            debug!(%service, %err, "Service rejected");
            self.disconnect(
                disconnect::SERVICE_NOT_AVAILABLE,
                &format!("Bad service request: {}", service),
            )?;
            return Ok(());
        }
        debug!(%service, "Accepted service");
        let mut response = Buffer::packet(MessageType::ServiceAccept as u8);
        response.put_string(&service);
        self.write_packet(response)?;
        Ok(())
    }

    fn handle_service_accept(&self) -> SkiffResult<()> {
        debug!("Received SSH_MSG_SERVICE_ACCEPT");
        self.validate_kex_state(MessageType::ServiceAccept as u8, KexState::Done)?;
        let pending = self
            .core
            .lock()
            .expect("core poisoned")
            .pending_service
            .take();
        if let Some((name, future)) = pending {
            self.start_service(&name)?;
            future.complete(());
        }
        Ok(())
    }

    /// Starts the named service and makes it current.
    ///
    /// # Errors
    ///
    /// [`SkiffError::ServiceNotAvailable`] when no factory matches.
    pub fn start_service(&self, name: &str) -> SkiffResult<()> {
        let factory = self
            .manager
            .find_service_factory(name)
            .cloned()
            .ok_or_else(|| {
                SkiffError::ServiceNotAvailable(format!("Unknown service: {}", name))
            })?;
        let service = factory.create(&self.arc())?;
        let mut core = self.core.lock().expect("core poisoned");
        core.current_service = Some((name.to_string(), service));
        Ok(())
    }

    /// Client side: asks the server for a service by name.
    ///
    /// The returned future completes when `SSH_MSG_SERVICE_ACCEPT` arrives
    /// and the service has been started locally.
    pub fn request_service(&self, name: &str) -> SkiffResult<Arc<SshFuture<()>>> {
        let future: Arc<SshFuture<()>> = SshFuture::new();
        self.core.lock().expect("core poisoned").pending_service =
            Some((name.to_string(), Arc::clone(&future)));

        let mut buffer = Buffer::packet(MessageType::ServiceRequest as u8);
        buffer.put_string(name);
        self.write_packet(buffer)?;
        Ok(future)
    }

    // --- key exchange ---

    fn create_proposal(&self, host_keys: String) -> Proposal {
        let mut proposal = Proposal::new();
        proposal.set(ProposalSlot::KexAlgorithms, self.manager.kex_names());
        proposal.set(ProposalSlot::ServerHostKey, host_keys);
        let ciphers = self.manager.cipher_names();
        proposal.set(ProposalSlot::CipherClientToServer, ciphers.clone());
        proposal.set(ProposalSlot::CipherServerToClient, ciphers);
        let macs = self.manager.mac_names();
        proposal.set(ProposalSlot::MacClientToServer, macs.clone());
        proposal.set(ProposalSlot::MacServerToClient, macs);
        let compressions = self.manager.compression_names();
        proposal.set(ProposalSlot::CompressionClientToServer, compressions.clone());
        proposal.set(ProposalSlot::CompressionServerToClient, compressions);
        proposal.set(ProposalSlot::LanguageClientToServer, "");
        proposal.set(ProposalSlot::LanguageServerToClient, "");
        proposal
    }

    fn send_kex_init(&self, core: &mut SessionCore) -> SkiffResult<()> {
        let host_keys = self.manager.host_key_names();
        if host_keys.is_empty() {
            return Err(SkiffError::HostKeyUnverifiable(
                "No resolved signatures available".to_string(),
            ));
        }
        let proposal = self.create_proposal(host_keys);
        debug!("Send SSH_MSG_KEXINIT");
        let buffer = {
            let mut random = self.random.lock().expect("random poisoned");
            negotiation::encode_kexinit(&proposal, random.as_mut())
        };
        core.local_proposal = Some(proposal);
        core.local_kexinit = Some(buffer.to_payload());
        self.write_packet(buffer)?;
        Ok(())
    }

    fn handle_kex_init(&self, buffer: &mut Buffer) -> SkiffResult<()> {
        debug!("Received SSH_MSG_KEXINIT");
        let (proposal, payload) = negotiation::decode_kexinit(buffer)?;

        let mut core = self.core.lock().expect("core poisoned");
        core.remote_proposal = Some(proposal);
        core.remote_kexinit = Some(payload);

        if self.cas_kex_state(KexState::Done, KexState::Run) {
            // Peer-initiated rekey: our KEXINIT goes out first.
            self.send_kex_init(&mut core)?;
        } else if !self.cas_kex_state(KexState::Init, KexState::Run) {
            return Err(SkiffError::Protocol(format!(
                "Received SSH_MSG_KEXINIT while key exchange is running (state={:?})",
                self.kex_state()
            )));
        }

        let negotiated = {
            let local = core
                .local_proposal
                .as_ref()
                .ok_or_else(|| SkiffError::Protocol("Local proposal missing".to_string()))?;
            let remote = core
                .remote_proposal
                .as_ref()
                .ok_or_else(|| SkiffError::Protocol("Remote proposal missing".to_string()))?;
            match self.role {
                Role::Server => negotiation::negotiate(remote, local)?,
                Role::Client => negotiation::negotiate(local, remote)?,
            }
        };
        let kex_name = negotiated.get(ProposalSlot::KexAlgorithms).to_string();
        core.negotiated = Some(negotiated);

        let mut kex = create_kex(self.manager.kex_factories(), &kex_name)?;
        let local_version = core.local_version.clone();
        let remote_version = core
            .remote_version
            .clone()
            .ok_or_else(|| SkiffError::Protocol("Identification not exchanged".to_string()))?;
        let local_kexinit = core.local_kexinit.clone().unwrap_or_default();
        let remote_kexinit = core.remote_kexinit.clone().unwrap_or_default();
        let (v_s, v_c, i_s, i_c) = match self.role {
            Role::Server => (local_version, remote_version, local_kexinit, remote_kexinit),
            Role::Client => (remote_version, local_version, remote_kexinit, local_kexinit),
        };
        let output = kex.init(self.role, v_s.as_bytes(), v_c.as_bytes(), &i_s, &i_c)?;
        core.kex = Some(kex);
        drop(core);

        self.fire_session_event(SessionEvent::KexCompleted);
        for packet in output.packets {
            self.write_packet(packet)?;
        }
        Ok(())
    }

    fn handle_kex_message(&self, buffer: &mut Buffer) -> SkiffResult<()> {
        let output = {
            let mut core = self.core.lock().expect("core poisoned");
            let kex = core
                .kex
                .as_mut()
                .ok_or_else(|| SkiffError::Protocol("No key exchange in progress".to_string()))?;
            kex.next(buffer)?
        };
        for packet in output.packets {
            self.write_packet(packet)?;
        }
        if output.done {
            debug!("Send SSH_MSG_NEWKEYS");
            self.write_packet(Buffer::packet(MessageType::NewKeys as u8))?;
            self.kex_state
                .store(KexState::Keys as u8, Ordering::Release);
        }
        Ok(())
    }

    fn handle_new_keys(&self, decoder: &mut Decoder, cmd: u8) -> SkiffResult<()> {
        debug!("Received SSH_MSG_NEWKEYS");
        self.validate_kex_state(cmd, KexState::Keys)?;
        self.receive_new_keys(decoder)?;

        if let Some(future) = self.kex_future.lock().expect("kex future poisoned").as_ref() {
            future.complete(());
        }
        self.fire_session_event(SessionEvent::KeyEstablished);

        // Drain the queue under the pending and encode locks so nothing
        // accepted concurrently can slip ahead, then re-enter DONE while
        // still holding the queue.
        {
            let mut pending = self.pending.lock().expect("pending poisoned");
            if !pending.is_empty() {
                debug!(count = pending.len(), "Dequeuing pending packets");
                let mut encoder = self.encoder.lock().expect("encoder poisoned");
                let authed = self.authed.load(Ordering::Acquire);
                while let Some(packet) = pending.pop_front() {
                    let mut buffer = packet.buffer;
                    match encoder.encode(&mut buffer, authed, &self.out_counters) {
                        Ok(()) => self.io.write(buffer).chain(packet.future),
                        Err(err) => {
                            packet.future.fail(clone_error(&err));
                            return Err(err);
                        }
                    }
                }
            }
            self.kex_state
                .store(KexState::Done as u8, Ordering::Release);
        }
        Ok(())
    }

    /// Derives and installs the new keys on both codec halves.
    ///
    /// Byte/packet counters restart; sequence counters continue.
    fn receive_new_keys(&self, decoder: &mut Decoder) -> SkiffResult<()> {
        let mut core = self.core.lock().expect("core poisoned");
        let core = &mut *core;

        let (k, h, mut digest) = {
            let kex = core
                .kex
                .as_mut()
                .ok_or_else(|| SkiffError::Protocol("No key exchange in progress".to_string()))?;
            (
                kex.shared_secret()?.to_vec(),
                kex.exchange_hash()?.to_vec(),
                kex.digest(),
            )
        };

        if core.session_id.is_none() {
            core.session_id = Some(h.clone());
        }
        let session_id = core.session_id.as_ref().expect("session id set above");
        let keys = derive_keys(digest.as_mut(), &k, &h, session_id)?;
        let negotiated = core
            .negotiated
            .as_ref()
            .ok_or_else(|| SkiffError::Protocol("No negotiated algorithms".to_string()))?;

        let c2s = self.build_direction(
            digest.as_mut(),
            negotiated,
            ProposalSlot::CipherClientToServer,
            ProposalSlot::MacClientToServer,
            ProposalSlot::CompressionClientToServer,
            if self.role.is_server() {
                CipherMode::Decrypt
            } else {
                CipherMode::Encrypt
            },
            &keys.enc_c2s,
            &keys.iv_c2s,
            &keys.mac_c2s,
            &k,
            &h,
        )?;
        let s2c = self.build_direction(
            digest.as_mut(),
            negotiated,
            ProposalSlot::CipherServerToClient,
            ProposalSlot::MacServerToClient,
            ProposalSlot::CompressionServerToClient,
            if self.role.is_server() {
                CipherMode::Encrypt
            } else {
                CipherMode::Decrypt
            },
            &keys.enc_s2c,
            &keys.iv_s2c,
            &keys.mac_s2c,
            &k,
            &h,
        )?;

        let (outbound, inbound) = match self.role {
            Role::Server => (s2c, c2s),
            Role::Client => (c2s, s2c),
        };
        decoder.install(inbound.0, inbound.1, inbound.2);
        {
            let mut encoder = self.encoder.lock().expect("encoder poisoned");
            encoder.install(outbound.0, outbound.1, outbound.2);
        }

        self.in_counters.reset();
        self.out_counters.reset();
        self.last_key_time.store(self.now_ms(), Ordering::Release);
        debug!(
            cipher_c2s = negotiated.get(ProposalSlot::CipherClientToServer),
            cipher_s2c = negotiated.get(ProposalSlot::CipherServerToClient),
            "New keys installed"
        );
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn build_direction(
        &self,
        digest: &mut dyn Digest,
        negotiated: &Proposal,
        cipher_slot: ProposalSlot,
        mac_slot: ProposalSlot,
        compression_slot: ProposalSlot,
        mode: CipherMode,
        enc_key: &[u8],
        iv: &[u8],
        mac_key: &[u8],
        k: &[u8],
        h: &[u8],
    ) -> SkiffResult<(Box<dyn Cipher>, Box<dyn Mac>, Option<Box<dyn Compression>>)> {
        let mut cipher = self.manager.create_cipher(negotiated.get(cipher_slot))?;
        let key = resize_key(digest, enc_key.to_vec(), cipher.key_size(), k, h);
        let iv = resize_key(digest, iv.to_vec(), cipher.iv_size(), k, h);
        cipher.init(mode, &key[..cipher.key_size()], &iv[..cipher.iv_size()])?;

        let mut mac = self.manager.create_mac(negotiated.get(mac_slot))?;
        let mac_key = resize_key(digest, mac_key.to_vec(), mac.size(), k, h);
        mac.init(&mac_key)?;

        let compression = self
            .manager
            .create_compression(negotiated.get(compression_slot))?;
        Ok((cipher, mac, compression))
    }

    /// Starts a key re-exchange if none is running and returns the
    /// one-shot future for its completion.
    pub fn re_exchange_keys(&self) -> SkiffResult<Arc<KexFuture>> {
        let mut core = self.core.lock().expect("core poisoned");
        self.re_exchange_keys_locked(&mut core)
    }

    fn re_exchange_keys_locked(
        &self,
        core: &mut SessionCore,
    ) -> SkiffResult<Arc<KexFuture>> {
        if self.cas_kex_state(KexState::Done, KexState::Init) {
            info!("Initiating key re-exchange");
            let future = KexFuture::new();
            let previous = self
                .kex_future
                .lock()
                .expect("kex future poisoned")
                .replace(Arc::clone(&future));
            if let Some(previous) = previous {
                previous.fail(SkiffError::KeyExchange(
                    "New KEX started while previous one still ongoing".to_string(),
                ));
            }
            self.send_kex_init(core)?;
        }
        self.kex_future
            .lock()
            .expect("kex future poisoned")
            .clone()
            .ok_or_else(|| SkiffError::Protocol("No current KEX future".to_string()))
    }

    fn rekey_due(&self) -> bool {
        self.in_counters.bytes() > self.rekey_bytes_limit
            || self.out_counters.bytes() > self.rekey_bytes_limit
            || self
                .now_ms()
                .saturating_sub(self.last_key_time.load(Ordering::Acquire))
                > self.rekey_time_limit_ms
    }

    /// Checks the rekey triggers and initiates a re-exchange when due.
    ///
    /// Runs after every packet write and at idle ticks. The core lock is
    /// only tried: a check racing with dispatch defers to the next tick.
    fn check_rekey(&self) -> SkiffResult<()> {
        if self.is_closing() || self.kex_state() != KexState::Done || !self.rekey_due() {
            return Ok(());
        }
        if let Ok(mut core) = self.core.try_lock() {
            self.re_exchange_keys_locked(&mut core)?;
        }
        Ok(())
    }

    // --- egress ---

    /// Encodes and sends a packet, or queues it while a key exchange is
    /// in progress and the opcode is not a transport message.
    ///
    /// The returned future completes when the bytes have been handed to
    /// the underlying I/O session (or the queued write was flushed).
    pub fn write_packet(&self, buffer: Buffer) -> SkiffResult<Arc<WriteFuture>> {
        if self.is_closing() {
            return Err(SkiffError::Closed("Session is closing".to_string()));
        }
        if self.kex_state() != KexState::Done {
            let cmd = buffer.peek_u8()?;
            if cmd > SSH_MSG_KEX_LAST {
                let mut pending = self.pending.lock().expect("pending poisoned");
                // Re-check under the queue lock: NEWKEYS may have landed.
                if self.kex_state() != KexState::Done {
                    if pending.is_empty() {
                        debug!("Start flagging packets as pending until key exchange is done");
                    }
                    let future = WriteFuture::new();
                    pending.push_back(PendingPacket {
                        buffer,
                        future: Arc::clone(&future),
                    });
                    return Ok(future);
                }
            }
        }
        let result = self.do_write_packet(buffer);
        self.reset_idle_timeout();
        self.check_rekey()?;
        result
    }

    fn do_write_packet(&self, mut buffer: Buffer) -> SkiffResult<Arc<WriteFuture>> {
        let mut encoder = self.encoder.lock().expect("encoder poisoned");
        encoder.encode(
            &mut buffer,
            self.authed.load(Ordering::Acquire),
            &self.out_counters,
        )?;
        // The handoff happens under the encode lock so wire order matches
        // encode order.
        Ok(self.io.write(buffer))
    }

    /// Like [`Session::write_packet`] but fails the future after `timeout`
    /// if the write has not completed by then.
    pub fn write_packet_timeout(
        &self,
        buffer: Buffer,
        timeout: Duration,
    ) -> SkiffResult<Arc<WriteFuture>> {
        let future = self.write_packet(buffer)?;
        schedule_write_timeout(&future, timeout);
        Ok(future)
    }

    /// Sends a global request and parks until the reply arrives.
    ///
    /// Only one sender at a time; the response slot holds a single value.
    /// The current service routes `SSH_MSG_REQUEST_SUCCESS` /
    /// `SSH_MSG_REQUEST_FAILURE` back via [`Session::request_success`] and
    /// [`Session::request_failure`].
    ///
    /// Returns the response buffer, or `None` on a failure reply.
    pub fn request(
        &self,
        buffer: Buffer,
        timeout: Duration,
    ) -> SkiffResult<Option<Buffer>> {
        let _sender = self.request_lock.lock().expect("request lock poisoned");
        let mut slot = self.request_slot.lock().expect("request slot poisoned");
        *slot = None;
        self.write_packet(buffer)?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = slot.take() {
                return Ok(result);
            }
            if self.is_closing() {
                return Err(SkiffError::Closed(
                    "Session closed while waiting for request reply".to_string(),
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(SkiffError::Timeout(
                    "Timeout waiting for global request reply".to_string(),
                ));
            }
            let (guard, _) = self
                .request_cond
                .wait_timeout(slot, deadline - now)
                .expect("request slot poisoned");
            slot = guard;
        }
    }

    /// Delivers a global-request success reply, waking the parked sender.
    pub fn request_success(&self, buffer: &mut Buffer) {
        let data = Buffer::from_vec(buffer.readable().to_vec());
        let mut slot = self.request_slot.lock().expect("request slot poisoned");
        *slot = Some(Some(data));
        self.reset_idle_timeout();
        self.request_cond.notify_one();
    }

    /// Delivers a global-request failure reply, waking the parked sender.
    pub fn request_failure(&self) {
        let mut slot = self.request_slot.lock().expect("request slot poisoned");
        *slot = Some(None);
        self.reset_idle_timeout();
        self.request_cond.notify_one();
    }

    /// Sends `SSH_MSG_UNIMPLEMENTED` carrying the given ingress sequence
    /// number (defaults to the last received packet's).
    pub fn send_unimplemented(&self, seq: Option<u32>) -> SkiffResult<Arc<WriteFuture>> {
        let seq = seq.unwrap_or_else(|| self.last_ingress_seq.load(Ordering::Relaxed));
        let mut buffer = Buffer::packet(MessageType::Unimplemented as u8);
        buffer.put_u32(seq);
        self.write_packet(buffer)
    }

    /// Sends `SSH_MSG_IGNORE` with random filler (keep-alive traffic).
    pub fn send_ignore(&self, payload_len: usize) -> SkiffResult<Arc<WriteFuture>> {
        let mut filler = vec![0u8; payload_len];
        self.random
            .lock()
            .expect("random poisoned")
            .fill(&mut filler);
        let mut buffer = Buffer::packet(MessageType::Ignore as u8);
        buffer.put_bytes(&filler);
        self.write_packet(buffer)
    }

    /// Sends `SSH_MSG_DEBUG`.
    pub fn send_debug(&self, display: bool, msg: &str) -> SkiffResult<Arc<WriteFuture>> {
        let mut buffer = Buffer::packet(MessageType::Debug as u8);
        buffer.put_bool(display);
        buffer.put_string(msg);
        buffer.put_string("");
        self.write_packet(buffer)
    }

    // --- lifecycle ---

    /// Sends `SSH_MSG_DISCONNECT` and closes the session when the write
    /// completes or the disconnect grace expires, whichever is first.
    pub fn disconnect(&self, reason: u32, msg: &str) -> SkiffResult<Arc<WriteFuture>> {
        info!(reason, msg, "Disconnecting");
        let mut buffer = Buffer::packet(MessageType::Disconnect as u8);
        buffer.put_u32(reason);
        buffer.put_string(msg);
        buffer.put_string(""); // language tag
        let future =
            self.write_packet_timeout(buffer, Duration::from_millis(self.disconnect_timeout_ms))?;
        let me = self.me.clone();
        future.add_listener(move |_| {
            if let Some(session) = me.upgrade() {
                session.close(true);
            }
        });
        Ok(future)
    }

    /// Tears the session down: fails the in-flight KEX future and every
    /// queued write, notifies and clears the listeners, and closes the
    /// underlying I/O session. Idempotent.
    pub fn close(&self, _immediately: bool) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing session");

        if let Some(future) = self.kex_future.lock().expect("kex future poisoned").take() {
            future.fail(SkiffError::Closed(
                "Session closing while KEX in progress".to_string(),
            ));
        }
        if let Ok(mut core) = self.core.try_lock() {
            if let Some((name, future)) = core.pending_service.take() {
                future.fail(SkiffError::Closed(format!(
                    "Session closed before service {} started",
                    name
                )));
            }
        }
        {
            let mut pending = self.pending.lock().expect("pending poisoned");
            while let Some(packet) = pending.pop_front() {
                packet
                    .future
                    .fail(SkiffError::Closed("Session closed".to_string()));
            }
        }
        // Wake a parked global-request sender; it observes the closed
        // session via its timeout path otherwise.
        self.request_cond.notify_all();

        self.session_listeners.dispatch(|l| l.session_closed());
        self.session_listeners.close();
        self.channel_listeners.close();
        self.io.close();
    }

    // --- timeouts ---

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Pushes the idle deadline out to `now + idle-timeout`.
    pub fn reset_idle_timeout(&self) {
        self.idle_deadline
            .store(self.now_ms() + self.idle_timeout_ms, Ordering::Relaxed);
    }

    /// Checks the auth and idle deadlines, disconnecting on expiry.
    pub fn check_timeouts(&self) -> SkiffResult<()> {
        if self.is_closing() {
            return Ok(());
        }
        let now = self.now_ms();
        if !self.is_authenticated()
            && self.auth_timeout_ms > 0
            && now > self.auth_deadline.load(Ordering::Relaxed)
        {
            self.timeout_status
                .store(TimeoutStatus::AuthTimeout as u8, Ordering::Release);
            self.disconnect(
                disconnect::PROTOCOL_ERROR,
                &format!(
                    "Session has timed out waiting for authentication after {} ms.",
                    self.auth_timeout_ms
                ),
            )?;
            return Ok(());
        }
        if self.idle_timeout_ms > 0 && now > self.idle_deadline.load(Ordering::Relaxed) {
            self.timeout_status
                .store(TimeoutStatus::IdleTimeout as u8, Ordering::Release);
            self.disconnect(
                disconnect::PROTOCOL_ERROR,
                &format!(
                    "User session has timed out idling after {} ms.",
                    self.idle_timeout_ms
                ),
            )?;
        }
        Ok(())
    }

    /// Periodic maintenance: timeout checks plus the rekey triggers.
    pub fn tick(&self) -> SkiffResult<()> {
        self.check_timeouts()?;
        self.check_rekey()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.role)
            .field("kex_state", &self.kex_state())
            .field("authed", &self.is_authenticated())
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// Fails the write future after `timeout` unless it completed first.
///
/// Uses the ambient tokio runtime when one is present; the in-memory
/// transports complete writes inline, so tests without a runtime never
/// need the timer.
fn schedule_write_timeout(future: &Arc<WriteFuture>, timeout: Duration) {
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let future = Arc::clone(future);
        handle.spawn(async move {
            tokio::time::sleep(timeout).await;
            if future.fail(SkiffError::Timeout(format!(
                "Timeout writing packet: {:?}",
                timeout
            ))) {
                info!(?timeout, "Timed out writing packet");
            }
        });
    }
}

/// Rebuilds an error with the same taxonomy and message, for completing
/// shared futures from a borrowed error.
fn clone_error(err: &SkiffError) -> SkiffError {
    match err {
        SkiffError::Io(e) => SkiffError::Io(std::io::Error::new(e.kind(), e.to_string())),
        SkiffError::Config(m) => SkiffError::Config(m.clone()),
        SkiffError::Protocol(m) => SkiffError::Protocol(m.clone()),
        SkiffError::Mac(m) => SkiffError::Mac(m.clone()),
        SkiffError::KeyExchange(m) => SkiffError::KeyExchange(m.clone()),
        SkiffError::HostKeyUnverifiable(m) => SkiffError::HostKeyUnverifiable(m.clone()),
        SkiffError::ServiceNotAvailable(m) => SkiffError::ServiceNotAvailable(m.clone()),
        SkiffError::Timeout(m) => SkiffError::Timeout(m.clone()),
        SkiffError::Closed(m) => SkiffError::Closed(m.clone()),
        SkiffError::Other(e) => SkiffError::Other(Box::from(e.to_string())),
    }
}
