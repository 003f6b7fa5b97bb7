//! Upstream service hook.
//!
//! After the transport reaches `KexState::Done`, a peer requests a service
//! by name (`ssh-userauth`, `ssh-connection`) and every non-transport
//! packet is handed to the current [`Service`]. The services themselves
//! (authentication, channels) live outside this crate; the transport only
//! starts them by name and routes packets.

use crate::ssh::buffer::Buffer;
use crate::ssh::session::Session;
use skiff_platform::SkiffResult;
use std::sync::Arc;

/// An upper-layer protocol bound to one session.
pub trait Service: Send {
    /// Processes one decoded packet.
    ///
    /// `cmd` is the opcode byte; the buffer's read position is just past
    /// it. Errors propagate to the session, fail any in-flight key
    /// exchange future, and close the session.
    fn process(&mut self, session: &Arc<Session>, cmd: u8, buffer: &mut Buffer)
        -> SkiffResult<()>;
}

/// Named factory for a service.
pub trait ServiceFactory: Send + Sync {
    /// The service name as requested on the wire.
    fn name(&self) -> &str;

    /// Instantiates the service for a session.
    fn create(&self, session: &Arc<Session>) -> SkiffResult<Box<dyn Service>>;
}
