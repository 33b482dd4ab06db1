//! Session tokens and leases.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// An exclusive hold on one instrument.
#[derive(Debug)]
pub struct Lease {
    pub token: SessionToken,
    /// Client-supplied identity, for logs and status reports.
    pub holder: String,
    /// Acquire request that was granted this lease. A cancel for this
    /// waiter after the grant revokes the lease, so a client whose wait
    /// timed out in the same instant it was granted cannot strand the
    /// instrument.
    pub waiter: Uuid,
    pub granted_at: Instant,
    /// The lease is revoked when this passes without activity.
    pub deadline: Instant,
}

impl Lease {
    pub fn grant(holder: String, waiter: Uuid, lifetime: Duration) -> Self {
        let now = Instant::now();
        Self {
            token: SessionToken::new(),
            holder,
            waiter,
            granted_at: now,
            deadline: now + lifetime,
        }
    }

    /// Push the revocation deadline out; called on every command.
    pub fn touch(&mut self, lifetime: Duration) {
        self.deadline = Instant::now() + lifetime;
    }
}

/// Opaque capability proving ownership of an exclusive session.
///
/// Tokens are unguessable; holding one is the only way to execute commands
/// or release the session it names.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionToken(Uuid);

impl SessionToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
