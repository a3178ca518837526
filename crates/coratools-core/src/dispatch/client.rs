//! Client identity
//!
//! Components never own their clients. A [`ClientRef`] pairs a weak reference
//! with the [`ClientToken`] of the start/finish cycle it was bound in, so one
//! check at delivery time answers both "is the client alive" and "is it still
//! this component's current client".

use std::cell::Cell;
use std::rc::{Rc, Weak};

use serde::{Deserialize, Serialize};

use crate::errors::{CoraError, Result};

/// Generation of one start/finish cycle of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientToken(u64);

impl ClientToken {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Hands out a fresh token for each cycle
#[derive(Debug, Default)]
pub struct TokenSource {
    next: Cell<u64>,
}

impl TokenSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_token(&self) -> ClientToken {
        let value = self.next.get().wrapping_add(1);
        self.next.set(value);
        ClientToken(value)
    }
}

/// Weak, generation-checked reference to an application client
pub struct ClientRef<C: ?Sized> {
    client: Weak<C>,
    token: ClientToken,
}

impl<C: ?Sized> ClientRef<C> {
    /// Bind a client for one cycle; a client that is already gone is rejected
    pub fn bind(client: Weak<C>, token: ClientToken) -> Result<Self> {
        if client.strong_count() == 0 {
            return Err(CoraError::invalid_argument("client reference is not alive"));
        }
        Ok(Self { client, token })
    }

    pub fn token(&self) -> ClientToken {
        self.token
    }

    pub fn upgrade(&self) -> Option<Rc<C>> {
        self.client.upgrade()
    }

    pub fn is_alive(&self) -> bool {
        self.client.strong_count() > 0
    }

    /// Resolve a queued notification against the current binding
    pub fn resolve(current: Option<&Self>, token: ClientToken) -> Delivery<C> {
        match current {
            Some(client) if client.token == token => match client.upgrade() {
                Some(client) => Delivery::Deliver(client),
                None => Delivery::ClientGone,
            },
            _ => Delivery::Stale,
        }
    }
}

impl<C: ?Sized> Clone for ClientRef<C> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            token: self.token,
        }
    }
}

impl<C: ?Sized> core::fmt::Debug for ClientRef<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ClientRef")
            .field("token", &self.token)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Result of checking a notification at delivery time
pub enum Delivery<C: ?Sized> {
    /// Token current and client alive
    Deliver(Rc<C>),
    /// Token current but the client has been dropped
    ClientGone,
    /// The component has finished or restarted since the post
    Stale,
}
