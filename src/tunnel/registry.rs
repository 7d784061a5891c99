//! Active tunnels keyed by scope and flow
//!
//! At most one live handler exists per `(scope, HandlerKey)`. Handlers
//! remove themselves on close; stopping a scope closes whatever is left.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::address::HandlerKey;
use super::handler::TunnelHandler;
use crate::config::ScopeKind;
use crate::error::TunnelError;

#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<(ScopeKind, HandlerKey), Arc<TunnelHandler>>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` unless its key is already taken in its scope
    ///
    /// # Errors
    /// `TunnelError::Duplicate` if a live handler owns the key.
    pub fn try_insert(&self, handler: Arc<TunnelHandler>) -> Result<(), TunnelError> {
        let slot = (handler.scope(), *handler.key());
        let mut handlers = self.handlers.write();
        if handlers.contains_key(&slot) {
            return Err(TunnelError::Duplicate(format!("{} {}", slot.0, slot.1)));
        }
        handlers.insert(slot, handler);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, scope: ScopeKind, key: &HandlerKey) -> bool {
        self.handlers.read().contains_key(&(scope, *key))
    }

    #[must_use]
    pub fn get(&self, scope: ScopeKind, key: &HandlerKey) -> Option<Arc<TunnelHandler>> {
        self.handlers.read().get(&(scope, *key)).cloned()
    }

    /// Drop the entry for `handler`, but only if it is this exact handler;
    /// a newer handler for the same key is left alone.
    pub fn remove(&self, handler: &TunnelHandler) -> bool {
        let slot = (handler.scope(), *handler.key());
        let mut handlers = self.handlers.write();
        match handlers.get(&slot) {
            Some(current) if std::ptr::eq(Arc::as_ptr(current), handler) => {
                handlers.remove(&slot);
                true
            }
            _ => false,
        }
    }

    /// Close every handler of `scope`; returns how many were closed
    pub fn clear_scope(&self, scope: ScopeKind) -> usize {
        // close() re-enters remove(), so never hold the lock across it
        let victims: Vec<Arc<TunnelHandler>> = self
            .handlers
            .read()
            .iter()
            .filter(|((s, _), _)| *s == scope)
            .map(|(_, h)| Arc::clone(h))
            .collect();

        let closed = victims.iter().filter(|h| h.close()).count();
        debug!("Cleared {} {} handlers", closed, scope);
        closed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.read().len()
    }

    #[must_use]
    pub fn len_scope(&self, scope: ScopeKind) -> usize {
        self.handlers
            .read()
            .keys()
            .filter(|(s, _)| *s == scope)
            .count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.read().is_empty()
    }
}
