//! Priority-ordered handler registries.
//!
//! A [`Registry`] is an explicit table of handlers that compete for the same kind of input.
//! It is built once at startup, e.g. by [`processors::default_registry()`](crate::processors::default_registry())
//! or [`standardizers::default_registry()`](crate::standardizers::default_registry()),
//! and only read afterwards.

use std::fmt;
use std::marker::PhantomData;

use itertools::Itertools;
use log::{debug, warn};

use crate::error::RegistryError;

/// A handler competing for inputs of type `I`.
pub trait Handler<I: ?Sized>: Send + Sync {
    /// Unique name of the handler.
    fn name(&self) -> &'static str;

    /// Priority among handlers claiming the same input. Higher wins.
    fn priority(&self) -> i32;

    /// Whether the handler can deal with `input`. Must not have side effects.
    fn can_handle(&self, input: &I) -> bool;
}

/// Explicit registration table of handlers for inputs of type `I`.
///
/// `H` is usually a trait object such as `dyn UploadProcessor`.
pub struct Registry<I: ?Sized, H: ?Sized> {
    handlers: Vec<Box<H>>,
    _input: PhantomData<fn(&I)>,
}

impl<I: ?Sized, H: ?Sized + Handler<I>> Default for Registry<I, H> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
            _input: PhantomData,
        }
    }
}

impl<I: ?Sized, H: ?Sized + Handler<I>> fmt::Debug for Registry<I, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.handlers.iter().map(|h| (h.name(), h.priority())))
            .finish()
    }
}

impl<I: ?Sized, H: ?Sized + Handler<I>> Registry<I, H> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a handler.
    ///
    /// Fails if a handler with the same name is already registered.
    pub fn register(&mut self, handler: Box<H>) -> Result<(), RegistryError> {
        if self.get(handler.name()).is_some() {
            return Err(RegistryError::DuplicateHandler(handler.name().to_string()));
        }
        debug!(
            "Registered handler {} with priority {}.",
            handler.name(),
            handler.priority()
        );
        self.handlers.push(handler);
        Ok(())
    }

    /// Builder variant of [`register`](Registry::register()).
    pub fn with(mut self, handler: Box<H>) -> Result<Self, RegistryError> {
        self.register(handler)?;
        Ok(self)
    }

    /// Handler registered under `name`.
    pub fn get(&self, name: &str) -> Option<&H> {
        self.handlers
            .iter()
            .find(|h| h.name() == name)
            .map(|h| h.as_ref())
    }

    /// Names of all handlers in registration order.
    pub fn names(&self) -> Vec<&'static str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Number of registered handlers.
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no handler is registered.
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// All handlers claiming `input`, highest priority first.
    ///
    /// Handlers of equal priority keep their registration order.
    pub fn resolve_all(&self, input: &I) -> Vec<&H> {
        self.handlers
            .iter()
            .filter(|h| h.can_handle(input))
            .map(|h| h.as_ref())
            .sorted_by_key(|h| std::cmp::Reverse(h.priority()))
            .collect()
    }

    /// The highest-priority handler claiming `input`.
    ///
    /// Ties are broken in favor of the handler registered first.
    pub fn resolve(&self, input: &I) -> Result<&H, RegistryError> {
        let candidates = self.resolve_all(input);
        let Some(best) = candidates.first() else {
            return Err(RegistryError::NoHandlerFound {
                known: self.names().into_iter().map(String::from).collect(),
            });
        };

        let tied = candidates
            .iter()
            .filter(|h| h.priority() == best.priority())
            .map(|h| h.name())
            .collect_vec();
        if tied.len() > 1 {
            warn!(
                "Handlers {} tie at priority {}, using {}.",
                tied.join(", "),
                best.priority(),
                best.name()
            );
        }
        debug!("Resolved handler {}.", best.name());
        Ok(*best)
    }
}
