//! Extension hooks
//!
//! Extensions (Simple Registration, Attribute Exchange, PAPE and the like) add
//! their own fields to the outgoing request and read them back from a verified
//! response. The engine knows nothing about their payloads; it only calls the
//! hooks at fixed points: `on_request` once after the core fields are set, and
//! `on_response` once after verification succeeds.

use std::fmt;

use crate::error::ExtensionError;
use crate::message::ParameterSet;

/// Hook pair invoked around one authentication attempt.
pub trait Extension: Send {
    /// Add fields to an outgoing `checkid_*` request.
    ///
    /// # Errors
    ///
    /// Any error aborts request building and is returned to the caller as-is.
    fn on_request(&mut self, params: &mut ParameterSet) -> Result<(), ExtensionError>;

    /// Read fields from a verified response.
    ///
    /// # Errors
    ///
    /// Any error is returned to the caller as-is; the response itself was
    /// already verified.
    fn on_response(&mut self, params: &ParameterSet) -> Result<(), ExtensionError>;
}

/// Ordered composition of extensions. Hooks run in insertion order and stop at
/// the first failure.
#[derive(Default)]
pub struct ExtensionChain {
    extensions: Vec<Box<dyn Extension>>,
}

impl ExtensionChain {
    /// Create an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an extension.
    #[must_use]
    pub fn with(mut self, extension: impl Extension + 'static) -> Self {
        self.push(extension);
        self
    }

    /// Append an extension in place.
    pub fn push(&mut self, extension: impl Extension + 'static) {
        self.extensions.push(Box::new(extension));
    }

    /// Number of extensions in the chain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.extensions.len()
    }

    /// Whether the chain is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.extensions.is_empty()
    }
}

impl Extension for ExtensionChain {
    fn on_request(&mut self, params: &mut ParameterSet) -> Result<(), ExtensionError> {
        self.extensions
            .iter_mut()
            .try_for_each(|extension| extension.on_request(params))
    }

    fn on_response(&mut self, params: &ParameterSet) -> Result<(), ExtensionError> {
        self.extensions
            .iter_mut()
            .try_for_each(|extension| extension.on_response(params))
    }
}

impl fmt::Debug for ExtensionChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtensionChain")
            .field("len", &self.extensions.len())
            .finish()
    }
}
