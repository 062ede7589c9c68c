//! Store configuration.

/// When deferred effects run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeferredFlush {
    /// Run deferred effects at the end of the outermost flush, after
    /// listeners have been notified.
    #[default]
    EndOfFlush,

    /// Queue deferred effects until the host calls
    /// [`Store::flush_deferred`](crate::Store::flush_deferred).
    Manual,
}

/// Configuration for a [`Store`](crate::Store).
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub(crate) deferred_flush: DeferredFlush,
    pub(crate) label: Option<String>,
}

impl StoreConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Choose when deferred effects run.
    pub fn deferred_flush(mut self, mode: DeferredFlush) -> Self {
        self.deferred_flush = mode;
        self
    }

    /// Attach a label used in log output.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// The label, or `"store"` when none was given.
    pub fn display_label(&self) -> &str {
        self.label.as_deref().unwrap_or("store")
    }
}
