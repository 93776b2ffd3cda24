//! Deferred resource release for transactions.
//!
//! Mounts and temporary directories acquired while preparing a snapshot are
//! recorded here and released in reverse acquisition order when the
//! transaction closes.  An entry's tag decides which outcomes invoke it.

use anyhow::Result;

/// Which transaction outcomes invoke a cleanup entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CleanupTag {
    /// Run on both commit and rollback (e.g. unmounting a work mount).
    Always,
    /// Run only when the transaction failed (e.g. removing half-written state).
    OnError,
    /// Run only when the transaction committed (e.g. discarding scratch data
    /// the failed path still wants for inspection).
    OnSuccess,
}

type CleanupFn = Box<dyn FnOnce() -> Result<()> + Send>;

/// LIFO stack of deferred release closures.
#[derive(Default)]
pub(crate) struct CleanupStack {
    entries: Vec<(CleanupTag, String, CleanupFn)>,
}

impl CleanupStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(
        &mut self,
        tag: CleanupTag,
        description: impl Into<String>,
        f: impl FnOnce() -> Result<()> + Send + 'static,
    ) {
        self.entries.push((tag, description.into(), Box::new(f)));
    }

    pub(crate) fn push_always(
        &mut self,
        description: impl Into<String>,
        f: impl FnOnce() -> Result<()> + Send + 'static,
    ) {
        self.push(CleanupTag::Always, description, f)
    }

    pub(crate) fn push_on_error(
        &mut self,
        description: impl Into<String>,
        f: impl FnOnce() -> Result<()> + Send + 'static,
    ) {
        self.push(CleanupTag::OnError, description, f)
    }

    #[allow(dead_code)]
    pub(crate) fn push_on_success(
        &mut self,
        description: impl Into<String>,
        f: impl FnOnce() -> Result<()> + Send + 'static,
    ) {
        self.push(CleanupTag::OnSuccess, description, f)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Invoke matching entries in reverse acquisition order, collecting the
    /// errors.  Entries whose tag does not match the outcome are dropped
    /// without being run.
    pub(crate) fn drain(&mut self, success: bool) -> Vec<anyhow::Error> {
        let mut errors = Vec::new();
        while let Some((tag, description, f)) = self.entries.pop() {
            let wanted = match tag {
                CleanupTag::Always => true,
                CleanupTag::OnError => !success,
                CleanupTag::OnSuccess => success,
            };
            if !wanted {
                continue;
            }
            tracing::debug!("cleanup: {description}");
            if let Err(e) = f() {
                tracing::warn!("cleanup {description} failed: {e:#}");
                errors.push(e.context(description));
            }
        }
        errors
    }
}

impl std::fmt::Debug for CleanupStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.entries.iter().map(|(t, d, _)| (t, d)).collect();
        f.debug_struct("CleanupStack").field("entries", &names).finish()
    }
}

/// Join a causal error with residual cleanup errors into a single chain.
/// The cause stays the root of the chain; cleanup failures are folded into
/// one context link so nothing is silently lost.
pub(crate) fn join_errors(cause: anyhow::Error, residual: Vec<anyhow::Error>) -> anyhow::Error {
    if residual.is_empty() {
        return cause;
    }
    let details = residual
        .iter()
        .map(|e| format!("{e:#}"))
        .collect::<Vec<_>>()
        .join("; ");
    cause.context(format!("cleanup also failed: {details}"))
}
