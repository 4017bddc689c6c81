//! Cooperative cancellation.
//!
//! A transition checks its [`Cancellation`] only before its first state-changing
//! submission. After that it runs to completion.

use tokio::sync::watch;

/// Sender half; call [`CancelHandle::cancel`] to request cancellation.
#[derive(Debug, Clone)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.send_replace(true);
    }
}

/// Receiver half observed by running transitions.
#[derive(Debug, Clone)]
pub struct Cancellation(watch::Receiver<bool>);

impl Cancellation {
    pub fn new() -> (CancelHandle, Self) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle(tx), Self(rx))
    }

    /// A token that is never cancelled.
    pub fn never() -> Self {
        let (_, rx) = watch::channel(false);
        Self(rx)
    }

    pub fn is_cancelled(&self) -> bool {
        *self.0.borrow()
    }
}

impl Default for Cancellation {
    fn default() -> Self {
        Self::never()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_observed_by_clones() {
        let (handle, token) = Cancellation::new();
        let clone = token.clone();
        assert!(!token.is_cancelled());

        handle.cancel();
        assert!(token.is_cancelled());
        assert!(clone.is_cancelled());
        assert!(!Cancellation::never().is_cancelled());
    }
}
