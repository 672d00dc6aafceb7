use std::sync::atomic::{AtomicUsize, Ordering};

/// Invoked by the session client when the session cannot be renewed.
///
/// Credentials are already cleared by the time this runs. Implementations
/// send the user back to the unauthenticated entry point.
pub trait LogoutTrigger: Send + Sync {
    fn force_logout(&self);
}

impl<F> LogoutTrigger for F
where
    F: Fn() + Send + Sync,
{
    fn force_logout(&self) {
        self()
    }
}

/// Counts forced logouts.
#[derive(Debug, Default)]
pub struct CountingLogout {
    count: AtomicUsize,
}

impl CountingLogout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl LogoutTrigger for CountingLogout {
    fn force_logout(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}
