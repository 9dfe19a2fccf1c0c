use parking_lot::{Condvar, Mutex};

/// One-shot event: once signaled, every current and future wait returns.
#[derive(Debug, Default)]
pub(crate) struct ThreadEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl ThreadEvent {
    pub(crate) fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
    }
}
