use tokio::sync::watch;

/// The gate decides who consumes a connection's inbound queue: normally the request
///  dispatcher, but an application can take it over temporarily (typically to wait for the
///  responses of a client transaction) by locking it.
///
/// Waiters are woken on every transition, so the dispatcher never polls.
pub struct ReadGate {
    locked: watch::Sender<bool>,
}

impl Default for ReadGate {
    fn default() -> Self {
        ReadGate::new()
    }
}

impl ReadGate {
    pub fn new() -> ReadGate {
        let (locked, _) = watch::channel(false);
        ReadGate { locked }
    }

    pub fn lock(&self) {
        self.locked.send_replace(true);
    }

    pub fn unlock(&self) {
        self.locked.send_replace(false);
    }

    pub fn is_locked(&self) -> bool {
        *self.locked.borrow()
    }

    /// Returns once the gate is unlocked, immediately if it is not locked now
    pub async fn unlocked(&self) {
        let mut rx = self.locked.subscribe();
        let _ = rx.wait_for(|locked| !*locked).await;
    }

    /// Returns once the gate is locked, immediately if it is locked now
    pub async fn locked(&self) {
        let mut rx = self.locked.subscribe();
        let _ = rx.wait_for(|locked| *locked).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_lock_unlock() {
        let gate = ReadGate::new();
        assert!(!gate.is_locked());

        gate.lock();
        assert!(gate.is_locked());
        gate.lock();
        assert!(gate.is_locked());

        gate.unlock();
        assert!(!gate.is_locked());
    }

    #[tokio::test]
    async fn test_unlocked_returns_immediately_when_open() {
        let gate = ReadGate::new();
        timeout(Duration::from_millis(100), gate.unlocked()).await
            .expect("gate is open");
    }

    #[tokio::test]
    async fn test_unlock_wakes_waiter() {
        let gate = Arc::new(ReadGate::new());
        gate.lock();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.unlocked().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.unlock();
        timeout(Duration::from_secs(1), waiter).await
            .expect("waiter was not woken")
            .unwrap();
    }

    #[tokio::test]
    async fn test_lock_wakes_waiter() {
        let gate = Arc::new(ReadGate::new());

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.locked().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        gate.lock();
        timeout(Duration::from_secs(1), waiter).await
            .expect("waiter was not woken")
            .unwrap();
    }
}
