//! Counting admission gate bounding simultaneous conversions.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

/// A fixed number of tokens in a bounded channel. Taking a token yields a
/// [`Permit`]; dropping the permit puts the token back.
///
/// Independent of the worker count: a pool with more workers than tokens
/// leaves the surplus blocked at the gate.
#[derive(Debug, Clone)]
pub struct AdmissionGate {
    tokens: Receiver<()>,
    returns: Sender<()>,
    capacity: usize,
}

impl AdmissionGate {
    /// A gate with `capacity` tokens. A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (returns, tokens) = bounded(capacity);
        for _ in 0..capacity {
            // Cannot fail: the channel has exactly `capacity` slots.
            let _ = returns.try_send(());
        }
        Self {
            tokens,
            returns,
            capacity,
        }
    }

    pub fn try_acquire(&self) -> Option<Permit> {
        self.tokens.try_recv().ok().map(|()| self.permit())
    }

    /// Waits up to `timeout` for a free token.
    pub fn acquire_timeout(&self, timeout: Duration) -> Option<Permit> {
        self.tokens.recv_timeout(timeout).ok().map(|()| self.permit())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.tokens.len())
    }

    fn permit(&self) -> Permit {
        Permit {
            returns: self.returns.clone(),
        }
    }
}

/// Proof of admission. Returns its token on drop.
#[derive(Debug)]
pub struct Permit {
    returns: Sender<()>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        let _ = self.returns.try_send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_limits_permits() {
        let gate = AdmissionGate::new(2);
        let a = gate.try_acquire().unwrap();
        let _b = gate.try_acquire().unwrap();
        assert!(gate.try_acquire().is_none());
        assert_eq!(gate.in_use(), 2);

        drop(a);
        assert_eq!(gate.in_use(), 1);
        assert!(gate.try_acquire().is_some());
    }

    #[test]
    fn test_acquire_timeout_waits_for_release() {
        let gate = AdmissionGate::new(1);
        let held = gate.try_acquire().unwrap();
        assert!(gate.acquire_timeout(Duration::from_millis(20)).is_none());

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            drop(held);
        });
        assert!(gate.acquire_timeout(Duration::from_secs(5)).is_some());
        releaser.join().unwrap();
    }

    #[test]
    fn test_zero_capacity_becomes_one() {
        let gate = AdmissionGate::new(0);
        assert_eq!(gate.capacity(), 1);
        assert!(gate.try_acquire().is_some());
    }
}
