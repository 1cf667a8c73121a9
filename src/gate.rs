use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

/// Single-flight admission for one connection.
///
/// `try_admit` never waits: it either hands out the only permit or returns `None`
/// and the caller drops the frame.
#[derive(Debug, Clone, Default)]
pub struct AdmissionGate {
    in_flight: Arc<AtomicBool>,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| AdmissionPermit {
                in_flight: Arc::clone(&self.in_flight),
            })
    }

    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Held for as long as a frame is in the pipeline. Dropping it, including during
/// unwinding, reopens the gate.
#[derive(Debug)]
pub struct AdmissionPermit {
    in_flight: Arc<AtomicBool>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_flight() {
        let gate = AdmissionGate::new();

        let permit = gate.try_admit();
        assert!(permit.is_some());
        assert!(gate.is_busy());
        assert!(gate.try_admit().is_none());

        drop(permit);
        assert!(!gate.is_busy());
        assert!(gate.try_admit().is_some());
    }

    #[test]
    fn test_clones_share_the_flag() {
        let gate = AdmissionGate::new();
        let other = gate.clone();

        let _permit = gate.try_admit().unwrap();
        assert!(other.try_admit().is_none());
    }

    #[test]
    fn test_panic_releases_permit() {
        let gate = AdmissionGate::new();
        let permit = gate.try_admit().unwrap();

        let result = std::thread::spawn(move || {
            let _permit = permit;
            panic!("inference blew up");
        })
        .join();

        assert!(result.is_err());
        assert!(!gate.is_busy());
    }

    #[test]
    fn test_concurrent_admission_grants_one_permit() {
        let gate = AdmissionGate::new();
        let barrier = Arc::new(std::sync::Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let gate = gate.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    // keep the permit alive until every thread has tried
                    let permit = gate.try_admit();
                    barrier.wait();
                    permit.is_some()
                })
            })
            .collect();

        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&admitted| admitted)
            .count();
        assert_eq!(admitted, 1);
    }
}
