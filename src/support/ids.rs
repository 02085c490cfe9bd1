use uuid::Uuid;

/// Injected id source for run identifiers (drift runs, reconciliation runs).
pub trait RunIdFactory: Send + Sync {
    fn next(&self) -> Uuid;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct UuidRunIdFactory;

impl RunIdFactory for UuidRunIdFactory {
    fn next(&self) -> Uuid {
        Uuid::new_v4()
    }
}

/// Fixed sequence of ids for deterministic tests.
pub struct FixedRunIdFactory(pub Uuid);

impl RunIdFactory for FixedRunIdFactory {
    fn next(&self) -> Uuid {
        self.0
    }
}
