use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Generates process-unique string identifiers of the form `prefix:seed:n`.
///
/// The seed is random per generator, `n` starts at 1 and only grows.
pub struct IdGenerator {
    seed: String,
    sequence: AtomicU64,
}

impl IdGenerator {
    #[inline]
    pub fn new() -> Self {
        Self::with_prefix("ID")
    }

    pub fn with_prefix(prefix: &str) -> Self {
        let seed = format!("{}:{}", prefix, uuid::Uuid::new_v4().simple());
        Self { seed, sequence: AtomicU64::new(0) }
    }

    #[inline]
    pub fn seed(&self) -> &str {
        &self.seed
    }

    #[inline]
    pub fn generate_id(&self) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}:{}", self.seed, n)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for IdGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdGenerator {{ seed: {}, last: {} }}", self.seed, self.sequence.load(Ordering::SeqCst))
    }
}

/// Monotonic `i64` sequence, first value is 1.
#[derive(Debug, Default)]
pub struct SequenceGenerator(AtomicI64);

impl SequenceGenerator {
    #[inline]
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    #[inline]
    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    #[inline]
    pub fn last(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}
