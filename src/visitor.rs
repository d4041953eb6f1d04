//! Visitor API exposed upward by `accept`.

pub trait DataStoreVisitor: Send {
    fn visit(&mut self, lid: u32, bytes: &[u8]);
}

pub trait DataStoreVisitorProgress {
    /// `fraction` is always in `[0, 1]`.
    fn update_progress(&mut self, fraction: f64);
}

/// A visitor that just collects everything it sees, for tests and small
/// tools.
pub struct CollectingVisitor {
    pub records: Vec<(u32, Vec<u8>)>,
}

impl CollectingVisitor {
    pub fn new() -> Self {
        Self {
            records: Vec::new(),
        }
    }
}

impl Default for CollectingVisitor {
    fn default() -> Self {
        Self::new()
    }
}

impl DataStoreVisitor for CollectingVisitor {
    fn visit(&mut self, lid: u32, bytes: &[u8]) {
        self.records.push((lid, bytes.to_vec()));
    }
}
