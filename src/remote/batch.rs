use crate::serialization::Record;

/// Default item cap per upload request.
pub const DEFAULT_BATCH_ITEMS: usize = 1000;
/// Default byte cap per upload request (25 MiB).
pub const DEFAULT_BATCH_BYTES: usize = 25 * 1024 * 1024;

/// Groups records into upload batches capped by item count and byte size.
///
/// A record larger than the byte cap is never split; it travels in a batch
/// of its own.
#[derive(Debug)]
pub struct UploadBatcher {
    max_items: usize,
    max_bytes: usize,
    pending: Vec<Record>,
    pending_bytes: usize,
}

impl Default for UploadBatcher {
    fn default() -> Self {
        Self::new(DEFAULT_BATCH_ITEMS, DEFAULT_BATCH_BYTES)
    }
}

impl UploadBatcher {
    /// A batcher capped at `max_items` records and `max_bytes` bytes per batch.
    pub fn new(max_items: usize, max_bytes: usize) -> Self {
        Self {
            max_items: max_items.max(1),
            max_bytes: max_bytes.max(1),
            pending: Vec::new(),
            pending_bytes: 0,
        }
    }

    /// Queues a record. Returns the previous batch when this record does not
    /// fit next to it.
    pub fn push(&mut self, record: Record) -> Option<Vec<Record>> {
        let size = wire_size(&record);
        let full = !self.pending.is_empty()
            && (self.pending.len() >= self.max_items || self.pending_bytes + size > self.max_bytes);
        let ready = if full { self.take() } else { None };
        self.pending_bytes += size;
        self.pending.push(record);
        ready
    }

    /// Takes whatever is queued.
    pub fn flush(&mut self) -> Option<Vec<Record>> {
        self.take()
    }

    /// Records queued.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn take(&mut self) -> Option<Vec<Record>> {
        if self.pending.is_empty() {
            return None;
        }
        self.pending_bytes = 0;
        Some(std::mem::take(&mut self.pending))
    }
}

/// Bytes a record occupies in a line-delimited body.
fn wire_size(record: &Record) -> usize {
    record.id.as_str().len() + record.json.len() + 2
}
