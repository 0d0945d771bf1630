//! Disjoint nonce enumeration across the (node, device) grid.

/// Infinite, strictly increasing nonce sequence for one `(node, device)` pair.
///
/// With stride `n_nodes * n_devices` and offset `node_id * n_devices +
/// device_id`, the sequences of all pairs partition the natural numbers:
/// their union is complete and pairwise intersections are empty. The
/// iterator has no internal randomness and can be rebuilt at any time to
/// replay the same sequence.
#[derive(Debug, Clone)]
pub struct NonceIterator {
    next: u64,
    stride: u64,
}

impl NonceIterator {
    pub fn new(node_id: u32, n_nodes: u32, device_id: u32, n_devices: u32) -> Self {
        debug_assert!(n_nodes >= 1 && n_devices >= 1);
        debug_assert!(node_id < n_nodes && device_id < n_devices);
        Self {
            next: u64::from(node_id) * u64::from(n_devices) + u64::from(device_id),
            stride: u64::from(n_nodes) * u64::from(n_devices),
        }
    }

    /// Takes the next `n` nonces as a batch.
    pub fn take_batch(&mut self, n: usize) -> Vec<u64> {
        (0..n).map_while(|_| self.next()).collect()
    }
}

impl Iterator for NonceIterator {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        let nonce = self.next;
        self.next = self.next.wrapping_add(self.stride);
        Some(nonce)
    }
}
