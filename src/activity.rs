//! Tally of outstanding block requests per remote device.
//!
//! One instance is shared by every folder's puller so that block
//! requests spread across the cluster instead of piling onto whichever
//! device happens to be listed first.

use crate::protocol::DeviceId;
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Default)]
pub struct DeviceActivity {
    acts: Mutex<HashMap<DeviceId, usize>>,
}

impl DeviceActivity {
    pub fn new() -> Self {
        Self::default()
    }

    /// The candidate with the fewest requests in flight, or `None` when
    /// there are no candidates. The first minimum encountered wins.
    pub fn least_busy(&self, candidates: &[DeviceId]) -> Option<DeviceId> {
        let acts = self.acts.lock();
        let mut low = usize::MAX;
        let mut selected = None;
        for device in candidates {
            let usage = acts.get(device).copied().unwrap_or(0);
            if usage < low {
                low = usage;
                selected = Some(*device);
            }
        }
        selected
    }

    /// Mark a request to `device` as started.
    pub fn using(&self, device: DeviceId) {
        *self.acts.lock().entry(device).or_insert(0) += 1;
    }

    /// Mark a request to `device` as finished, success or not.
    pub fn done(&self, device: DeviceId) {
        let mut acts = self.acts.lock();
        if let Some(n) = acts.get_mut(&device) {
            *n = n.saturating_sub(1);
        }
    }
}
