//! Layer switch dispatcher double.

use async_trait::async_trait;
use quality_controller::{LayerSwitch, LayerSwitchDispatcher, QualityError, QualityLayer};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

/// Dispatcher that fails its first `failures` attempts, then succeeds.
#[derive(Debug, Default)]
pub struct FlakyDispatcher {
    remaining_failures: AtomicU32,
    attempts: AtomicU32,
    delivered: Mutex<Vec<LayerSwitch>>,
}

impl FlakyDispatcher {
    pub fn reliable() -> Self {
        Self::default()
    }

    pub fn failing_first(failures: u32) -> Self {
        Self {
            remaining_failures: AtomicU32::new(failures),
            ..Self::default()
        }
    }

    /// Attempts made, failed ones included.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Layers successfully delivered, in order.
    pub fn delivered_layers(&self) -> Vec<QualityLayer> {
        self.delivered.lock().unwrap().iter().map(|s| s.layer).collect()
    }

    pub fn delivered(&self) -> Vec<LayerSwitch> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl LayerSwitchDispatcher for FlakyDispatcher {
    async fn dispatch(&self, switch: &LayerSwitch) -> Result<(), QualityError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(QualityError::Dispatch("transport busy".to_string()));
        }
        self.delivered.lock().unwrap().push(switch.clone());
        Ok(())
    }
}
