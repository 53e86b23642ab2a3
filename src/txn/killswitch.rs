use crate::Error;

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Receives the panic message once the kill-switch fires.
pub type PanicHandler = Box<dyn FnOnce(&str) + Send>;

/// Moves the engine into its terminal panic state after an unrecoverable
/// error. Fires at most once.
#[derive(Default)]
pub struct Killswitch {
    handler: Mutex<Option<PanicHandler>>,
    fired: AtomicBool,
    disabled: AtomicBool,
}

impl Killswitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_handler(&self, handler: PanicHandler) {
        *self.handler.lock() = Some(handler);
    }

    pub fn panic(&self, message: &str, cause: Option<&Error>) {
        if self.disabled.load(Ordering::Acquire) {
            tracing::debug!(message, "Kill-switch disabled, ignoring");
            return;
        }
        if self.fired.swap(true, Ordering::AcqRel) {
            tracing::warn!(message, "Kill-switch already fired");
            return;
        }
        let message = match cause {
            Some(cause) => format!("{}: {}", message, cause),
            None => message.to_string(),
        };
        tracing::error!(message = %message, "Kill-switch fired, engine is shutting down");
        if let Some(handler) = self.handler.lock().take() {
            handler(&message);
        }
    }

    /// Turns every later [`Killswitch::panic`] into a no-op.
    pub fn disable(&self) {
        self.disabled.store(true, Ordering::Release);
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
