//! Instrumented backend for exercising the session table and server.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use serde_json::{json, Map, Value};

use super::{Backend, BackendError};
use crate::config::SessionConfig;

#[derive(Default)]
pub struct StubBackend {
    pub fail_init: AtomicBool,
    fail_startup: bool,
    call_delay: Duration,
    panic_on_release: Option<usize>,
    next_handle: AtomicUsize,
    active: AtomicUsize,
    pub max_concurrent: AtomicUsize,
    pub released: Mutex<Vec<usize>>,
    pub shut_down: AtomicBool,
}

pub struct StubHandle {
    pub id: usize,
    pub config: SessionConfig,
    pub calls: usize,
}

impl StubBackend {
    pub fn with_delay(call_delay: Duration) -> Self {
        Self {
            call_delay,
            ..Self::default()
        }
    }

    pub fn failing_startup() -> Self {
        Self {
            fail_startup: true,
            ..Self::default()
        }
    }

    /// Panics while releasing the handle with this id.
    pub fn panicking_release(handle_id: usize) -> Self {
        Self {
            panic_on_release: Some(handle_id),
            ..Self::default()
        }
    }

    pub fn released_ids(&self) -> Vec<usize> {
        let mut ids = self.released.lock().unwrap().clone();
        ids.sort_unstable();
        ids
    }

    pub fn released_count(&self) -> usize {
        self.released.lock().unwrap().len()
    }
}

impl Backend for StubBackend {
    type Handle = StubHandle;

    fn name(&self) -> &'static str {
        "stub"
    }

    fn startup(&self) -> Result<(), BackendError> {
        if self.fail_startup {
            return Err(BackendError::Init("stub refused to start".into()));
        }
        Ok(())
    }

    fn init(&self, config: &SessionConfig) -> Result<StubHandle, BackendError> {
        if self.fail_init.load(Ordering::SeqCst) {
            return Err(BackendError::Init("stub refused".into()));
        }
        Ok(StubHandle {
            id: self.next_handle.fetch_add(1, Ordering::SeqCst),
            config: config.clone(),
            calls: 0,
        })
    }

    fn execute(
        &self,
        handle: &mut StubHandle,
        action: &str,
        params: &Map<String, Value>,
    ) -> Result<Value, BackendError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(now, Ordering::SeqCst);
        if !self.call_delay.is_zero() {
            std::thread::sleep(self.call_delay);
        }
        handle.calls += 1;
        self.active.fetch_sub(1, Ordering::SeqCst);

        if action == "fail" {
            return Err(BackendError::Call("stub failure".into()));
        }
        Ok(json!({
            "handle": handle.id,
            "calls": handle.calls,
            "action": action,
            "params": params,
            "charttype": handle.config.charttype,
        }))
    }

    fn release(&self, handle: StubHandle) {
        if self.panic_on_release == Some(handle.id) {
            panic!("stub release of handle {} blew up", handle.id);
        }
        self.released.lock().unwrap().push(handle.id);
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}
