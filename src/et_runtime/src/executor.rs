//! The executor thread of a device.
//!
//! It scans the streams in creation order and runs the front action of the first stream
//! whose front is ready, with the device lock released. It sleeps on the work condition
//! when nothing is ready; every enqueue wakes it.

use crate::action::ExecContext;
use crate::device::Shared;
use crate::error::{Error, Result};
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
};

pub(crate) struct Executor {
    thread: Option<JoinHandle<()>>,
}

impl Executor {
    pub fn spawn(index: i32, shared: Arc<Shared>, ctx: ExecContext) -> Result<Self> {
        let thread = thread::Builder::new()
            .name(format!("etrt-executor-{}", index))
            .spawn(move || executor_loop(&shared, &ctx))
            .map_err(|e| Error::DeviceFault(format!("cannot start executor thread: {}", e)))?;
        Ok(Executor { thread: Some(thread) })
    }

    /// Ask the loop to exit and join it. Queued actions are left in place.
    pub fn stop(&mut self, shared: &Shared) {
        shared.state.lock().unwrap().exit_requested = true;
        shared.work.notify_all();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("Executor thread panicked");
            }
        }
    }
}

fn executor_loop(shared: &Shared, ctx: &ExecContext) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.exit_requested {
            return;
        }
        let (stream, mut action) = match state.pop_ready() {
            Some(next) => next,
            None => {
                state = shared.work.wait(state).unwrap();
                continue;
            }
        };
        let fault = state.fault.clone();
        drop(state);

        log::debug!("execute {:?} from {:?}", action, stream);
        let outcome = match fault {
            Some(msg) if action.touches_device() => Err(Error::DeviceFault(msg)),
            _ => action.execute(ctx),
        };
        action.finish(&outcome);

        state = shared.state.lock().unwrap();
        if let Err(e) = outcome {
            log::warn!("Error in executor, {:?} from {:?}: {}", action, stream, e);
            if let Error::DeviceFault(msg) = &e {
                state.fault.get_or_insert_with(|| msg.clone());
            }
            if let Some(stream) = state.streams.get_mut(stream) {
                stream.defer_error(e);
            }
        }
    }
}
