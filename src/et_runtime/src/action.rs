//! Units of work queued on a stream.

use crate::error::{Error, Result};
use crate::target::DeviceTarget;
use minion_rt::{FlatMemory, GlobalMemory, LaunchRecord};
use std::{
    fmt,
    sync::{Arc, Condvar, Mutex},
    time::Instant,
};

/// Completion flag of an `EventMark` or a code upload, shared with the events, waiters,
/// launches and synchronizing callers that refer to it.
#[derive(Debug, Default)]
pub(crate) struct Marker {
    state: Mutex<MarkState>,
    fired: Condvar,
}

#[derive(Debug, Default)]
struct MarkState {
    executed: bool,
    outcome: Option<Error>,
    at: Option<Instant>,
}

impl Marker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn is_executed(&self) -> bool {
        self.state.lock().unwrap().executed
    }

    /// Mark executed, publishing the stream error carried by the mark.
    pub fn fire(&self, outcome: Option<Error>) {
        let mut state = self.state.lock().unwrap();
        if state.executed {
            return;
        }
        state.executed = true;
        state.outcome = outcome;
        state.at = Some(Instant::now());
        self.fired.notify_all();
    }

    /// Fire a mark that will never run.
    pub fn abandon(&self) {
        self.fire(Some(Error::InvalidValue(
            "stream destroyed before the marker executed".to_string(),
        )));
    }

    /// Block until executed.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        while !state.executed {
            state = self.fired.wait(state).unwrap();
        }
        state.outcome.clone().map_or(Ok(()), Err)
    }

    /// `None` while pending.
    pub fn outcome(&self) -> Option<Result<()>> {
        let state = self.state.lock().unwrap();
        if state.executed {
            Some(state.outcome.clone().map_or(Ok(()), Err))
        } else {
            None
        }
    }

    pub fn executed_at(&self) -> Option<Instant> {
        self.state.lock().unwrap().at
    }
}

/// Where a read lands.
pub(crate) enum ReadTarget {
    /// Pinned host memory.
    Host(u64),
    /// A buffer the caller collects after synchronizing.
    Staging(Arc<Mutex<Vec<u8>>>),
}

/// Where written bytes come from.
pub(crate) enum WriteSource {
    /// Pinned host memory, read when the action executes.
    Host { ptr: u64, len: usize },
    /// Bytes captured at enqueue time.
    Bytes(Arc<[u8]>),
}

pub(crate) enum ActionKind {
    /// Program the active clusters.
    Configure { active_clusters: u32 },
    /// Device to host (or host to host) transfer.
    Read { src: u64, dst: ReadTarget, len: usize },
    /// Host to device (or host to host) transfer; `done` fires with its outcome.
    Write {
        dst: u64,
        src: WriteSource,
        done: Option<Arc<Marker>>,
    },
    /// Kernel launch, held back until the upload of its code image (if any) fired.
    Launch {
        record: LaunchRecord,
        code: Option<Arc<Marker>>,
    },
    /// Marks the stream position; fires its marker with the stream's deferred error.
    EventMark {
        marker: Arc<Marker>,
        consume: bool,
        carried: Option<Error>,
    },
    /// Blocks the stream until the marker fired.
    EventWait(Arc<Marker>),
}

pub(crate) struct Action {
    pub id: u64,
    pub kind: ActionKind,
}

/// What the executor needs to run an action outside the device lock.
pub(crate) struct ExecContext {
    pub target: Arc<dyn DeviceTarget>,
    pub host: Arc<FlatMemory>,
}

impl ExecContext {
    fn read_host(&self, ptr: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.host
            .load(ptr, &mut buf)
            .map_err(|_| Error::InvalidValue(format!("{:#x} (+{}) is outside pinned host memory", ptr, len)))?;
        Ok(buf)
    }

    fn write_anywhere(&self, dst: u64, data: &[u8]) -> Result<()> {
        if self.host.contains(dst, 1) {
            self.host
                .store(dst, data)
                .map_err(|_| Error::InvalidValue(format!("{:#x} (+{}) is outside pinned host memory", dst, data.len())))
        } else {
            self.target.write(dst, data)
        }
    }

    fn read_anywhere(&self, src: u64, out: &mut [u8]) -> Result<()> {
        if self.host.contains(src, 1) {
            let data = self.read_host(src, out.len())?;
            out.copy_from_slice(&data);
            Ok(())
        } else {
            self.target.read(src, out)
        }
    }
}

impl Action {
    /// Whether the action may leave the front of its stream.
    pub fn ready_for_execution(&self) -> bool {
        match &self.kind {
            ActionKind::EventWait(marker) => marker.is_executed(),
            ActionKind::Launch { code: Some(upload), .. } => upload.is_executed(),
            _ => true,
        }
    }

    /// Whether running the action talks to the device.
    pub fn touches_device(&self) -> bool {
        !matches!(self.kind, ActionKind::EventMark { .. } | ActionKind::EventWait(_))
    }

    pub fn execute(&mut self, ctx: &ExecContext) -> Result<()> {
        match &mut self.kind {
            ActionKind::Configure { active_clusters } => ctx.target.configure(*active_clusters),
            ActionKind::Read { src, dst, len } => {
                let mut buf = vec![0; *len];
                ctx.read_anywhere(*src, &mut buf)?;
                match dst {
                    ReadTarget::Host(ptr) => ctx.write_anywhere(*ptr, &buf),
                    ReadTarget::Staging(stage) => {
                        *stage.lock().unwrap() = buf;
                        Ok(())
                    }
                }
            }
            ActionKind::Write { dst, src, .. } => match src {
                WriteSource::Host { ptr, len } => {
                    let data = ctx.read_host(*ptr, *len)?;
                    ctx.write_anywhere(*dst, &data)
                }
                WriteSource::Bytes(bytes) => ctx.write_anywhere(*dst, &bytes[..]),
            },
            ActionKind::Launch { record, code } => {
                if let Some(Err(e)) = code.as_ref().and_then(|upload| upload.outcome()) {
                    return Err(e);
                }
                ctx.target.launch(record)
            }
            ActionKind::EventMark { marker, carried, .. } => {
                marker.fire(carried.take());
                Ok(())
            }
            ActionKind::EventWait(_) => Ok(()),
        }
    }

    /// Publish the outcome of a write to whoever waits on it.
    pub fn finish(&self, outcome: &Result<()>) {
        if let ActionKind::Write { done: Some(done), .. } = &self.kind {
            done.fire(outcome.clone().err());
        }
    }

    /// Release whoever waits on this action when it will never run.
    pub fn abandon(self) {
        match self.kind {
            ActionKind::EventMark { marker, .. } => marker.abandon(),
            ActionKind::Write { done: Some(done), .. } => done.abandon(),
            _ => {}
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &self.kind {
            ActionKind::Configure { .. } => "Configure",
            ActionKind::Read { .. } => "Read",
            ActionKind::Write { .. } => "Write",
            ActionKind::Launch { .. } => "Launch",
            ActionKind::EventMark { .. } => "EventMark",
            ActionKind::EventWait(_) => "EventWait",
        };
        write!(f, "{}#{}", kind, self.id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use minion_rt::Dim3;
    use std::{thread, time::Duration};

    #[test]
    fn waiter_ready_only_after_mark() {
        let marker = Marker::new();
        let waiter = Action {
            id: 1,
            kind: ActionKind::EventWait(marker.clone()),
        };
        assert!(!waiter.ready_for_execution());
        assert!(!waiter.touches_device());
        marker.fire(None);
        assert!(waiter.ready_for_execution());
        assert_eq!(marker.outcome(), Some(Ok(())));
    }

    #[test]
    fn wait_returns_carried_error() {
        let marker = Marker::new();
        let waiter = {
            let marker = marker.clone();
            thread::spawn(move || marker.wait())
        };
        thread::sleep(Duration::from_millis(10));
        marker.fire(Some(Error::DeviceFault("bad".to_string())));
        assert_eq!(waiter.join().unwrap(), Err(Error::DeviceFault("bad".to_string())));
        // later fires do not overwrite
        marker.fire(None);
        assert_eq!(marker.wait(), Err(Error::DeviceFault("bad".to_string())));
        assert!(marker.executed_at().is_some());
    }

    #[test]
    fn abandoned_mark_releases_waiters() {
        let marker = Marker::new();
        let mark = Action {
            id: 7,
            kind: ActionKind::EventMark {
                marker: marker.clone(),
                consume: true,
                carried: None,
            },
        };
        assert_eq!(format!("{:?}", mark), "EventMark#7");
        mark.abandon();
        assert!(matches!(marker.wait(), Err(Error::InvalidValue(_))));
    }

    #[test]
    fn launch_held_until_its_code_is_written() {
        let upload = Marker::new();
        let write = Action {
            id: 1,
            kind: ActionKind::Write {
                dst: 0x1000,
                src: WriteSource::Bytes(vec![0u8; 8].into()),
                done: Some(upload.clone()),
            },
        };
        let launch = Action {
            id: 2,
            kind: ActionKind::Launch {
                record: LaunchRecord {
                    grid: Dim3::new(1, 1, 1),
                    block: Dim3::new(1, 1, 1),
                    shared_mem: 0,
                    kernel_entry: 0x1000,
                    args: Vec::new(),
                },
                code: Some(upload.clone()),
            },
        };
        assert!(!launch.ready_for_execution());
        assert!(launch.touches_device());
        write.finish(&Err(Error::InvalidValue("bad write".to_string())));
        assert!(launch.ready_for_execution());
        assert_eq!(upload.outcome(), Some(Err(Error::InvalidValue("bad write".to_string()))));
        // abandoning after the fact keeps the first outcome
        write.abandon();
        assert!(matches!(upload.wait(), Err(Error::InvalidValue(msg)) if msg == "bad write"));
    }
}
