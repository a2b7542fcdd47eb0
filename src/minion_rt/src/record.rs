//! Commands exchanged with the device over the virtual queues.
//!
//! Everything is little-endian. A command starts with a `u32` opcode; a launch record
//! follows as grid, block (three `u32` each), `shared_mem: u32`, `kernel_entry: u64` and a
//! length-prefixed argument buffer. Completions carry a status (0 = success) and a message.

use crate::{Dim3, Fault, Result};

const OP_CONFIGURE: u32 = 1;
const OP_LAUNCH: u32 = 2;
const OP_SHUTDOWN: u32 = 3;

#[derive(Clone, Debug, PartialEq, Eq)]
/// Geometry, entry point and argument bytes of one kernel launch.
pub struct LaunchRecord {
    /// Blocks in the grid.
    pub grid: Dim3,
    /// Threads in a block.
    pub block: Dim3,
    /// Shared memory requested per block, in bytes.
    pub shared_mem: u32,
    /// Device address of the kernel stub.
    pub kernel_entry: u64,
    /// Packed kernel arguments.
    pub args: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// A request on the submission queue.
pub enum Command {
    /// Program the number of clusters taking part in launches.
    Configure {
        /// Active clusters.
        active_clusters: u32,
    },
    /// Run a kernel.
    Launch(LaunchRecord),
    /// Stop the device master loop.
    Shutdown,
}

#[derive(Clone, Debug, PartialEq, Eq)]
/// Reply on the completion queue.
pub struct Completion {
    /// 0 on success.
    pub status: i32,
    /// Fault description when `status` is not 0.
    pub message: String,
}

struct Writer(Vec<u8>);

impl Writer {
    fn u32(&mut self, v: u32) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn u64(&mut self, v: u64) -> &mut Self {
        self.0.extend_from_slice(&v.to_le_bytes());
        self
    }

    fn dim3(&mut self, d: Dim3) -> &mut Self {
        self.u32(d.x).u32(d.y).u32(d.z)
    }

    fn bytes(&mut self, b: &[u8]) -> &mut Self {
        self.u32(b.len() as u32);
        self.0.extend_from_slice(b);
        self
    }
}

struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.buf.len() < n {
            return Err(Fault::MalformedCommand(format!(
                "needed {} more bytes, {} left",
                n,
                self.buf.len()
            )));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn u32(&mut self) -> Result<u32> {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(raw))
    }

    fn u64(&mut self) -> Result<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    fn dim3(&mut self) -> Result<Dim3> {
        Ok(Dim3::new(self.u32()?, self.u32()?, self.u32()?))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn finish(&self) -> Result<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(Fault::MalformedCommand(format!("{} trailing bytes", self.buf.len())))
        }
    }
}

impl LaunchRecord {
    fn write(&self, w: &mut Writer) {
        w.dim3(self.grid)
            .dim3(self.block)
            .u32(self.shared_mem)
            .u64(self.kernel_entry)
            .bytes(&self.args);
    }

    fn read(r: &mut Reader<'_>) -> Result<Self> {
        Ok(LaunchRecord {
            grid: r.dim3()?,
            block: r.dim3()?,
            shared_mem: r.u32()?,
            kernel_entry: r.u64()?,
            args: r.bytes()?.to_vec(),
        })
    }
}

impl Command {
    /// Serialize for the submission queue.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer(Vec::new());
        match self {
            Command::Configure { active_clusters } => {
                w.u32(OP_CONFIGURE).u32(*active_clusters);
            }
            Command::Launch(record) => {
                w.u32(OP_LAUNCH);
                record.write(&mut w);
            }
            Command::Shutdown => {
                w.u32(OP_SHUTDOWN);
            }
        }
        w.0
    }

    /// Parse a submission queue element.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader { buf };
        let command = match r.u32()? {
            OP_CONFIGURE => Command::Configure {
                active_clusters: r.u32()?,
            },
            OP_LAUNCH => Command::Launch(LaunchRecord::read(&mut r)?),
            OP_SHUTDOWN => Command::Shutdown,
            op => return Err(Fault::MalformedCommand(format!("unknown opcode {}", op))),
        };
        r.finish()?;
        Ok(command)
    }
}

impl Completion {
    /// Successful completion.
    pub fn ok() -> Self {
        Completion {
            status: 0,
            message: String::new(),
        }
    }

    /// Completion reporting `outcome`.
    pub fn from_result(outcome: Result<()>) -> Self {
        match outcome {
            Ok(()) => Completion::ok(),
            Err(fault) => Completion {
                status: -1,
                message: fault.to_string(),
            },
        }
    }

    /// `Err(message)` unless the status is 0.
    pub fn into_result(self) -> std::result::Result<(), String> {
        if self.status == 0 {
            Ok(())
        } else {
            Err(self.message)
        }
    }

    /// Serialize for the completion queue.
    pub fn encode(&self) -> Vec<u8> {
        let mut w = Writer(Vec::new());
        w.u32(self.status as u32).bytes(self.message.as_bytes());
        w.0
    }

    /// Parse a completion queue element.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader { buf };
        let status = r.u32()? as i32;
        let message = String::from_utf8_lossy(r.bytes()?).into_owned();
        r.finish()?;
        Ok(Completion { status, message })
    }
}
