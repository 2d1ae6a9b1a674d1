//! Programming through an algorithm running on the target.  The code blob is uploaded once per
//! call; each chunk of data goes into a RAM buffer and the algorithm is started with
//! `(flash offset, buffer address, byte count)`.  It returns 1 on success.
use alloc::vec::Vec;

use log::{debug, error, info, warn};

use crate::error::{ConfigError, Error, ProtocolError, Result};
use crate::flash::Operation;
use crate::target::{AlgorithmHost, WorkingArea};

/// Words of scratch stack handed to the algorithm
pub const STACK_WORDS: u32 = 32;
/// Fill value of an unused stack word
pub const STACK_SENTINEL: u32 = 0xffff_ffff;
/// Return value of a successful run
pub const ALGORITHM_DONE: u32 = 1;
pub const DEFAULT_POLL_LIMIT: u32 = 100_000;

/// Everything one erase or write call hands to the flash code.  Lives only for that call.
#[derive(Clone, Copy, Debug)]
pub struct AlgorithmJob<'a> {
    /// Empty when the host drives the controller itself
    pub target_code: &'a [u8],
    pub work_buffer: WorkingArea,
    pub source_data: &'a [u8],
    pub offset: u32,
}

impl AlgorithmJob<'_> {
    pub fn length(&self) -> u32 {
        self.source_data.len() as u32
    }
}

pub struct AlgorithmLoader {
    preferred_buffer: u32,
    min_buffer: u32,
    poll_limit: u32,
}

impl AlgorithmLoader {
    /// Source buffers start at `preferred_buffer` bytes and are halved while RAM is short.  A
    /// buffer of `min_buffer` bytes or less is not worth it.
    pub fn new(preferred_buffer: u32, min_buffer: u32) -> Self {
        Self { preferred_buffer, min_buffer, poll_limit: DEFAULT_POLL_LIMIT }
    }

    pub fn with_poll_limit(mut self, polls: u32) -> Self {
        self.poll_limit = polls;
        self
    }

    pub fn allocate_buffer(&self, host: &mut dyn AlgorithmHost) -> Result<WorkingArea> {
        let mut size = self.preferred_buffer;
        loop {
            match host.alloc_working_area(size) {
                Ok(area) => {
                    debug!("source buffer {:#x} bytes at {:#010x}", area.size, area.address);
                    return Ok(area);
                }
                Err(Error::Config(ConfigError::NoWorkingArea(_))) => {
                    size = (size / 2) & !3;
                    if size <= self.min_buffer {
                        warn!("no large enough working area available, can't do block memory writes");
                        return Err(ConfigError::NoWorkingArea(size).into());
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Upload `code` and program `data` at flash offset `offset`
    pub fn write(&self, host: &mut dyn AlgorithmHost, code: &[u8], data: &[u8], offset: u32) -> Result<()> {
        let code_area = host.alloc_working_area((code.len() as u32 + 3) & !3)?;
        let r = self.with_code(host, code, code_area, data, offset);
        host.free_working_area(code_area);
        r
    }

    fn with_code(&self, host: &mut dyn AlgorithmHost, code: &[u8], code_area: WorkingArea, data: &[u8], offset: u32) -> Result<()> {
        host.write_buffer(code_area.address, code)?;
        let stack = host.alloc_working_area(STACK_WORDS * 4)?;
        let r = self.with_stack(host, code, code_area, stack, data, offset);
        host.free_working_area(stack);
        r
    }

    fn with_stack(&self, host: &mut dyn AlgorithmHost, code: &[u8], code_area: WorkingArea, stack: WorkingArea, data: &[u8], offset: u32) -> Result<()> {
        let work_buffer = self.allocate_buffer(host)?;
        let job = AlgorithmJob { target_code: code, work_buffer, source_data: data, offset };
        let r = self.run(host, code_area.address, stack, &job);
        host.free_working_area(work_buffer);
        r
    }

    /// Run the uploaded algorithm at `entry` over `job`, one buffer at a time
    pub fn run(&self, host: &mut dyn AlgorithmHost, entry: u32, stack: WorkingArea, job: &AlgorithmJob<'_>) -> Result<()> {
        let sentinel: Vec<u8> = (0..stack.size / 4).flat_map(|_| STACK_SENTINEL.to_le_bytes()).collect();
        let total = job.length().max(1);
        let mut offset = job.offset;
        let mut done = 0;

        for chunk in job.source_data.chunks(job.work_buffer.size as usize) {
            let len = chunk.len() as u32;
            host.write_buffer(stack.address, &sentinel)?;
            host.write_buffer(job.work_buffer.address, chunk)?;
            host.start_algorithm(entry, [offset, job.work_buffer.address, len], stack.end())?;

            let ret = self.wait(host, entry)?;
            if host.read_u32(stack.address)? != STACK_SENTINEL {
                error!("flash algorithm at {:#010x} overran its stack", entry);
                return Err(ProtocolError::StackOverrun.into());
            }
            if ret != ALGORITHM_DONE {
                error!("flash write failed, status {:#x}", ret);
                return Err(ProtocolError::Status { op: Operation::Program, value: ret, offset }.into());
            }

            offset += len;
            done += len;
            info!(" ... {}%", done as u64 * 100 / total as u64);
        }
        info!(" done ...");
        Ok(())
    }

    fn wait(&self, host: &mut dyn AlgorithmHost, entry: u32) -> Result<u32> {
        for _ in 0..self.poll_limit {
            if let Some(ret) = host.poll_algorithm()? {
                return Ok(ret);
            }
        }
        host.halt_algorithm()?;
        error!("flash algorithm at {:#010x} did not finish", entry);
        Err(ProtocolError::AlgorithmTimeout(self.poll_limit).into())
    }
}
