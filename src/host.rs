// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Pipeline host (C4): CLI parsing, module wiring, worker lifecycle.
//
// Cancellation here leans on two independent mechanisms rather than
// `pthread_cancel` (which Rust has no safe wrapper for): the process-wide
// `RUN_FLAG` a worker's own loop consults, and `pthread_kill(SIGINT)` sent
// to each worker's native thread id to unblock any in-flight syscall — the
// installed handler only clears `RUN_FLAG`, it never terminates the thread.

use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::{debug, error, warn};

use crate::error::{HpError, Result};
use crate::keys::InstanceId;
use crate::registry::{self, ThreadDescriptor};
use crate::sched;
use crate::status::StatusBuffer;
use crate::DataBuffer;

static RUN_FLAG: AtomicBool = AtomicBool::new(false);

/// Startup/shutdown tuning the CLI does not expose directly.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Sleep between starting each worker, letting it reach its loop before
    /// the next (earlier) stage can possibly write into a buffer it feeds.
    pub inter_start_sleep: Duration,
    /// Main-thread idle-loop poll interval while the run flag is set.
    pub idle_poll: Duration,
    /// Attempt `SCHED_RR` promotion for every worker at startup.
    pub realtime: bool,
    /// Priority passed to `sched::set_realtime_priority` when `realtime`.
    pub default_priority: i32,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            inter_start_sleep: Duration::from_millis(50),
            idle_poll: Duration::from_millis(100),
            realtime: false,
            default_priority: 1,
        }
    }
}

/// Per-worker mutable record, allocated by the host before `init`, mutated
/// only by the owning worker after start, torn down after join.
pub struct ThreadArgs {
    pub instance: InstanceId,
    pub input_buffer_id: Option<u32>,
    pub output_buffer_id: Option<u32>,
    pub cpu_mask: u64,
    pub priority: i32,
    pub descriptor: ThreadDescriptor,
    finished: (Mutex<bool>, Condvar),
}

impl ThreadArgs {
    fn mark_finished(&self) {
        let mut done = self.finished.0.lock().unwrap();
        *done = true;
        self.finished.1.notify_all();
    }

    /// Block until this worker's scoped exit handler has run. Intended for
    /// external callers (tests, tooling), not the host's own shutdown path —
    /// that waits via `JoinHandle::join` instead.
    pub fn wait_finished(&self) {
        let mut done = self.finished.0.lock().unwrap();
        while !*done {
            done = self.finished.1.wait(done).unwrap();
        }
    }

    pub fn is_finished(&self) -> bool {
        *self.finished.0.lock().unwrap()
    }
}

fn flag_name(tok: &str) -> &str {
    tok.split('=').next().unwrap_or(tok)
}

fn take_value<'a, I: Iterator<Item = &'a String>>(
    tok: &str,
    iter: &mut std::iter::Peekable<I>,
) -> Result<String> {
    if let Some(eq) = tok.find('=') {
        Ok(tok[eq + 1..].to_string())
    } else {
        iter.next()
            .cloned()
            .ok_or_else(|| HpError::Fatal(format!("missing value for {tok}")))
    }
}

fn usage_text() -> String {
    "hashpipe [options] <module>...\n\n\
Options:\n\
  -h, --help          Print this help and exit\n\
  -l, --list          List registered modules and exit\n\
  -I, --instance=N    Set instance id for subsequent threads (0-63)\n\
  -c, --cpu=N         Set CPU mask 1<<N for the next thread\n\
  -m, --mask=N        Set CPU mask directly for the next thread\n\
  -o, --option=K=V    Store K=V in the status buffer of the current instance\n"
        .to_string()
}

/// Attach the transient handles a module's `init` needs, call it, and let
/// `Drop` detach everything on return — the same scoped-release discipline
/// the worker lifecycle uses, just for the one-shot startup call.
fn init_module(
    instance: InstanceId,
    descriptor: &ThreadDescriptor,
    input_id: Option<u32>,
    output_id: Option<u32>,
) -> Result<()> {
    let status = StatusBuffer::attach(instance)?;
    let _input: Option<DataBuffer> = match (descriptor.input_buffer_factory, input_id) {
        (Some(factory), Some(id)) => Some(factory(instance, id)?),
        _ => None,
    };
    let _output: Option<DataBuffer> = match (descriptor.output_buffer_factory, output_id) {
        (Some(factory), Some(id)) => Some(factory(instance, id)?),
        _ => None,
    };
    if let Some(init) = descriptor.init {
        init(&status)?;
    }
    Ok(())
}

/// Outcome of parsing the command line: either a pipeline ready to run, or
/// one of the two exit-0 informational paths (`-h`, `-l`).
pub enum ParsedCli {
    Help(String),
    List(Vec<&'static str>),
    Run(PipelineHost),
}

impl std::fmt::Debug for ParsedCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParsedCli::Help(s) => f.debug_tuple("Help").field(s).finish(),
            ParsedCli::List(v) => f.debug_tuple("List").field(v).finish(),
            ParsedCli::Run(_) => f.debug_tuple("Run").field(&"PipelineHost").finish(),
        }
    }
}

/// Parse CLI tokens left to right, wiring modules into a buffer chain as
/// they're named. `args` excludes the program name (pass
/// `std::env::args().skip(1).collect::<Vec<_>>()`).
pub fn parse_args(args: &[String], config: HostConfig) -> Result<ParsedCli> {
    let mut current_instance = InstanceId::new(0);
    let mut current_cpu_mask: u64 = 0;
    let mut next_buffer_id: u32 = 0;
    let mut last_output_id: Option<u32> = None;
    let mut threads = Vec::new();

    let mut iter = args.iter().peekable();
    while let Some(tok) = iter.next() {
        match flag_name(tok) {
            "-h" | "--help" => return Ok(ParsedCli::Help(usage_text())),
            "-l" | "--list" => return Ok(ParsedCli::List(registry::list_modules())),
            "-I" | "--instance" => {
                let v = take_value(tok, &mut iter)?;
                let n: u32 = v
                    .parse()
                    .map_err(|_| HpError::Fatal(format!("invalid instance: {v}")))?;
                current_instance = InstanceId::new(n);
            }
            "-c" | "--cpu" => {
                let v = take_value(tok, &mut iter)?;
                let n: u32 = v
                    .parse()
                    .map_err(|_| HpError::Fatal(format!("invalid cpu: {v}")))?;
                current_cpu_mask = 1u64 << n;
            }
            "-m" | "--mask" => {
                let v = take_value(tok, &mut iter)?;
                current_cpu_mask = v
                    .parse()
                    .map_err(|_| HpError::Fatal(format!("invalid mask: {v}")))?;
            }
            "-o" | "--option" => {
                let v = take_value(tok, &mut iter)?;
                let (k, val) = v
                    .split_once('=')
                    .ok_or_else(|| HpError::Fatal(format!("-o expects K=V, got {v}")))?;
                let status = StatusBuffer::attach(current_instance)?;
                status.put_str(k, val)?;
            }
            other if other.starts_with('-') => {
                return Err(HpError::Fatal(format!("unknown flag: {other}")));
            }
            module_name => {
                let descriptor = registry::find_module(module_name)?;

                let input_id = if descriptor.input_buffer_factory.is_some() {
                    last_output_id
                } else {
                    None
                };
                let output_id = if descriptor.output_buffer_factory.is_some() {
                    let id = next_buffer_id;
                    next_buffer_id += 1;
                    Some(id)
                } else {
                    None
                };
                last_output_id = output_id;

                init_module(current_instance, &descriptor, input_id, output_id)?;

                threads.push(Arc::new(ThreadArgs {
                    instance: current_instance,
                    input_buffer_id: input_id,
                    output_buffer_id: output_id,
                    cpu_mask: current_cpu_mask,
                    priority: config.default_priority,
                    descriptor,
                    finished: (Mutex::new(false), Condvar::new()),
                }));
                current_cpu_mask = 0;
            }
        }
    }

    Ok(ParsedCli::Run(PipelineHost { config, threads }))
}

extern "C" fn handle_shutdown_signal(_sig: libc::c_int) {
    RUN_FLAG.store(false, Ordering::Release);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGINT, handle_shutdown_signal as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_shutdown_signal as libc::sighandler_t);
    }
}

fn run_module(args: &ThreadArgs) -> Result<()> {
    let status = StatusBuffer::attach(args.instance)?;

    // Plain `Drop` already releases `status`/`input`/`output` on every exit
    // path (normal return, `?`, or panic during unwind) — this guard only
    // covers the one side effect `Drop` can't express: publishing the exit
    // card and waking anyone blocked in `wait_finished`.
    let finished_guard = crate::scoped::defer(|| {
        let _ = status.put_str(args.descriptor.status_key, "exit");
        args.mark_finished();
    });

    let input = match (args.descriptor.input_buffer_factory, args.input_buffer_id) {
        (Some(factory), Some(id)) => Some(factory(args.instance, id)?),
        _ => None,
    };
    let output = match (args.descriptor.output_buffer_factory, args.output_buffer_id) {
        (Some(factory), Some(id)) => Some(factory(args.instance, id)?),
        _ => None,
    };

    let result = (args.descriptor.run)(&status, input.as_ref(), output.as_ref(), &RUN_FLAG);
    drop(finished_guard);
    result
}

/// Set CPU affinity and scheduling priority. Either failing aborts the
/// worker before it ever attaches to shared memory — it never reaches
/// `run_module`, mirroring the original runtime's `set_cpu_affinity`/
/// `set_priority` checks, which `goto done` straight past every attach on
/// failure.
fn apply_scheduling(args: &ThreadArgs, config: &HostConfig) -> Result<()> {
    if args.cpu_mask != 0 {
        sched::set_affinity(args.cpu_mask).map_err(HpError::Affinity)?;
    }
    if config.realtime {
        sched::set_realtime_priority(args.priority).map_err(HpError::Priority)?;
    }
    Ok(())
}

fn worker_body(args: Arc<ThreadArgs>, config: HostConfig) {
    if let Err(e) = apply_scheduling(&args, &config) {
        error!(module = %args.descriptor.name, error = %e, "worker aborted: scheduling setup failed");
        // Never attached, so there's no exit card to publish — but still
        // release any external `wait_finished()` caller.
        args.mark_finished();
    } else if let Err(e) = run_module(&args) {
        error!(module = %args.descriptor.name, error = %e, "worker exited with error");
    }
    // Any worker stopping — clean or not — winds the whole pipeline down.
    RUN_FLAG.store(false, Ordering::Release);
}

/// The assembled pipeline: wired thread args, ready to start.
pub struct PipelineHost {
    config: HostConfig,
    threads: Vec<Arc<ThreadArgs>>,
}

impl PipelineHost {
    /// The wired thread records, in CLI order. Exposed for inspection
    /// (tests, `--list`-adjacent tooling) without having to run the
    /// pipeline.
    pub fn threads(&self) -> &[Arc<ThreadArgs>] {
        &self.threads
    }

    /// Run the startup sequence, idle until the run flag clears, then run
    /// the shutdown sequence. Returns once every worker has joined.
    pub fn run(self) -> Result<()> {
        if let Err(e) = sched::raise_memlock_rlimit() {
            warn!(error = %e, "failed to raise RLIMIT_MEMLOCK, continuing without it");
        }
        install_signal_handlers();
        RUN_FLAG.store(true, Ordering::Release);

        let mut started: Vec<(Arc<ThreadArgs>, thread::JoinHandle<()>)> =
            Vec::with_capacity(self.threads.len());
        for args in self.threads.iter().rev() {
            let worker_args = args.clone();
            let cfg = self.config.clone();
            let handle = thread::Builder::new()
                .name(args.descriptor.name.to_string())
                .spawn(move || worker_body(worker_args, cfg))
                .map_err(|e| HpError::Fatal(format!("failed to spawn worker: {e}")))?;
            debug!(module = %args.descriptor.name, "worker started");
            started.push((args.clone(), handle));
            thread::sleep(self.config.inter_start_sleep);
        }

        while RUN_FLAG.load(Ordering::Acquire) {
            thread::sleep(self.config.idle_poll);
        }

        for (args, handle) in started.into_iter().rev() {
            let tid = handle.as_pthread_t();
            unsafe {
                libc::pthread_kill(tid, libc::SIGINT);
            }
            let _ = handle.join();
            debug!(module = %args.descriptor.name, "worker joined");
        }
        Ok(())
    }
}
