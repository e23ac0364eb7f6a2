use std::collections::VecDeque;
use std::ffi::CString;
use std::fmt;
use std::io;
use std::mem;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::ptr;
use std::sync::atomic::{AtomicI32, AtomicIsize, AtomicBool, Ordering};

use log::{debug, warn};
use windows_sys::Win32::{
    Foundation::{
        CloseHandle, GetLastError, ERROR_BROKEN_PIPE, ERROR_FILE_NOT_FOUND, ERROR_INVALID_PARAMETER,
        ERROR_IO_PENDING, GENERIC_READ, GENERIC_WRITE, HANDLE, INVALID_HANDLE_VALUE,
        STATUS_CONTROL_C_EXIT, TRUE,
    },
    Security::SECURITY_ATTRIBUTES,
    Storage::FileSystem::{
        CreateFileA, FILE_FLAG_OVERLAPPED, FILE_SHARE_READ, FILE_SHARE_WRITE, OPEN_EXISTING,
        ReadFile,
    },
    System::{
        Console::{GenerateConsoleCtrlEvent, SetConsoleCtrlHandler, CTRL_BREAK_EVENT, CTRL_C_EVENT},
        Pipes::{ConnectNamedPipe, CreateNamedPipeA, PIPE_ACCESS_INBOUND, PIPE_TYPE_BYTE,
            PIPE_UNLIMITED_INSTANCES},
        Threading::{
            CreateProcessA, GetCurrentProcessId, GetExitCodeProcess, RegisterWaitForSingleObject,
            UnregisterWait, WaitForSingleObject, CREATE_NEW_PROCESS_GROUP, INFINITE,
            PROCESS_INFORMATION, STARTF_USESTDHANDLES, STARTUPINFOA, WT_EXECUTEONLYONCE,
        },
        IO::{CreateIoCompletionPort, GetQueuedCompletionStatus, PostQueuedCompletionStatus,
            OVERLAPPED},
    },
};

use super::{ExitStatus, OutputBuffers, StreamId};
use crate::error::{Error, Result};

/// Completion key reserved for interrupt wake-ups.
const INTERRUPT_KEY: usize = usize::MAX;

/// Ctrl event that interrupted the wait, or 0.
static INTERRUPT_CAUSE: AtomicI32 = AtomicI32::new(0);
/// The live set's completion port, reachable from the ctrl handler
/// and the child-exit wait callbacks.
static IOPORT: AtomicIsize = AtomicIsize::new(0);
/// The console ctrl handler is process-wide, so at most one supervisor
/// may exist at a time.
static SUPERVISOR_LIVE: AtomicBool = AtomicBool::new(false);

unsafe extern "system" fn notify_interrupted(ctrl_type: u32) -> i32 {
    if ctrl_type == CTRL_C_EVENT || ctrl_type == CTRL_BREAK_EVENT {
        INTERRUPT_CAUSE.store(ctrl_type as i32, Ordering::Relaxed);
        let port = IOPORT.load(Ordering::Relaxed);
        if port != 0 {
            PostQueuedCompletionStatus(port as HANDLE, 0, INTERRUPT_KEY, ptr::null_mut());
        }
        return TRUE;
    }
    0
}

/// Wait-callback pushing a child's exit through the port with the
/// subprocess's own key. Console children have no pipes to go EOF and
/// depend on it entirely; for piped children it is what records the
/// exit status before they are reported done.
unsafe extern "system" fn notify_child_exit(key: *mut core::ffi::c_void, _timed_out: u8) {
    let port = IOPORT.load(Ordering::Relaxed);
    if port != 0 {
        PostQueuedCompletionStatus(port as HANDLE, 0, key as usize, ptr::null_mut());
    }
}

/// Completion keys identify a pipe by stable numeric id rather than a
/// pointer back into the subprocess: subprocess id in the upper bits,
/// stream in the lowest.
fn completion_key(id: u64, which: StreamId) -> usize {
    let stream = match which {
        StreamId::Stdout => 0usize,
        StreamId::Stderr => 1usize,
    };
    ((id as usize) << 1) | stream
}

fn decode_key(key: usize) -> (u64, StreamId) {
    let which = if key & 1 == 0 {
        StreamId::Stdout
    } else {
        StreamId::Stderr
    };
    ((key >> 1) as u64, which)
}

/// One overlapped read pipe feeding a subprocess output stream.
struct OutputPipe {
    pipe: OwnedHandle,
    /// Boxed so the kernel sees a stable address across reads.
    overlapped: Box<OVERLAPPED>,
    buf: Box<[u8; 4096]>,
    /// False until the connect completion has been consumed.
    is_reading: bool,
}

impl fmt::Debug for OutputPipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutputPipe")
            .field("pipe", &self.pipe)
            .field("is_reading", &self.is_reading)
            .finish()
    }
}

impl OutputPipe {
    /// Creates the overlapped parent half, registers it with the port
    /// under `key`, and returns the inheritable child half.
    fn new(ioport: HANDLE, key: usize, name: &str) -> io::Result<(OutputPipe, OwnedHandle)> {
        let cname = CString::new(name).unwrap();

        let pipe = unsafe {
            CreateNamedPipeA(
                cname.as_ptr() as *const u8,
                PIPE_ACCESS_INBOUND | FILE_FLAG_OVERLAPPED,
                PIPE_TYPE_BYTE,
                PIPE_UNLIMITED_INSTANCES,
                0,
                0,
                INFINITE,
                ptr::null(),
            )
        };
        if pipe == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        let pipe = unsafe { OwnedHandle::from_raw_handle(pipe as _) };

        if unsafe { CreateIoCompletionPort(pipe.as_raw_handle() as HANDLE, ioport, key, 0) } == 0 {
            return Err(io::Error::last_os_error());
        }

        let mut overlapped: Box<OVERLAPPED> = Box::new(unsafe { mem::zeroed() });
        let connected =
            unsafe { ConnectNamedPipe(pipe.as_raw_handle() as HANDLE, &mut *overlapped) };
        if connected == 0 && unsafe { GetLastError() } != ERROR_IO_PENDING {
            return Err(io::Error::last_os_error());
        }

        // The child half is opened inheritable so it can be wired
        // straight onto the child's stdio.
        let inherit = SECURITY_ATTRIBUTES {
            nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: ptr::null_mut(),
            bInheritHandle: TRUE,
        };
        let child_half = unsafe {
            CreateFileA(
                cname.as_ptr() as *const u8,
                GENERIC_WRITE,
                0,
                &inherit,
                OPEN_EXISTING,
                0,
                0 as HANDLE,
            )
        };
        if child_half == INVALID_HANDLE_VALUE {
            return Err(io::Error::last_os_error());
        }
        let child_half = unsafe { OwnedHandle::from_raw_handle(child_half as _) };

        Ok((
            OutputPipe {
                pipe,
                overlapped,
                buf: Box::new([0u8; 4096]),
                is_reading: false,
            },
            child_half,
        ))
    }
}

/// A single supervised child process.
#[derive(Debug)]
pub struct Subprocess {
    id: u64,
    use_console: bool,
    pid: u32,
    child: Option<OwnedHandle>,
    /// Registered wait that posts the child's exit through the port.
    exit_wait: Option<HANDLE>,
    stdout_pipe: Option<OutputPipe>,
    stderr_pipe: Option<OutputPipe>,
    output: OutputBuffers,
    exit_code: Option<u32>,
}

// The raw wait handle is only touched from the supervising thread.
unsafe impl Send for Subprocess {}

impl Subprocess {
    fn start(ioport: HANDLE, id: u64, command: &str, use_console: bool) -> Result<Subprocess> {
        let mut startup: STARTUPINFOA = unsafe { mem::zeroed() };
        startup.cb = mem::size_of::<STARTUPINFOA>() as u32;

        let mut stdout_pipe = None;
        let mut stderr_pipe = None;
        // Handles referenced by `startup`; they close when this frame
        // returns, after the child holds its own references.
        let mut child_handles: Vec<OwnedHandle> = Vec::new();

        if !use_console {
            let pid = unsafe { GetCurrentProcessId() };
            let (out_pipe, out_child) = OutputPipe::new(
                ioport,
                completion_key(id, StreamId::Stdout),
                &format!(r"\\.\pipe\jobcrew_pid{}_sp{}_out", pid, id),
            )
            .map_err(Error::Spawn)?;
            let (err_pipe, err_child) = OutputPipe::new(
                ioport,
                completion_key(id, StreamId::Stderr),
                &format!(r"\\.\pipe\jobcrew_pid{}_sp{}_err", pid, id),
            )
            .map_err(Error::Spawn)?;

            let nul = open_nul().map_err(Error::Spawn)?;
            startup.dwFlags = STARTF_USESTDHANDLES;
            startup.hStdInput = nul.as_raw_handle() as HANDLE;
            startup.hStdOutput = out_child.as_raw_handle() as HANDLE;
            startup.hStdError = err_child.as_raw_handle() as HANDLE;
            child_handles.push(nul);
            child_handles.push(out_child);
            child_handles.push(err_child);

            stdout_pipe = Some(out_pipe);
            stderr_pipe = Some(err_pipe);
        }

        let mut cmdline: Vec<u8> = command.as_bytes().to_vec();
        cmdline.push(0);

        let mut info: PROCESS_INFORMATION = unsafe { mem::zeroed() };
        // Non-console children get their own process group so the
        // supervisor can deliver a group break on teardown.
        let flags = if use_console { 0 } else { CREATE_NEW_PROCESS_GROUP };
        let created = unsafe {
            CreateProcessA(
                ptr::null(),
                cmdline.as_mut_ptr(),
                ptr::null(),
                ptr::null(),
                TRUE,
                flags,
                ptr::null(),
                ptr::null(),
                &startup,
                &mut info,
            )
        };

        if created == 0 {
            let error = unsafe { GetLastError() };
            if error == ERROR_FILE_NOT_FOUND {
                // A missing program is an ordinary build failure, not
                // a supervisor failure: report it as an already
                // finished subprocess with the message on stderr.
                let mut sub = Subprocess {
                    id,
                    use_console,
                    pid: 0,
                    child: None,
                    exit_wait: None,
                    stdout_pipe: None,
                    stderr_pipe: None,
                    output: OutputBuffers::default(),
                    exit_code: Some(1),
                };
                sub.output.append(
                    StreamId::Stderr,
                    b"CreateProcess failed: The system cannot find the file specified.\n",
                );
                return Ok(sub);
            }
            let err = io::Error::from_raw_os_error(error as i32);
            if error == ERROR_INVALID_PARAMETER {
                let hint = if command.starts_with(char::is_whitespace) {
                    "; the command starts with whitespace"
                } else if command.len() > 0x7000 {
                    "; is the command line too long?"
                } else {
                    ""
                };
                return Err(Error::Spawn(io::Error::new(
                    err.kind(),
                    format!("CreateProcess failed{}: {}", hint, err),
                )));
            }
            return Err(Error::Spawn(err));
        }

        unsafe {
            CloseHandle(info.hThread);
        }
        let child = unsafe { OwnedHandle::from_raw_handle(info.hProcess as _) };
        debug!("spawned subprocess {} (pid {}): {}", id, info.dwProcessId, command);

        let mut sub = Subprocess {
            id,
            use_console,
            pid: info.dwProcessId,
            child: Some(child),
            exit_wait: None,
            stdout_pipe,
            stderr_pipe,
            output: OutputBuffers::default(),
            exit_code: None,
        };

        // Every child's exit is posted through the port, so a
        // subprocess is never reported done before its exit status has
        // been recorded.
        let mut wait: HANDLE = 0 as HANDLE;
        let registered = unsafe {
            RegisterWaitForSingleObject(
                &mut wait,
                sub.child.as_ref().unwrap().as_raw_handle() as HANDLE,
                Some(notify_child_exit),
                completion_key(id, StreamId::Stdout) as *const core::ffi::c_void,
                INFINITE,
                WT_EXECUTEONLYONCE,
            )
        };
        if registered == 0 {
            return Err(Error::Spawn(io::Error::last_os_error()));
        }
        sub.exit_wait = Some(wait);

        Ok(sub)
    }

    /// Stable identity of this subprocess within its set.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this child shares the supervisor's console.
    pub fn use_console(&self) -> bool {
        self.use_console
    }

    /// Everything the child wrote to its stdout.
    pub fn stdout(&self) -> &[u8] {
        self.output.stdout()
    }

    /// Everything the child wrote to its stderr.
    pub fn stderr(&self) -> &[u8] {
        self.output.stderr()
    }

    /// Both streams interleaved in arrival order.
    pub fn combined_output(&self) -> &[u8] {
        self.output.combined()
    }

    /// No more output can arrive and the exit status has been
    /// observed. Console children have no streams, so for them this is
    /// purely the exit status.
    pub fn done(&self) -> bool {
        self.stdout_pipe.is_none() && self.stderr_pipe.is_none() && self.exit_code.is_some()
    }

    /// Waits for the child if needed and reports its final status.
    pub fn finish(&mut self) -> Result<ExitStatus> {
        if self.exit_code.is_none() {
            let child = match self.child.as_ref() {
                Some(child) => child,
                None => {
                    debug_assert!(false, "finish on a subprocess that never started");
                    return Ok(ExitStatus::Failure(-1));
                }
            };
            unsafe {
                WaitForSingleObject(child.as_raw_handle() as HANDLE, INFINITE);
            }
            let mut code: u32 = 0;
            if unsafe { GetExitCodeProcess(child.as_raw_handle() as HANDLE, &mut code) } == 0 {
                return Err(Error::RuntimeIo(io::Error::last_os_error()));
            }
            self.exit_code = Some(code);
        }
        self.release_child();

        Ok(match self.exit_code.unwrap() {
            0 => ExitStatus::Success,
            code if code == STATUS_CONTROL_C_EXIT as u32 => ExitStatus::Interrupted,
            code => ExitStatus::Failure(code as i32),
        })
    }

    /// Consumes one completion on `which`: the connect handshake, a
    /// chunk of output, or a broken pipe marking the stream closed.
    /// `bytes` is the transfer count reported with the completion.
    fn on_pipe_ready(&mut self, which: StreamId, bytes: usize) -> io::Result<()> {
        let pipe_slot = match which {
            StreamId::Stdout => &mut self.stdout_pipe,
            StreamId::Stderr => &mut self.stderr_pipe,
        };
        let pipe = match pipe_slot.as_mut() {
            Some(pipe) => pipe,
            None => return Ok(()),
        };

        if pipe.is_reading && bytes > 0 {
            self.output.append(which, &pipe.buf[..bytes]);
        }

        *pipe.overlapped = unsafe { mem::zeroed() };
        pipe.is_reading = true;
        let mut read: u32 = 0;
        let ok = unsafe {
            ReadFile(
                pipe.pipe.as_raw_handle() as HANDLE,
                pipe.buf.as_mut_ptr(),
                pipe.buf.len() as u32,
                &mut read,
                &mut *pipe.overlapped,
            )
        };
        if ok == 0 {
            match unsafe { GetLastError() } {
                ERROR_BROKEN_PIPE => {
                    *pipe_slot = None;
                    return Ok(());
                }
                ERROR_IO_PENDING => {}
                error => return Err(io::Error::from_raw_os_error(error as i32)),
            }
        }
        // Any bytes a synchronous completion produced come back
        // through the port; they are picked up on the next turn.
        Ok(())
    }

    /// Records the exit of a console child reported by its wait.
    fn on_child_exited(&mut self) -> io::Result<()> {
        let child = match self.child.as_ref() {
            Some(child) => child,
            None => return Ok(()),
        };
        let mut code: u32 = 0;
        if unsafe { GetExitCodeProcess(child.as_raw_handle() as HANDLE, &mut code) } == 0 {
            return Err(io::Error::last_os_error());
        }
        debug!("subprocess {} (pid {}) exited with {}", self.id, self.pid, code);
        self.exit_code = Some(code);
        Ok(())
    }

    fn release_child(&mut self) {
        if let Some(wait) = self.exit_wait.take() {
            unsafe {
                UnregisterWait(wait);
            }
        }
        self.child = None;
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            if let Some(child) = self.child.as_ref() {
                unsafe {
                    WaitForSingleObject(child.as_raw_handle() as HANDLE, INFINITE);
                }
            }
        }
        self.release_child();
    }
}

/// Event loop supervising a set of subprocesses through one I/O
/// completion port. Construction installs the process-wide console
/// ctrl handler; only one set may exist at a time.
pub struct SubprocessSet {
    ioport: OwnedHandle,
    running: Vec<Subprocess>,
    finished: VecDeque<Subprocess>,
    next_id: u64,
}

impl SubprocessSet {
    /// Creates the completion port and installs the ctrl handler.
    pub fn new() -> Result<SubprocessSet> {
        if SUPERVISOR_LIVE.swap(true, Ordering::SeqCst) {
            return Err(Error::SupervisorExists);
        }
        INTERRUPT_CAUSE.store(0, Ordering::Relaxed);

        let port =
            unsafe { CreateIoCompletionPort(INVALID_HANDLE_VALUE, 0 as HANDLE, 0, 1) };
        if port == 0 as HANDLE {
            let err = io::Error::last_os_error();
            SUPERVISOR_LIVE.store(false, Ordering::SeqCst);
            return Err(Error::RuntimeIo(err));
        }
        let ioport = unsafe { OwnedHandle::from_raw_handle(port as _) };
        IOPORT.store(port as isize, Ordering::Relaxed);

        if unsafe { SetConsoleCtrlHandler(Some(notify_interrupted), TRUE) } == 0 {
            let err = io::Error::last_os_error();
            IOPORT.store(0, Ordering::Relaxed);
            SUPERVISOR_LIVE.store(false, Ordering::SeqCst);
            return Err(Error::RuntimeIo(err));
        }

        Ok(SubprocessSet {
            ioport,
            running: Vec::new(),
            finished: VecDeque::new(),
            next_id: 0,
        })
    }

    /// Launches `command` and returns its id.
    ///
    /// A missing program lands directly in the finished queue with an
    /// explanatory stderr buffer rather than failing the supervisor.
    pub fn add(&mut self, command: &str, use_console: bool) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        let sub = Subprocess::start(
            self.ioport.as_raw_handle() as HANDLE,
            id,
            command,
            use_console,
        )?;
        if sub.done() {
            self.finished.push_back(sub);
        } else {
            self.running.push(sub);
        }
        Ok(id)
    }

    /// Blocks on the completion port until a pipe completes, a console
    /// child exits, or a ctrl event arrives. Returns `true` only for
    /// the ctrl event.
    pub fn do_work(&mut self) -> Result<bool> {
        let mut bytes: u32 = 0;
        let mut key: usize = 0;
        let mut overlapped: *mut OVERLAPPED = ptr::null_mut();

        let ok = unsafe {
            GetQueuedCompletionStatus(
                self.ioport.as_raw_handle() as HANDLE,
                &mut bytes,
                &mut key,
                &mut overlapped,
                INFINITE,
            )
        };
        if ok == 0 {
            let error = unsafe { GetLastError() };
            // A broken pipe surfaces as a failed completion for the
            // pipe's key; it is handled below like any other.
            if error != ERROR_BROKEN_PIPE {
                return Err(Error::RuntimeIo(io::Error::from_raw_os_error(error as i32)));
            }
        }

        if key == INTERRUPT_KEY {
            return Ok(true);
        }

        let (id, which) = decode_key(key);
        if let Some(i) = self.running.iter().position(|s| s.id == id) {
            if overlapped.is_null() {
                self.running[i].on_child_exited().map_err(Error::RuntimeIo)?;
            } else if ok == 0 {
                // The failed completion was the broken pipe: close the
                // stream.
                match which {
                    StreamId::Stdout => self.running[i].stdout_pipe = None,
                    StreamId::Stderr => self.running[i].stderr_pipe = None,
                }
            } else {
                self.running[i]
                    .on_pipe_ready(which, bytes as usize)
                    .map_err(Error::RuntimeIo)?;
            }
            if self.running[i].done() {
                let sub = self.running.remove(i);
                self.finished.push_back(sub);
            }
        }

        Ok(false)
    }

    /// Pops the subprocess that finished longest ago, if any.
    pub fn next_finished(&mut self) -> Option<Subprocess> {
        self.finished.pop_front()
    }

    /// The subprocesses still being supervised, oldest first.
    pub fn running(&self) -> &[Subprocess] {
        &self.running
    }

    /// The ctrl event that interrupted the last wait, if any.
    pub fn interrupted_signal(&self) -> Option<i32> {
        match INTERRUPT_CAUSE.load(Ordering::Relaxed) {
            0 => None,
            cause => Some(cause),
        }
    }

    /// Breaks every running non-console child's process group and
    /// discards it. Output still in flight is dropped.
    pub fn clear(&mut self) {
        for sub in &self.running {
            if !sub.use_console && sub.exit_code.is_none() {
                if unsafe { GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, sub.pid) } == 0 {
                    warn!(
                        "failed to break subprocess {} (pid {}): {}",
                        sub.id,
                        sub.pid,
                        io::Error::last_os_error()
                    );
                }
            }
        }
        self.running.clear();
    }
}

impl Drop for SubprocessSet {
    fn drop(&mut self) {
        self.clear();
        unsafe {
            SetConsoleCtrlHandler(Some(notify_interrupted), 0);
        }
        IOPORT.store(0, Ordering::Relaxed);
        SUPERVISOR_LIVE.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for SubprocessSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubprocessSet")
            .field("running", &self.running)
            .field("finished", &self.finished)
            .field("next_id", &self.next_id)
            .finish()
    }
}

fn open_nul() -> io::Result<OwnedHandle> {
    let inherit = SECURITY_ATTRIBUTES {
        nLength: mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: ptr::null_mut(),
        bInheritHandle: TRUE,
    };
    let handle = unsafe {
        CreateFileA(
            b"NUL\0".as_ptr(),
            GENERIC_READ,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            &inherit,
            OPEN_EXISTING,
            0,
            0 as HANDLE,
        )
    };
    if handle == INVALID_HANDLE_VALUE {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { OwnedHandle::from_raw_handle(handle as _) })
}
