use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, Stdio};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use libc::c_int;
use log::{debug, warn};

use super::{ExitStatus, OutputBuffers, StreamId};
use crate::error::{Error, Result};

/// Signal number of the pending interruption, or 0.
static INTERRUPT_CAUSE: AtomicI32 = AtomicI32::new(0);
/// Set by the SIGCHLD handler, drained by the event loop's reap pass.
static CHILD_PENDING: AtomicBool = AtomicBool::new(false);
/// Signal handler state is process-wide, so at most one supervisor may
/// exist at a time.
static SUPERVISOR_LIVE: AtomicBool = AtomicBool::new(false);
/// Write end of the live supervisor's wake pipe, or -1.
///
/// A process-directed signal may be delivered on any thread of the
/// host process, not just the one sitting in the wait; the handler
/// writes one byte here so the event loop wakes no matter where it
/// ran.
static WAKE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

const HANDLED_SIGNALS: [c_int; 4] = [libc::SIGINT, libc::SIGTERM, libc::SIGHUP, libc::SIGCHLD];

extern "C" fn on_signal(sig: c_int) {
    if sig == libc::SIGCHLD {
        CHILD_PENDING.store(true, Ordering::Relaxed);
    } else {
        INTERRUPT_CAUSE.store(sig, Ordering::Relaxed);
    }
    // write(2) is async-signal-safe; a full pipe already holds a wake.
    let fd = WAKE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        unsafe {
            libc::write(fd, [0u8].as_ptr() as *const libc::c_void, 1);
        }
    }
}

fn interrupt_pending() -> bool {
    INTERRUPT_CAUSE.load(Ordering::Relaxed) != 0
}

/// A single supervised child process.
///
/// Lives inside a [`SubprocessSet`] until it is done, then in the
/// set's finished queue until the caller pops it with
/// [`SubprocessSet::next_finished`].
#[derive(Debug)]
pub struct Subprocess {
    id: u64,
    use_console: bool,
    pid: libc::pid_t,
    child: Option<Child>,
    stdout_pipe: Option<File>,
    stderr_pipe: Option<File>,
    output: OutputBuffers,
    exit_status: Option<std::process::ExitStatus>,
}

impl Subprocess {
    fn start(id: u64, command: &str, use_console: bool) -> io::Result<Subprocess> {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(command);

        let mut stdout_pipe = None;
        let mut stderr_pipe = None;
        if !use_console {
            let (out_read, out_write) = create_pipe()?;
            let (err_read, err_write) = create_pipe()?;
            cmd.stdin(Stdio::null())
                .stdout(Stdio::from(out_write))
                .stderr(Stdio::from(err_write));
            stdout_pipe = Some(out_read);
            stderr_pipe = Some(err_read);
        }

        unsafe {
            cmd.pre_exec(move || {
                // The supervisor keeps its signals blocked outside the
                // wait; the child must not inherit that mask.
                let mut empty: libc::sigset_t = mem::zeroed();
                libc::sigemptyset(&mut empty);
                libc::sigprocmask(libc::SIG_SETMASK, &empty, ptr::null_mut());

                // Non-console children get their own process group:
                // a terminal interrupt aimed at the supervisor must
                // not race-kill them, and teardown can signal the
                // whole subtree at once. Console children stay in our
                // group and share the terminal.
                if !use_console && libc::setpgid(0, 0) < 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        let pid = child.id() as libc::pid_t;
        debug!("spawned subprocess {} (pid {}): {}", id, pid, command);

        Ok(Subprocess {
            id,
            use_console,
            pid,
            child: Some(child),
            stdout_pipe,
            stderr_pipe,
            output: OutputBuffers::default(),
            exit_status: None,
        })
    }

    /// Stable identity of this subprocess within its set.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether this child shares the supervisor's terminal.
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

    /// No more output can arrive and the exit status is known.
    ///
    /// Console children have no streams, so for them this is purely
    /// the exit status; it is observed by the supervisor's reap pass.
    pub fn done(&self) -> bool {
        self.stdout_pipe.is_none() && self.stderr_pipe.is_none() && self.exit_status.is_some()
    }

    /// Waits for the child if it has not been reaped yet and reports
    /// its final status.
    pub fn finish(&mut self) -> Result<ExitStatus> {
        let status = match self.exit_status {
            Some(status) => status,
            None => match self.child.as_mut() {
                Some(child) => {
                    let status = child.wait().map_err(Error::RuntimeIo)?;
                    self.exit_status = Some(status);
                    status
                }
                None => {
                    debug_assert!(false, "finish on a subprocess that never started");
                    return Ok(ExitStatus::Failure(-1));
                }
            },
        };
        Ok(translate_status(status))
    }

    /// Reads whatever is available on `which`; EOF closes the stream.
    fn on_pipe_ready(&mut self, which: StreamId) -> io::Result<()> {
        let pipe = match which {
            StreamId::Stdout => &mut self.stdout_pipe,
            StreamId::Stderr => &mut self.stderr_pipe,
        };
        let mut buf = [0u8; 4096];
        loop {
            let file = match pipe.as_mut() {
                Some(file) => file,
                None => return Ok(()),
            };
            match file.read(&mut buf) {
                Ok(0) => {
                    *pipe = None;
                    return Ok(());
                }
                Ok(n) => {
                    self.output.append(which, &buf[..n]);
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    *pipe = None;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Non-blocking wait; records the exit status if the child is gone.
    fn try_reap(&mut self) -> io::Result<()> {
        if self.exit_status.is_some() {
            return Ok(());
        }
        if let Some(child) = self.child.as_mut() {
            if let Some(status) = child.try_wait()? {
                debug!("reaped subprocess {} (pid {}): {}", self.id, self.pid, status);
                self.exit_status = Some(status);
            }
        }
        Ok(())
    }
}

impl Drop for Subprocess {
    fn drop(&mut self) {
        // Never leave a zombie behind: a dropped subprocess that was
        // not reaped is waited out here, exactly once.
        if self.exit_status.is_none() {
            if let Some(child) = self.child.as_mut() {
                let _ = child.wait();
            }
        }
    }
}

fn translate_status(status: std::process::ExitStatus) -> ExitStatus {
    if let Some(code) = status.code() {
        if code == 0 {
            ExitStatus::Success
        } else {
            ExitStatus::Failure(code)
        }
    } else if let Some(sig) = status.signal() {
        if sig == libc::SIGINT || sig == libc::SIGTERM || sig == libc::SIGHUP {
            ExitStatus::Interrupted
        } else {
            // Shell convention for signal deaths.
            ExitStatus::Failure(128 + sig)
        }
    } else {
        ExitStatus::Failure(-1)
    }
}

/// Event loop supervising a set of subprocesses.
///
/// Construction installs process-wide handlers for SIGINT, SIGTERM,
/// SIGHUP and SIGCHLD and blocks those signals outside the wait, so
/// they are only ever delivered inside `ppoll`. The previous handler
/// dispositions are restored on drop. Only one set may exist at a
/// time.
pub struct SubprocessSet {
    running: Vec<Subprocess>,
    finished: VecDeque<Subprocess>,
    next_id: u64,
    wake_read: File,
    wake_write: File,
    old_mask: libc::sigset_t,
    old_actions: [libc::sigaction; 4],
}

impl SubprocessSet {
    /// Installs the signal plumbing and returns an empty set.
    pub fn new() -> Result<SubprocessSet> {
        if SUPERVISOR_LIVE.swap(true, Ordering::SeqCst) {
            return Err(Error::SupervisorExists);
        }
        INTERRUPT_CAUSE.store(0, Ordering::Relaxed);
        CHILD_PENDING.store(false, Ordering::Relaxed);

        let (wake_read, wake_write) = match Self::new_wake_pipe() {
            Ok(pipe) => pipe,
            Err(err) => {
                SUPERVISOR_LIVE.store(false, Ordering::SeqCst);
                return Err(Error::RuntimeIo(err));
            }
        };
        WAKE_WRITE_FD.store(wake_write.as_raw_fd(), Ordering::Relaxed);

        unsafe {
            let mut blocked: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut blocked);
            for sig in &HANDLED_SIGNALS {
                libc::sigaddset(&mut blocked, *sig);
            }
            let mut old_mask: libc::sigset_t = mem::zeroed();
            if libc::sigprocmask(libc::SIG_BLOCK, &blocked, &mut old_mask) < 0 {
                let err = io::Error::last_os_error();
                WAKE_WRITE_FD.store(-1, Ordering::Relaxed);
                SUPERVISOR_LIVE.store(false, Ordering::SeqCst);
                return Err(Error::RuntimeIo(err));
            }

            let mut action: libc::sigaction = mem::zeroed();
            let handler: extern "C" fn(c_int) = on_signal;
            action.sa_sigaction = handler as usize;
            libc::sigemptyset(&mut action.sa_mask);

            let mut old_actions = [mem::zeroed::<libc::sigaction>(); 4];
            for (i, sig) in HANDLED_SIGNALS.iter().enumerate() {
                if libc::sigaction(*sig, &action, &mut old_actions[i]) < 0 {
                    let err = io::Error::last_os_error();
                    for j in 0..i {
                        libc::sigaction(HANDLED_SIGNALS[j], &old_actions[j], ptr::null_mut());
                    }
                    libc::sigprocmask(libc::SIG_SETMASK, &old_mask, ptr::null_mut());
                    WAKE_WRITE_FD.store(-1, Ordering::Relaxed);
                    SUPERVISOR_LIVE.store(false, Ordering::SeqCst);
                    return Err(Error::RuntimeIo(err));
                }
            }

            Ok(SubprocessSet {
                running: Vec::new(),
                finished: VecDeque::new(),
                next_id: 0,
                wake_read,
                wake_write,
                old_mask,
                old_actions,
            })
        }
    }

    /// Both ends non-blocking: the handler must never stall on a full
    /// pipe and the drain must never stall on an empty one.
    fn new_wake_pipe() -> io::Result<(File, File)> {
        let (read, write) = create_pipe()?;
        for file in [&read, &write] {
            let flags = cvt(unsafe { libc::fcntl(file.as_raw_fd(), libc::F_GETFL) })?;
            cvt(unsafe {
                libc::fcntl(file.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK)
            })?;
        }
        Ok((read, write))
    }

    /// Launches `command` under `/bin/sh -c` and returns its id.
    ///
    /// The subprocess is owned by the set; watch for its id from
    /// [`SubprocessSet::next_finished`].
    pub fn add(&mut self, command: &str, use_console: bool) -> Result<u64> {
        let id = self.next_id;
        self.next_id += 1;
        let sub = Subprocess::start(id, command, use_console).map_err(Error::Spawn)?;
        if sub.done() {
            self.finished.push_back(sub);
        } else {
            self.running.push(sub);
        }
        Ok(id)
    }

    /// Blocks until a pipe has data or closed, a child exited, or an
    /// interrupt arrived.
    ///
    /// Returns `true` when woken by an interrupt, in which case no
    /// subprocess progress is reported and the caller should tear the
    /// build down; `false` otherwise.
    pub fn do_work(&mut self) -> Result<bool> {
        // Slot 0 is the wake pipe; `sources` maps the rest.
        let mut fds: Vec<libc::pollfd> = vec![libc::pollfd {
            fd: self.wake_read.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        }];
        let mut sources: Vec<(usize, StreamId)> = Vec::new();
        for (i, sub) in self.running.iter().enumerate() {
            if let Some(pipe) = &sub.stdout_pipe {
                fds.push(libc::pollfd {
                    fd: pipe.as_raw_fd(),
                    events: libc::POLLIN | libc::POLLPRI,
                    revents: 0,
                });
                sources.push((i, StreamId::Stdout));
            }
            if let Some(pipe) = &sub.stderr_pipe {
                fds.push(libc::pollfd {
                    fd: pipe.as_raw_fd(),
                    events: libc::POLLIN | libc::POLLPRI,
                    revents: 0,
                });
                sources.push((i, StreamId::Stderr));
            }
        }

        INTERRUPT_CAUSE.store(0, Ordering::Relaxed);

        // On this thread the handled signals are only unblocked for
        // the duration of the wait; a handler run on any other thread
        // of the process reaches us through the wake pipe instead.
        let ret = wait_for_events(&mut fds, &self.old_mask);
        if ret == -1 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::RuntimeIo(err));
            }
            // A handler ran during the wait; the revents are
            // meaningless. A SIGCHLD wake still has to reap, or a
            // console child could never complete.
            self.reap_pending_children()?;
            self.collect_done();
            return Ok(interrupt_pending());
        }

        if fds[0].revents != 0 {
            self.drain_wake_pipe();
        }

        // Signals that arrived while blocked outside the wait are
        // still pending; do not let busy pipes starve them.
        handle_pending_interruption();
        if interrupt_pending() {
            return Ok(true);
        }

        for (k, pfd) in fds.iter().enumerate().skip(1) {
            if pfd.revents != 0 {
                let (i, which) = sources[k - 1];
                self.running[i]
                    .on_pipe_ready(which)
                    .map_err(Error::RuntimeIo)?;
            }
        }

        self.reap_pending_children()?;
        self.collect_done();
        Ok(false)
    }

    /// Pops the subprocess that finished longest ago, if any.
    ///
    /// Subprocesses come out in the order they became done, not the
    /// order their children exited. The caller takes ownership.
    pub fn next_finished(&mut self) -> Option<Subprocess> {
        self.finished.pop_front()
    }

    /// The subprocesses still being supervised, oldest first.
    pub fn running(&self) -> &[Subprocess] {
        &self.running
    }

    /// The signal that interrupted the last wait, if any.
    pub fn interrupted_signal(&self) -> Option<i32> {
        match INTERRUPT_CAUSE.load(Ordering::Relaxed) {
            0 => None,
            sig => Some(sig),
        }
    }

    /// Kills every running non-console child and discards it.
    ///
    /// Console children share our process group and already received
    /// the terminal's interrupt; everyone else gets SIGTERM delivered
    /// to their process group. Output still in flight is dropped.
    pub fn clear(&mut self) {
        for sub in &self.running {
            if !sub.use_console && sub.exit_status.is_none() {
                unsafe {
                    libc::kill(-sub.pid, libc::SIGTERM);
                }
            }
        }
        // Dropping each subprocess waits out the child it was just
        // signalled.
        self.running.clear();
    }

    fn drain_wake_pipe(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.wake_read).read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => return,
            }
        }
    }

    fn reap_pending_children(&mut self) -> Result<()> {
        if !CHILD_PENDING.swap(false, Ordering::Relaxed) {
            return Ok(());
        }
        for sub in &mut self.running {
            sub.try_reap().map_err(Error::RuntimeIo)?;
        }
        Ok(())
    }

    /// Moves every subprocess that just became done into the finished
    /// queue, preserving the order in which they got there.
    fn collect_done(&mut self) {
        let mut i = 0;
        while i < self.running.len() {
            if self.running[i].done() {
                let sub = self.running.remove(i);
                self.finished.push_back(sub);
            } else {
                i += 1;
            }
        }
    }
}

impl Drop for SubprocessSet {
    fn drop(&mut self) {
        self.clear();
        WAKE_WRITE_FD.store(-1, Ordering::Relaxed);
        unsafe {
            for (i, sig) in HANDLED_SIGNALS.iter().enumerate() {
                libc::sigaction(*sig, &self.old_actions[i], ptr::null_mut());
            }
            libc::sigprocmask(libc::SIG_SETMASK, &self.old_mask, ptr::null_mut());
        }
        SUPERVISOR_LIVE.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for SubprocessSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubprocessSet")
            .field("running", &self.running)
            .field("finished", &self.finished)
            .field("next_id", &self.next_id)
            .field(
                "wake_pipe",
                &(self.wake_read.as_raw_fd(), self.wake_write.as_raw_fd()),
            )
            .finish()
    }
}

/// Records interruptions (and child exits) that are pending-blocked
/// rather than delivered, so a steady stream of pipe events cannot
/// starve them.
fn handle_pending_interruption() {
    let mut pending: libc::sigset_t = unsafe { mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut pending);
        if libc::sigpending(&mut pending) < 0 {
            warn!("sigpending failed: {}", io::Error::last_os_error());
            return;
        }
    }
    for sig in &[libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
        if unsafe { libc::sigismember(&pending, *sig) } == 1 {
            INTERRUPT_CAUSE.store(*sig, Ordering::Relaxed);
            return;
        }
    }
    if unsafe { libc::sigismember(&pending, libc::SIGCHLD) } == 1 {
        CHILD_PENDING.store(true, Ordering::Relaxed);
    }
}

/// Waits with `mask` applied atomically for the duration, so the
/// handled signals are only ever delivered inside the wait.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
))]
fn wait_for_events(fds: &mut [libc::pollfd], mask: &libc::sigset_t) -> c_int {
    unsafe { libc::ppoll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, ptr::null(), mask) }
}

/// `pselect` rendition of the same wait for platforms without `ppoll`.
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd"
)))]
fn wait_for_events(fds: &mut [libc::pollfd], mask: &libc::sigset_t) -> c_int {
    unsafe {
        let mut read_set: libc::fd_set = mem::zeroed();
        libc::FD_ZERO(&mut read_set);
        let mut nfds = 0;
        for pfd in fds.iter() {
            libc::FD_SET(pfd.fd, &mut read_set);
            nfds = nfds.max(pfd.fd + 1);
        }

        let ret = libc::pselect(
            nfds,
            &mut read_set,
            ptr::null_mut(),
            ptr::null_mut(),
            ptr::null(),
            mask,
        );
        if ret > 0 {
            for pfd in fds.iter_mut() {
                pfd.revents = if libc::FD_ISSET(pfd.fd, &mut read_set) {
                    libc::POLLIN
                } else {
                    0
                };
            }
        }
        ret
    }
}

/// Close-on-exec pipe; the write end loses the flag when it is dup'ed
/// onto the child's stdio.
fn create_pipe() -> io::Result<(File, File)> {
    let mut fds = [0 as c_int; 2];
    #[cfg(target_os = "linux")]
    cvt(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    #[cfg(not(target_os = "linux"))]
    {
        cvt(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        cvt(unsafe { libc::fcntl(fds[0], libc::F_SETFD, libc::FD_CLOEXEC) })?;
        cvt(unsafe { libc::fcntl(fds[1], libc::F_SETFD, libc::FD_CLOEXEC) })?;
    }
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

fn cvt(t: c_int) -> io::Result<c_int> {
    if t == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(t)
    }
}
