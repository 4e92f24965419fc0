//! Process supervisor: exit-code relay, multi-waiter handshake,
//! and stdio/tty wiring. One [`ProcessHandle`] exists per running process,
//! whether a container's init process, an `exec`'d process, or an
//! external process tracked outside any container.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::oci;

/// A relay onto the process's controlling terminal, when it has one.
/// Resizes are applied via `TIOCSWINSZ` on the stored master fd.
pub struct TtyRelay {
    fd: std::os::unix::io::RawFd,
}

impl TtyRelay {
    pub fn new(fd: std::os::unix::io::RawFd) -> TtyRelay {
        TtyRelay { fd }
    }

    pub fn resize(&self, width: u16, height: u16) -> Result<(), ErrorKind> {
        let ws = libc::winsize {
            ws_row: height,
            ws_col: width,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: `fd` is a valid tty master fd owned by this relay for its lifetime.
        let rc = unsafe { libc::ioctl(self.fd, libc::TIOCSWINSZ, &ws) };
        if rc != 0 {
            return Err(ErrorKind::runtime(anyhow::anyhow!(
                "TIOCSWINSZ failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

/// Called once a process's waiters have fully drained, so the owner can
/// remove it from its table and ask the runtime to delete its state.
pub trait ProcessRemoveCallback: Send + Sync {
    fn on_removed(&self, pid: u32);
}

pub struct ProcessHandle {
    pub pid: u32,
    pub is_init: bool,
    pub spec: oci::Process,
    pub tty: Mutex<Option<TtyRelay>>,
    exit_code: Mutex<Option<i32>>,
    exit_notify: Notify,
    waiters: AtomicU32,
    cleanup_armed: AtomicBool,
    waiters_drained: Notify,
}

impl ProcessHandle {
    /// Spawns the background exit-wait and cleanup tasks and returns the
    /// handle. `runtime`/`container_id` are used to ask the OCI runtime for
    /// the exit status and, once cleanup is armed and all waiters have
    /// drained, to remove the process's runtime-side state.
    pub fn spawn(
        pid: u32,
        is_init: bool,
        spec: oci::Process,
        runtime: oci::Runtime,
        container_id: String,
        on_remove: Arc<dyn ProcessRemoveCallback>,
    ) -> Arc<ProcessHandle> {
        Self::spawn_with_exit_future(pid, is_init, spec, on_remove, async move {
            match runtime.wait(&container_id).await {
                Ok(code) => code,
                Err(e) => {
                    warn!(pid, error = %e, "failed to wait for process exit, treating as failure exit");
                    -1
                }
            }
        })
    }

    /// Spawns a process tracked outside any container ("external
    /// process"): the exit code comes directly from the child's own
    /// `wait()`, since there is no OCI runtime state to query.
    pub fn spawn_external(
        mut child: tokio::process::Child,
        spec: oci::Process,
        on_remove: Arc<dyn ProcessRemoveCallback>,
    ) -> Arc<ProcessHandle> {
        let pid = child.id().unwrap_or(0);
        Self::spawn_with_exit_future(pid, false, spec, on_remove, async move {
            match child.wait().await {
                Ok(status) => status.code().unwrap_or(-1),
                Err(e) => {
                    warn!(pid, error = %e, "failed to wait for external process exit, treating as failure exit");
                    -1
                }
            }
        })
    }

    fn spawn_with_exit_future<F>(
        pid: u32,
        is_init: bool,
        spec: oci::Process,
        on_remove: Arc<dyn ProcessRemoveCallback>,
        exit_future: F,
    ) -> Arc<ProcessHandle>
    where
        F: std::future::Future<Output = i32> + Send + 'static,
    {
        let handle = Arc::new(ProcessHandle {
            pid,
            is_init,
            spec,
            tty: Mutex::new(None),
            exit_code: Mutex::new(None),
            exit_notify: Notify::new(),
            waiters: AtomicU32::new(0),
            cleanup_armed: AtomicBool::new(false),
            waiters_drained: Notify::new(),
        });

        let exit_waiter = Arc::clone(&handle);
        tokio::spawn(async move {
            let code = exit_future.await;
            debug!(pid, code, "process exited");
            *exit_waiter.exit_code.lock().unwrap() = Some(code);
            exit_waiter.exit_notify.notify_waiters();
        });

        let cleanup = Arc::clone(&handle);
        tokio::spawn(async move {
            loop {
                if cleanup.cleanup_armed.load(Ordering::SeqCst) && cleanup.waiters.load(Ordering::SeqCst) == 0 {
                    break;
                }
                cleanup.waiters_drained.notified().await;
            }
            on_remove.on_removed(cleanup.pid);
        });

        handle
    }

    /// Registers a new waiter. Returns a channel that will carry the exit
    /// code exactly once, and a `done` sender the caller must signal to
    /// acknowledge receipt (or to cancel before the code arrives).
    pub fn wait(self: &Arc<Self>) -> (oneshot::Receiver<i32>, oneshot::Sender<()>) {
        self.waiters.fetch_add(1, Ordering::SeqCst);
        let (code_tx, code_rx) = oneshot::channel();
        let (done_tx, mut done_rx) = oneshot::channel::<()>();

        let this = Arc::clone(self);
        tokio::spawn(async move {
            // Register interest before checking state so a termination that
            // races with this call is never missed (tokio::sync::Notify's
            // documented safe pattern).
            let notified = this.exit_notify.notified();
            tokio::pin!(notified);

            let already = *this.exit_code.lock().unwrap();
            let code = match already {
                Some(c) => Some(c),
                None => {
                    tokio::select! {
                        _ = &mut notified => *this.exit_code.lock().unwrap(),
                        _ = &mut done_rx => {
                            this.waiters.fetch_sub(1, Ordering::SeqCst);
                            this.waiters_drained.notify_one();
                            return;
                        }
                    }
                }
            };

            if let Some(code) = code {
                let _ = code_tx.send(code);
                let _ = (&mut done_rx).await;
                let first = !this.cleanup_armed.swap(true, Ordering::SeqCst);
                if first {
                    debug!(pid = this.pid, "first waiter drained, cleanup armed");
                }
            }

            this.waiters.fetch_sub(1, Ordering::SeqCst);
            this.waiters_drained.notify_one();
        });

        (code_rx, done_tx)
    }

    pub fn signal(&self, signal: u32) -> Result<(), ErrorKind> {
        let sig = Signal::try_from(signal as i32)
            .map_err(|e| ErrorKind::invalid_arg(anyhow::anyhow!("unknown signal {signal}: {e}")))?;
        match kill(Pid::from_raw(self.pid as i32), sig) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => Err(ErrorKind::not_found(anyhow::anyhow!(
                "process {} not found",
                self.pid
            ))),
            Err(e) => Err(ErrorKind::runtime(anyhow::anyhow!("kill({}, {signal}): {e}", self.pid))),
        }
    }

    pub fn resize_console(&self, width: u16, height: u16) -> Result<(), ErrorKind> {
        let tty = self.tty.lock().unwrap();
        match tty.as_ref() {
            Some(t) => t.resize(width, height),
            None => Err(ErrorKind::invalid_arg(anyhow::anyhow!("process {} has no tty", self.pid))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Recorder {
        removed: Arc<AtomicUsize>,
    }

    impl ProcessRemoveCallback for Recorder {
        fn on_removed(&self, _pid: u32) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_spec() -> oci::Process {
        oci::Process {
            terminal: false,
            user: oci::User { uid: 0, gid: 0, username: None, additional_gids: vec![] },
            args: vec!["/bin/true".into()],
            env: vec![],
            cwd: "/".into(),
        }
    }

    #[tokio::test]
    async fn single_waiter_receives_exit_code() {
        let removed = Arc::new(AtomicUsize::new(0));
        let handle = ProcessHandle::spawn(
            1,
            true,
            test_spec(),
            oci::Runtime::new("/bin/false"),
            "c1".into(),
            Arc::new(Recorder { removed: Arc::clone(&removed) }),
        );

        // Directly latch the exit code as if the background wait task had
        // observed it, rather than relying on a real runtime binary.
        *handle.exit_code.lock().unwrap() = Some(0);
        handle.exit_notify.notify_waiters();

        let (code_rx, done_tx) = handle.wait();
        let code = code_rx.await.unwrap();
        assert_eq!(code, 0);
        done_tx.send(()).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn multiple_waiters_all_see_same_code() {
        let removed = Arc::new(AtomicUsize::new(0));
        let handle = ProcessHandle::spawn(
            2,
            false,
            test_spec(),
            oci::Runtime::new("/bin/false"),
            "c1".into(),
            Arc::new(Recorder { removed: Arc::clone(&removed) }),
        );

        *handle.exit_code.lock().unwrap() = Some(7);
        handle.exit_notify.notify_waiters();

        let (rx1, done1) = handle.wait();
        let (rx2, done2) = handle.wait();

        assert_eq!(rx1.await.unwrap(), 7);
        assert_eq!(rx2.await.unwrap(), 7);
        done1.send(()).unwrap();
        done2.send(()).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn signal_to_dead_pid_is_not_found() {
        let removed = Arc::new(AtomicUsize::new(0));
        let handle = ProcessHandle::spawn(
            0x7fff_fffe,
            false,
            test_spec(),
            oci::Runtime::new("/bin/false"),
            "c1".into(),
            Arc::new(Recorder { removed }),
        );
        let err = handle.signal(15).unwrap_err();
        assert_eq!(err.hresult(), crate::error::hresult::NOT_FOUND);
    }

    #[tokio::test]
    async fn external_process_exit_code_comes_from_the_child_itself() {
        let removed = Arc::new(AtomicUsize::new(0));
        let child = tokio::process::Command::new("/bin/true")
            .kill_on_drop(true)
            .spawn()
            .expect("spawning /bin/true");
        let handle = ProcessHandle::spawn_external(child, test_spec(), Arc::new(Recorder { removed: Arc::clone(&removed) }));

        let (code_rx, done_tx) = handle.wait();
        let code = code_rx.await.unwrap();
        assert_eq!(code, 0);
        done_tx.send(()).unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(removed.load(Ordering::SeqCst), 1);
    }
}
