//! Launch a program suspended so tracing can be set up before it runs
//!
//! On Unix the child stops itself with SIGSTOP right before exec; resuming
//! sends SIGCONT.

use crate::error::{Result, TraceError};
use chrono::{DateTime, Utc};
use std::env;
use std::path::{Path, PathBuf};

/// A launched process that has not yet executed its first instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspendedProcess {
    pub pid: u32,
    pub program_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

pub trait ProcessLauncher {
    fn launch_suspended(&self, program: &str, args: &[String]) -> Result<SuspendedProcess>;

    fn resume(&self, process: &SuspendedProcess) -> Result<()>;

    /// Kill a process that will not be resumed and reap it
    fn terminate(&self, process: &SuspendedProcess) -> Result<()>;

    /// Reap the process if it has exited; `None` while it still runs
    fn try_wait(&self, process: &SuspendedProcess) -> Result<Option<i32>>;
}

/// Resolve `program` the way a shell would: paths are taken as-is, bare
/// names are searched in `PATH`
pub fn resolve_program(program: &str) -> Result<PathBuf> {
    let not_found = || TraceError::launch(program, "no such file in PATH");
    if program.is_empty() {
        return Err(TraceError::launch(program, "program name is empty"));
    }

    if program.contains('/') {
        let path = Path::new(program);
        return if path.is_file() {
            Ok(path.to_path_buf())
        } else {
            Err(not_found())
        };
    }

    let search = env::var_os("PATH").ok_or_else(not_found)?;
    env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
        .ok_or_else(not_found)
}

#[cfg(unix)]
pub use self::unix::UnixLauncher;

#[cfg(unix)]
mod unix {
    use super::{resolve_program, ProcessLauncher, SuspendedProcess};
    use crate::error::{Result, TraceError};
    use chrono::Utc;
    use nix::sys::signal::{self, Signal};
    use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
    use nix::unistd::{fork, ForkResult, Pid};
    use std::os::unix::process::CommandExt;
    use std::process::Command;
    use tracing::info;

    #[derive(Debug, Default, Clone, Copy)]
    pub struct UnixLauncher;

    impl UnixLauncher {
        pub fn new() -> Self {
            Self
        }

        /// Block until the process exits; returns its exit code (128 + signal
        /// when killed)
        pub fn wait(&self, process: &SuspendedProcess) -> Result<i32> {
            loop {
                if let Some(code) = exit_code(waitpid(pid_of(process), None))? {
                    return Ok(code);
                }
            }
        }
    }

    fn pid_of(process: &SuspendedProcess) -> Pid {
        Pid::from_raw(process.pid as i32)
    }

    fn exit_code(status: nix::Result<WaitStatus>) -> Result<Option<i32>> {
        match status.map_err(|e| TraceError::backend("waitpid", e))? {
            WaitStatus::Exited(_, code) => Ok(Some(code)),
            WaitStatus::Signaled(_, sig, _) => Ok(Some(128 + sig as i32)),
            _ => Ok(None),
        }
    }

    impl ProcessLauncher for UnixLauncher {
        fn launch_suspended(&self, program: &str, args: &[String]) -> Result<SuspendedProcess> {
            let path = resolve_program(program)?;

            // SAFETY: the child only raises a signal and execs
            match unsafe { fork() }.map_err(|e| TraceError::launch(program, e))? {
                ForkResult::Child => {
                    let _ = signal::raise(Signal::SIGSTOP);
                    let err = Command::new(&path).args(args).exec();
                    eprintln!("Failed to exec {}: {}", path.display(), err);
                    std::process::exit(127);
                }
                ForkResult::Parent { child } => {
                    match waitpid(child, Some(WaitPidFlag::WUNTRACED))
                        .map_err(|e| TraceError::launch(program, e))?
                    {
                        WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
                        other => {
                            return Err(TraceError::launch(
                                program,
                                format!("child did not stop before exec: {:?}", other),
                            ))
                        }
                    }

                    let process = SuspendedProcess {
                        pid: child.as_raw() as u32,
                        program_path: path,
                        started_at: Utc::now(),
                    };
                    info!(pid = process.pid, program = %process.program_path.display(), "launched suspended");
                    Ok(process)
                }
            }
        }

        fn resume(&self, process: &SuspendedProcess) -> Result<()> {
            signal::kill(pid_of(process), Signal::SIGCONT)
                .map_err(|e| TraceError::backend("resume", e))?;
            info!(pid = process.pid, "resumed");
            Ok(())
        }

        fn terminate(&self, process: &SuspendedProcess) -> Result<()> {
            signal::kill(pid_of(process), Signal::SIGKILL)
                .map_err(|e| TraceError::backend("terminate", e))?;
            let code = self.wait(process)?;
            info!(pid = process.pid, code, "terminated");
            Ok(())
        }

        fn try_wait(&self, process: &SuspendedProcess) -> Result<Option<i32>> {
            exit_code(waitpid(pid_of(process), Some(WaitPidFlag::WNOHANG)))
        }
    }
}
