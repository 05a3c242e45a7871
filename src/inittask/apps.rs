//! Local application hosting
//!
//! The master (and any Linux-hosted) enclave runs applications as OS
//! subprocesses spawned from the init task, with stdout piped back through
//! the event loop. Exit events flip the application row and raise an
//! application event.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::io::{IntoRawFd, RawFd};
use std::process::{Child, Command, Stdio};

use hobbes_core::{AppId, AppState, EventMask};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};

use super::{FdSource, InitTask};
use crate::error::{HobbesError, Result};
use crate::notifier::notify;
use crate::spec::AppSpec;

#[derive(Default)]
pub(crate) struct AppTable {
    apps: HashMap<AppId, LocalApp>,
}

struct LocalApp {
    child: Child,
    stdout_fd: RawFd,
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL)
        .map_err(|e| HobbesError::transport(format!("fcntl failed: {}", e)))?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags))
        .map_err(|e| HobbesError::transport(format!("fcntl failed: {}", e)))?;
    Ok(())
}

impl InitTask {
    /// Spawn an application process described by a launch spec.
    ///
    /// The child gets the process identity contract in its environment and
    /// its stdout wired into the event loop.
    pub(crate) fn launch_local_app(&mut self, spec: &AppSpec) -> Result<()> {
        let app_id = spec
            .app_id
            .ok_or_else(|| HobbesError::invalid("app spec carries no app id"))?;
        let name = spec.name.as_deref().unwrap_or(&spec.path);

        log::info!(
            "Launching app {} (id={}) in enclave {}",
            name,
            app_id,
            self.enclave_id
        );

        let mut command = Command::new(&spec.path);
        if let Some(argv) = &spec.argv {
            command.args(argv.split_whitespace());
        }
        if let Some(envp) = &spec.envp {
            for pair in envp.split_whitespace() {
                if let Some((key, value)) = pair.split_once('=') {
                    command.env(key, value);
                }
            }
        }
        command
            .env(hobbes_core::ENV_ENCLAVE_ID, self.enclave_id.to_string())
            .env(hobbes_core::ENV_APP_ID, app_id.to_string())
            .env(hobbes_core::ENV_PROCESS_ID, app_id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped());

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                self.registry.set_app_state(app_id, AppState::Error)?;
                notify(&self.registry, EventMask::APPLICATION);
                return Err(HobbesError::child_failure(format!(
                    "could not launch {}: {}",
                    spec.path, e
                )));
            }
        };

        let stdout_fd = child
            .stdout
            .take()
            .expect("stdout was requested piped")
            .into_raw_fd();
        set_nonblocking(stdout_fd)?;

        self.fd_sources
            .insert(stdout_fd, FdSource::AppStdout(app_id));
        self.apps.apps.insert(app_id, LocalApp { child, stdout_fd });

        self.registry.set_app_state(app_id, AppState::Running)?;
        notify(&self.registry, EventMask::APPLICATION);
        Ok(())
    }

    /// Forward buffered child output; a closed pipe means the child is
    /// done and gets reaped.
    pub(crate) fn handle_app_stdout(&mut self, app_id: AppId, fd: RawFd) -> Result<()> {
        let mut eof = false;
        let mut buf = [0u8; 1024];

        loop {
            match nix::unistd::read(fd, &mut buf) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => {
                    let mut out = std::io::stdout().lock();
                    let _ = out.write_all(&buf[..n]);
                    let _ = out.flush();
                }
                Err(Errno::EAGAIN) => break,
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    log::warn!("Reading app {} output failed: {}", app_id, e);
                    eof = true;
                    break;
                }
            }
        }

        if eof {
            self.reap_local_app(app_id, fd)?;
        }
        Ok(())
    }

    fn reap_local_app(&mut self, app_id: AppId, fd: RawFd) -> Result<()> {
        self.fd_sources.remove(&fd);
        let _ = nix::unistd::close(fd);

        if let Some(mut app) = self.apps.apps.remove(&app_id) {
            let state = match app.child.wait() {
                Ok(status) if status.success() => AppState::Stopped,
                Ok(_) => AppState::Crashed,
                Err(e) => {
                    log::warn!("Could not collect app {}: {}", app_id, e);
                    AppState::Crashed
                }
            };
            log::info!("App {} exited ({})", app_id, state);
            self.registry.set_app_state(app_id, state)?;
            notify(&self.registry, EventMask::APPLICATION);
        }
        Ok(())
    }

    /// Kill a hosted application outright.
    pub(crate) fn kill_local_app(&mut self, app_id: AppId) -> Result<()> {
        let mut app = self
            .apps
            .apps
            .remove(&app_id)
            .ok_or_else(|| HobbesError::not_found(format!("app {} is not hosted here", app_id)))?;

        self.fd_sources.remove(&app.stdout_fd);
        let _ = nix::unistd::close(app.stdout_fd);

        if let Err(e) = app.child.kill() {
            log::warn!("Could not kill app {}: {}", app_id, e);
        }
        app.child
            .wait()
            .map_err(|e| HobbesError::child_failure(format!("could not collect app: {}", e)))?;

        // Killed on request is an orderly stop, not a crash.
        self.registry.set_app_state(app_id, AppState::Stopped)?;
        notify(&self.registry, EventMask::APPLICATION);
        Ok(())
    }
}
