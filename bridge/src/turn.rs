//! The turn driver: one prompt in, one `codex exec` process, a stream of
//! events out.

use std::io;
use std::path::Path;
use std::process::ExitStatus;
use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::classifier::LineRules;
use crate::classifier::OutputClassifier;
use crate::classifier::StderrDecoder;
use crate::classifier::classify_stderr;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::error::Result;
use crate::events::BridgeEvent;
use crate::events::EventSink;
use crate::launcher::LaunchOptions;
use crate::launcher::LaunchedProcess;
use crate::launcher::ProcessLauncher;
use crate::launcher::TurnOptions;
use crate::launcher::check_working_dir;
use crate::launcher::clean_working_dir;
use crate::registry::KillSignal;
use crate::registry::ProcessHandle;
use crate::registry::ProcessRegistry;
use crate::session::SessionBridge;
use crate::session::SessionStore;
use crate::session::unix_millis;
use crate::temp_resources::TempResources;

const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnRequest {
    pub prompt: String,
    #[serde(default)]
    pub options: TurnOptions,
}

/// Result of a turn whose process ran to exit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TurnOutcome {
    pub session_id: String,
    pub is_new_session: bool,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub response: String,
}

impl TurnOutcome {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Owns everything shared between turns: configuration, compiled line
/// rules, the process registry and the session store.
pub struct Bridge {
    config: BridgeConfig,
    launcher: ProcessLauncher,
    rules: Arc<LineRules>,
    registry: Arc<ProcessRegistry>,
    store: Arc<dyn SessionStore>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, store: Arc<dyn SessionStore>) -> Result<Self> {
        let rules = Arc::new(LineRules::new()?);
        let registry = Arc::new(ProcessRegistry::new(config.abort_grace()));
        Ok(Self {
            launcher: ProcessLauncher::new(&config),
            config,
            rules,
            registry,
            store,
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn abort(&self, session_id: &str) -> bool {
        self.registry.abort(session_id)
    }

    pub fn abort_all(&self) -> usize {
        self.registry.abort_all()
    }

    /// Runs one turn to completion, streaming events into `events`.
    ///
    /// Launch failures and timeouts are reported both as an `error` event and
    /// as `Err`. A non-zero exit is a normal [`TurnOutcome`].
    pub async fn run_turn(
        &self,
        request: TurnRequest,
        events: EventSink,
    ) -> Result<TurnOutcome> {
        let TurnRequest {
            prompt,
            mut options,
        } = request;

        let cwd = match clean_working_dir(options.cwd.as_deref())
            .and_then(|cwd| check_working_dir(&cwd).map(|()| cwd))
        {
            Ok(cwd) => cwd,
            Err(err) => {
                warn!("{err}");
                events.send(BridgeEvent::from_error(&err)).await;
                return Err(err);
            }
        };

        let images = std::mem::take(&mut options.images);
        let temp = TempResources::prepare(cwd.clone(), images).await;
        let mut launch_options = LaunchOptions::resolve(&options, cwd.clone(), &self.config);
        launch_options.attachment_paths = temp.files().to_vec();
        launch_options.temp_dir = temp.dir_path().map(Path::to_path_buf);

        let requested = options
            .session_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty());
        let provisional_key = match requested {
            Some(id) => id.to_string(),
            None => unix_millis().to_string(),
        };

        let launched = match self
            .launcher
            .launch(&prompt, &launch_options, &self.registry, &provisional_key)
            .await
        {
            Ok(launched) => launched,
            Err(err) => {
                temp.release();
                events.send(BridgeEvent::from_error(&err)).await;
                return Err(err);
            }
        };
        let registration = Registration {
            registry: Arc::clone(&self.registry),
            handle: launched.handle.clone(),
        };

        let sessions = SessionBridge::new(Arc::clone(&self.store), events.clone());
        let ticket = sessions
            .begin(requested, &cwd, &prompt, &self.registry, &provisional_key)
            .await;
        info!(
            session_id = %ticket.session_id,
            is_new_session = ticket.is_new_session,
            pid = ?registration.handle.pid(),
            "codex turn started"
        );

        let mut classifier = OutputClassifier::new(
            Arc::clone(&self.rules),
            &prompt,
            self.config.flush_threshold_bytes,
        );
        let (status, timed_out) = self.drive(launched, &mut classifier, &events).await;

        events.send_all(classifier.finish()).await;
        drop(registration);
        let response = classifier.into_full_response();
        sessions.persist_response(&ticket, &response).await;
        temp.release();

        let status = match status {
            Ok(status) => status,
            Err(err) => {
                let err = BridgeError::process_runtime(err);
                error!(session_id = %ticket.session_id, "{err}");
                events.send(BridgeEvent::from_error(&err)).await;
                return Err(err);
            }
        };

        let exit_code = status.code();
        info!(session_id = %ticket.session_id, ?exit_code, "codex turn finished");
        sessions.complete(&ticket, exit_code).await;

        if timed_out {
            return Err(BridgeError::Timeout);
        }
        Ok(TurnOutcome {
            session_id: ticket.session_id,
            is_new_session: ticket.is_new_session,
            exit_code,
            response,
        })
    }

    /// Pumps the child's output until it exits. Returns the exit status and
    /// whether the startup watchdog fired.
    async fn drive(
        &self,
        launched: LaunchedProcess,
        classifier: &mut OutputClassifier,
        events: &EventSink,
    ) -> (io::Result<ExitStatus>, bool) {
        let LaunchedProcess {
            mut child,
            handle,
            mut control,
            key,
        } = launched;

        let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take())
        else {
            control.mark_exited();
            let _ = child.start_kill();
            return (
                Err(io::Error::other("stdout/stderr pipes were unexpectedly not available")),
                false,
            );
        };

        let mut stdout_buf = vec![0u8; READ_CHUNK_SIZE];
        let mut stderr_buf = vec![0u8; READ_CHUNK_SIZE];
        let mut stderr_text = StderrDecoder::default();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut signals_open = true;

        let mut flush = tokio::time::interval(self.config.flush_interval());
        flush.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let startup_deadline = Instant::now() + self.config.startup_timeout();
        let mut received_output = false;
        let mut timed_out = false;

        let status = loop {
            tokio::select! {
                read = stdout.read(&mut stdout_buf), if stdout_open => match read {
                    Ok(0) => stdout_open = false,
                    Ok(n) => {
                        received_output = true;
                        events.send_all(classifier.push_chunk(&stdout_buf[..n])).await;
                    }
                    Err(err) => {
                        warn!(key, "failed to read codex stdout: {err}");
                        stdout_open = false;
                    }
                },
                read = stderr.read(&mut stderr_buf), if stderr_open => match read {
                    Ok(0) => {
                        stderr_open = false;
                        if let Some(event) = classify_stderr(&stderr_text.finish()) {
                            events.send(event).await;
                        }
                    }
                    Ok(n) => {
                        let text = stderr_text.decode(&stderr_buf[..n]);
                        if let Some(event) = classify_stderr(&text) {
                            events.send(event).await;
                        }
                    }
                    Err(err) => {
                        warn!(key, "failed to read codex stderr: {err}");
                        stderr_open = false;
                    }
                },
                _ = flush.tick() => {
                    if let Some(event) = classifier.flush_due() {
                        events.send(event).await;
                    }
                }
                signal = control.recv(), if signals_open => match signal {
                    Some(signal) => deliver_signal(&mut child, signal),
                    None => signals_open = false,
                },
                _ = tokio::time::sleep_until(startup_deadline), if !received_output && !timed_out => {
                    timed_out = true;
                    let err = BridgeError::Timeout;
                    error!(key, timeout = ?self.config.startup_timeout(), "no output from codex");
                    events.send(BridgeEvent::from_error(&err)).await;
                    handle.terminate(self.config.abort_grace());
                }
                status = child.wait(), if !stdout_open && !stderr_open => break status,
            }
        };

        control.mark_exited();
        (status, timed_out)
    }
}

/// Releases a turn's registry entry when the turn finishes or its future is
/// dropped, whichever key the entry ended up under.
struct Registration {
    registry: Arc<ProcessRegistry>,
    handle: ProcessHandle,
}

impl Drop for Registration {
    fn drop(&mut self) {
        if self.registry.release(&self.handle) {
            debug!(pid = ?self.handle.pid(), "released process record");
        }
    }
}

fn deliver_signal(child: &mut Child, signal: KillSignal) {
    match signal {
        KillSignal::Terminate => send_terminate(child),
        KillSignal::Kill => {
            if let Err(err) = child.start_kill() {
                debug!("failed to kill codex process: {err}");
            }
        }
    }
}

#[cfg(unix)]
fn send_terminate(child: &mut Child) {
    let Some(pid) = child.id() else {
        return;
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        debug!(pid, "SIGTERM failed: {}", io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn send_terminate(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        debug!("failed to terminate codex process: {err}");
    }
}
