use crate::pool::ConnectionPool;
use async_trait::async_trait;
use fleet_types::{AuthMode, ExecError};
use russh::ChannelMsg;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(30);

/// Everything one execution needs: endpoint, credential, command and
/// its deadline.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub user: String,
    pub addr: String,
    pub auth_mode: AuthMode,
    pub secret: String,
    pub command: String,
    pub timeout: Duration,
}

/// Captured outcome of one run. Output reflects everything read up to
/// completion or forced teardown.
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub error: Option<ExecError>,
}

impl RunOutput {
    pub(crate) fn failed(error: ExecError) -> Self {
        Self {
            exit_code: -1,
            error: Some(error),
            ..Self::default()
        }
    }
}

/// Synchronous per-chunk sink: `(bytes, is_stderr)`. Runs on the
/// reader's task, so it must return promptly.
pub type ChunkSink<'a> = &'a (dyn Fn(&[u8], bool) + Send + Sync);

/// Base capability: run one command over one pooled connection.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, cancel: &CancellationToken, spec: &RunSpec) -> RunOutput;
}

/// Optional capability: progressive chunk delivery on top of the base
/// run contract. Discovered at service construction, not per call.
#[async_trait]
pub trait StreamRunner: CommandRunner {
    async fn run_streamed(
        &self,
        cancel: &CancellationToken,
        spec: &RunSpec,
        on_chunk: ChunkSink<'_>,
    ) -> RunOutput;
}

/// Executes commands over pooled SSH sessions, optionally gated by a
/// process-wide cap on simultaneous sessions.
pub struct SshExecutor {
    pool: Arc<ConnectionPool>,
    gate: Option<Arc<Semaphore>>,
}

impl SshExecutor {
    /// `max_sessions == 0` leaves concurrency unbounded at this layer.
    pub fn new(pool: Arc<ConnectionPool>, max_sessions: usize) -> Self {
        let gate = (max_sessions > 0).then(|| Arc::new(Semaphore::new(max_sessions)));
        Self { pool, gate }
    }

    #[cfg(test)]
    fn session_permits(&self) -> Option<usize> {
        self.gate.as_ref().map(|gate| gate.available_permits())
    }

    async fn run_inner(
        &self,
        cancel: &CancellationToken,
        spec: &RunSpec,
        on_chunk: Option<ChunkSink<'_>>,
    ) -> RunOutput {
        if spec.user.is_empty() || spec.addr.is_empty() {
            return RunOutput::failed(ExecError::EmptyEndpoint);
        }
        if spec.command.is_empty() {
            return RunOutput::failed(ExecError::EmptyCommand);
        }
        let timeout = if spec.timeout.is_zero() {
            DEFAULT_RUN_TIMEOUT
        } else {
            spec.timeout
        };

        let _permit = match &self.gate {
            Some(gate) => Arc::clone(gate).acquire_owned().await.ok(),
            None => None,
        };

        let conn = match self
            .pool
            .acquire(&spec.user, &spec.addr, spec.auth_mode, &spec.secret)
            .await
        {
            Ok(conn) => conn,
            Err(err) => return RunOutput::failed(err),
        };

        let mut channel = match conn.handle.channel_open_session().await {
            Ok(channel) => channel,
            Err(err) => {
                self.pool.discard(&conn.fingerprint).await;
                return RunOutput::failed(ExecError::Transport(err.to_string()));
            }
        };
        if let Err(err) = channel.exec(true, spec.command.as_str()).await {
            self.pool.discard(&conn.fingerprint).await;
            return RunOutput::failed(ExecError::Transport(err.to_string()));
        }

        let mut capture = ChannelCapture::default();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                msg = channel.wait() => match msg {
                    Some(msg) => capture.absorb(msg, on_chunk),
                    None => break,
                },
                _ = &mut deadline => {
                    // Forced connection teardown is the only reliable
                    // way to unblock a hung remote command.
                    self.pool.discard(&conn.fingerprint).await;
                    return capture.timed_out();
                }
                _ = cancel.cancelled() => {
                    self.pool.discard(&conn.fingerprint).await;
                    return capture.timed_out();
                }
            }
        }

        if capture.exit_code.is_none() && capture.killed_by.is_none() {
            // Transport died before delivering a status.
            self.pool.discard(&conn.fingerprint).await;
        }
        capture.finish()
    }
}

/// Accumulates channel messages for one run. Only an explicit exit
/// status may read as a remote outcome; a channel that closes without
/// one (command killed by a signal, transport dropped mid-run) surfaces
/// as a transport failure with exit code -1.
#[derive(Default)]
struct ChannelCapture {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    exit_code: Option<i32>,
    killed_by: Option<String>,
}

impl ChannelCapture {
    fn absorb(&mut self, msg: ChannelMsg, on_chunk: Option<ChunkSink<'_>>) {
        match msg {
            ChannelMsg::Data { data } => {
                self.stdout.extend_from_slice(&data);
                if let Some(sink) = on_chunk {
                    sink(&data, false);
                }
            }
            ChannelMsg::ExtendedData { data, ext: 1 } => {
                self.stderr.extend_from_slice(&data);
                if let Some(sink) = on_chunk {
                    sink(&data, true);
                }
            }
            ChannelMsg::ExitStatus { exit_status } => {
                self.exit_code = Some(exit_status as i32);
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                self.killed_by = Some(format!("{signal_name:?}"));
            }
            _ => {}
        }
    }

    fn timed_out(self) -> RunOutput {
        RunOutput {
            stdout: String::from_utf8_lossy(&self.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&self.stderr).into_owned(),
            exit_code: -1,
            error: Some(ExecError::Timeout),
        }
    }

    fn finish(self) -> RunOutput {
        let stdout = String::from_utf8_lossy(&self.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&self.stderr).into_owned();
        match (self.exit_code, self.killed_by) {
            (Some(exit_code), _) => RunOutput {
                stdout,
                stderr,
                exit_code,
                error: None,
            },
            (None, Some(signal)) => RunOutput {
                stdout,
                stderr,
                exit_code: -1,
                error: Some(ExecError::Transport(format!(
                    "command terminated by signal {signal}"
                ))),
            },
            (None, None) => RunOutput {
                stdout,
                stderr,
                exit_code: -1,
                error: Some(ExecError::Transport(
                    "channel closed without exit status".to_string(),
                )),
            },
        }
    }
}

#[async_trait]
impl CommandRunner for SshExecutor {
    async fn run(&self, cancel: &CancellationToken, spec: &RunSpec) -> RunOutput {
        self.run_inner(cancel, spec, None).await
    }
}

#[async_trait]
impl StreamRunner for SshExecutor {
    async fn run_streamed(
        &self,
        cancel: &CancellationToken,
        spec: &RunSpec,
        on_chunk: ChunkSink<'_>,
    ) -> RunOutput {
        self.run_inner(cancel, spec, Some(on_chunk)).await
    }
}
