use crate::audit::AuditWriter;
use crate::config::ExecConfig;
use crate::executor::{ChunkSink, CommandRunner, RunSpec, SshExecutor, StreamRunner};
use crate::inventory::{MachineDirectory, SharedKeySource};
use crate::pool::ConnectionPool;
use fleet_types::{AuditRecord, AuthMode, ExecError, ExecResult, ExecTask, Machine};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(30);

type ResultSink = Arc<dyn Fn(ExecResult) + Send + Sync>;

/// Turns one task into N concurrent executions under a bounded worker
/// ceiling, delivering results as a completed collection or
/// progressively, and managing named cancellable jobs.
pub struct ExecService {
    directory: Arc<dyn MachineDirectory>,
    runner: Arc<dyn CommandRunner>,
    streamer: Option<Arc<dyn StreamRunner>>,
    audit: Option<Arc<AuditWriter>>,
    shared_key: Option<Arc<dyn SharedKeySource>>,
    max_parallel: usize,
    default_timeout: Duration,
    // Entry present iff the job's batch is still running.
    jobs: Mutex<HashMap<String, CancellationToken>>,
    job_seq: AtomicU64,
}

impl ExecService {
    /// `max_parallel == 0` leaves batch concurrency unbounded.
    pub fn new(
        directory: Arc<dyn MachineDirectory>,
        runner: Arc<dyn CommandRunner>,
        max_parallel: usize,
    ) -> Self {
        Self {
            directory,
            runner,
            streamer: None,
            audit: None,
            shared_key: None,
            max_parallel,
            default_timeout: DEFAULT_TASK_TIMEOUT,
            jobs: Mutex::new(HashMap::new()),
            job_seq: AtomicU64::new(0),
        }
    }

    /// Like [`ExecService::new`] for an executor that also carries the
    /// streaming capability. The capability is fixed here, never
    /// re-discovered per call.
    pub fn with_streaming<R>(
        directory: Arc<dyn MachineDirectory>,
        runner: Arc<R>,
        max_parallel: usize,
    ) -> Self
    where
        R: StreamRunner + 'static,
    {
        let mut service = Self::new(directory, Arc::clone(&runner) as Arc<dyn CommandRunner>, max_parallel);
        service.streamer = Some(runner);
        service
    }

    /// Wires the full SSH stack from configuration: connection pool,
    /// streaming-capable executor with its session gate, and the
    /// orchestrator ceiling.
    pub fn from_config(directory: Arc<dyn MachineDirectory>, config: &ExecConfig) -> Self {
        let pool = Arc::new(ConnectionPool::new(Duration::from_secs(
            config.connect_timeout_secs.max(1),
        )));
        let executor = Arc::new(SshExecutor::new(pool, config.max_sessions));
        let mut service = Self::with_streaming(directory, executor, config.max_parallel);
        service.default_timeout = Duration::from_secs(config.default_timeout_secs.max(1));
        service
    }

    pub fn audit_writer(mut self, writer: Arc<AuditWriter>) -> Self {
        self.audit = Some(writer);
        self
    }

    pub fn shared_key_source(mut self, source: Arc<dyn SharedKeySource>) -> Self {
        self.shared_key = Some(source);
        self
    }

    /// Submit-and-wait: exactly one result per requested target id, in
    /// no guaranteed order.
    pub async fn batch_exec(&self, task: ExecTask) -> Result<Vec<ExecResult>, ExecError> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: ResultSink = Arc::new(move |result| {
            let _ = tx.send(result);
        });
        self.stream_inner(CancellationToken::new(), task, sink).await?;
        let mut results = Vec::new();
        while let Ok(result) = rx.try_recv() {
            results.push(result);
        }
        Ok(results)
    }

    /// Submit-and-stream: `on_result` fires once per target as each
    /// execution completes.
    pub async fn stream_exec(
        &self,
        task: ExecTask,
        on_result: impl Fn(ExecResult) + Send + Sync + 'static,
    ) -> Result<(), ExecError> {
        self.stream_inner(CancellationToken::new(), task, Arc::new(on_result))
            .await
    }

    /// [`ExecService::stream_exec`] under an external cancellation
    /// token.
    pub async fn stream_exec_cancellable(
        &self,
        cancel: CancellationToken,
        task: ExecTask,
        on_result: impl Fn(ExecResult) + Send + Sync + 'static,
    ) -> Result<(), ExecError> {
        self.stream_inner(cancel, task, Arc::new(on_result)).await
    }

    /// Launches a named cancellable streaming batch and returns its job
    /// id (generated when `job_id` is empty). The registry entry is
    /// removed only once the batch has fully drained, so
    /// [`ExecService::has_job`] turning false is the authoritative
    /// finished signal.
    pub fn start_batch(
        self: &Arc<Self>,
        job_id: Option<String>,
        task: ExecTask,
        on_result: impl Fn(ExecResult) + Send + Sync + 'static,
    ) -> String {
        let job_id = job_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| self.next_job_id());
        let cancel = CancellationToken::new();
        self.jobs
            .lock()
            .expect("job registry lock")
            .insert(job_id.clone(), cancel.clone());
        let service = Arc::clone(self);
        let id = job_id.clone();
        tokio::spawn(async move {
            if let Err(err) = service
                .stream_inner(cancel, task, Arc::new(on_result))
                .await
            {
                tracing::warn!(job = %id, error = %err, "batch job failed");
            }
            service.jobs.lock().expect("job registry lock").remove(&id);
        });
        job_id
    }

    /// Cooperative cancel; does not wait for the batch to drain.
    /// Callers needing drain completion poll [`ExecService::has_job`].
    pub fn cancel(&self, job_id: &str) -> bool {
        let jobs = self.jobs.lock().expect("job registry lock");
        match jobs.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn has_job(&self, job_id: &str) -> bool {
        self.jobs
            .lock()
            .expect("job registry lock")
            .contains_key(job_id)
    }

    /// Runs one machine with progressive chunk delivery where the
    /// executor supports it, falling back to the buffered run.
    pub async fn single_stream(
        &self,
        cancel: &CancellationToken,
        machine: &Machine,
        task: &ExecTask,
        on_chunk: impl Fn(&[u8], bool) + Send + Sync,
    ) -> ExecResult {
        let timeout = self.effective_timeout(task);
        let (secret, used_shared_key) = self.resolve_credential(machine, task);
        let spec = build_spec(machine, task, secret, timeout);
        let started = unix_ms();
        let output = match &self.streamer {
            Some(streamer) => {
                let sink: ChunkSink<'_> = &on_chunk;
                streamer.run_streamed(cancel, &spec, sink).await
            }
            None => self.runner.run(cancel, &spec).await,
        };
        let finished = unix_ms();
        let result = ExecResult {
            machine_id: machine.id,
            mgmt_addr: machine.mgmt_addr.clone(),
            ssh_addr: machine.ssh_addr.clone(),
            ssh_user: machine.ssh_user.clone(),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            error: output.error,
            used_shared_key,
        };
        if let Some(audit) = &self.audit {
            audit.submit(AuditRecord::from_result(
                &result,
                &task.command,
                started,
                finished,
            ));
        }
        result
    }

    async fn stream_inner(
        &self,
        cancel: CancellationToken,
        task: ExecTask,
        on_result: ResultSink,
    ) -> Result<(), ExecError> {
        if task.command.is_empty() {
            return Err(ExecError::EmptyCommand);
        }
        if task.machine_ids.is_empty() {
            return Err(ExecError::NoTargets);
        }
        let timeout = self.effective_timeout(&task);

        let machines = self
            .directory
            .resolve_by_ids(&task.machine_ids)
            .await
            .map_err(|err| ExecError::Resolution(err.to_string()))?;
        let by_id: HashMap<i64, Machine> = machines
            .into_iter()
            .map(|machine| (machine.id, machine))
            .collect();

        let limit = if task.parallel > 0 {
            task.parallel
        } else {
            self.max_parallel
        };
        let gate = (limit > 0).then(|| Arc::new(Semaphore::new(limit)));

        let mut handles = Vec::with_capacity(task.machine_ids.len());
        for id in &task.machine_ids {
            let Some(machine) = by_id.get(id).cloned() else {
                // Synthetic result; consumes no concurrency slot.
                (on_result.as_ref())(ExecResult::not_found(*id));
                continue;
            };
            let permit = match &gate {
                Some(gate) => Arc::clone(gate).acquire_owned().await.ok(),
                None => None,
            };
            let (secret, used_shared_key) = self.resolve_credential(&machine, &task);
            let spec = build_spec(&machine, &task, secret, timeout);
            let runner = Arc::clone(&self.runner);
            let audit = self.audit.clone();
            let on_result = Arc::clone(&on_result);
            let cancel = cancel.clone();
            let command = task.command.clone();
            handles.push(tokio::spawn(async move {
                let _permit = permit;
                let started = unix_ms();
                let output = runner.run(&cancel, &spec).await;
                let finished = unix_ms();
                let result = ExecResult {
                    machine_id: machine.id,
                    mgmt_addr: machine.mgmt_addr,
                    ssh_addr: machine.ssh_addr,
                    ssh_user: machine.ssh_user,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    exit_code: output.exit_code,
                    error: output.error,
                    used_shared_key,
                };
                let record = audit
                    .as_ref()
                    .map(|_| AuditRecord::from_result(&result, &command, started, finished));
                // Callback first, audit enqueue second.
                (on_result.as_ref())(result);
                if let (Some(audit), Some(record)) = (audit, record) {
                    audit.submit(record);
                }
            }));
        }

        for handle in handles {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "target execution task panicked");
            }
        }
        Ok(())
    }

    fn effective_timeout(&self, task: &ExecTask) -> Duration {
        if task.timeout_secs > 0 {
            Duration::from_secs(task.timeout_secs)
        } else {
            self.default_timeout
        }
    }

    /// Fresh per target on every invocation; secrets are never cached
    /// beyond the single execution.
    fn resolve_credential(&self, machine: &Machine, task: &ExecTask) -> (String, bool) {
        match task.auth_mode {
            AuthMode::Password => (task.password.clone().unwrap_or_default(), false),
            AuthMode::Key => {
                if let Some(key) = machine.ssh_key.as_deref().filter(|key| !key.is_empty()) {
                    return (key.to_string(), false);
                }
                if let Some(source) = &self.shared_key {
                    if let Some(key) = source.shared_key().filter(|key| !key.is_empty()) {
                        return (key, true);
                    }
                }
                (String::new(), false)
            }
        }
    }

    fn next_job_id(&self) -> String {
        // Millisecond timestamp plus a monotonic suffix; the counter
        // closes the collision window of a bare timestamp under rapid
        // concurrent starts.
        let seq = self.job_seq.fetch_add(1, Ordering::Relaxed);
        format!("{}-{:04}", unix_ms(), seq % 10_000)
    }
}

fn build_spec(machine: &Machine, task: &ExecTask, secret: String, timeout: Duration) -> RunSpec {
    RunSpec {
        user: machine.ssh_user.clone(),
        addr: machine.ssh_addr.clone(),
        auth_mode: task.auth_mode,
        secret,
        command: task.command.clone(),
        timeout,
    }
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RunOutput;
    use async_trait::async_trait;

    struct NullRunner;

    #[async_trait]
    impl CommandRunner for NullRunner {
        async fn run(&self, _cancel: &CancellationToken, _spec: &RunSpec) -> RunOutput {
            RunOutput::default()
        }
    }

    struct EmptyDirectory;

    #[async_trait]
    impl MachineDirectory for EmptyDirectory {
        async fn resolve_by_ids(&self, _ids: &[i64]) -> anyhow::Result<Vec<Machine>> {
            Ok(Vec::new())
        }
    }

    fn service() -> ExecService {
        ExecService::new(Arc::new(EmptyDirectory), Arc::new(NullRunner), 0)
    }

    #[tokio::test]
    async fn empty_command_rejected_before_dispatch() {
        let task = ExecTask {
            machine_ids: vec![1],
            ..ExecTask::default()
        };
        let err = service().batch_exec(task).await.unwrap_err();
        assert_eq!(err, ExecError::EmptyCommand);
    }

    #[tokio::test]
    async fn empty_targets_rejected_before_dispatch() {
        let task = ExecTask {
            command: "uptime".to_string(),
            ..ExecTask::default()
        };
        let err = service().batch_exec(task).await.unwrap_err();
        assert_eq!(err, ExecError::NoTargets);
    }

    #[test]
    fn job_ids_are_unique_under_rapid_generation() {
        let service = service();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            assert!(seen.insert(service.next_job_id()));
        }
    }

    #[test]
    fn shared_key_ignored_when_machine_has_its_own() {
        let service = service().shared_key_source(Arc::new(|| Some("shared".to_string())));
        let machine = Machine {
            id: 1,
            ssh_key: Some("own-key".to_string()),
            ..Machine::default()
        };
        let task = ExecTask::default();
        let (secret, used_shared) = service.resolve_credential(&machine, &task);
        assert_eq!(secret, "own-key");
        assert!(!used_shared);
    }

    #[test]
    fn password_mode_ignores_stored_key() {
        let service = service();
        let machine = Machine {
            id: 1,
            ssh_key: Some("own-key".to_string()),
            ..Machine::default()
        };
        let task = ExecTask {
            auth_mode: AuthMode::Password,
            password: Some("one-time".to_string()),
            ..ExecTask::default()
        };
        let (secret, used_shared) = service.resolve_credential(&machine, &task);
        assert_eq!(secret, "one-time");
        assert!(!used_shared);
    }
}
