//! Main scheduler logic

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use gpulet_core::{
    AdmissionPolicy, DeviceSlot, GpuProbe, GpuletError, GpuletResult, SchedulerConfig, ScriptType,
    SubmitRequest, Task, TaskEvent, TaskEventKind, TaskStatus,
};
use gpulet_exec::{ExecRequest, Outcome, Supervise};
use gpulet_script::{classify, RequirementExtractor};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::allocator::GpuAllocator;

/// A running task and its cancellation handle
struct RunningTask {
    task: Task,
    cancel: CancellationToken,
}

/// Scheduler state behind one lock. Reservation and task bookkeeping always
/// change together under it, which is what keeps the ledger invariant intact.
struct SchedState {
    pending: VecDeque<Task>,
    running: HashMap<Uuid, RunningTask>,
    history: VecDeque<Task>,
    allocator: GpuAllocator,
    halted: bool,
}

impl SchedState {
    fn remember(&mut self, task: Task, limit: usize) {
        self.history.push_back(task);
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

/// Completion report from a supervisor
struct Completion {
    task_id: Uuid,
    outcome: Outcome,
}

/// What one admission pass achieved
enum Admission {
    /// A task was admitted; more may fit right now
    Admitted,
    /// Tasks are pending but none fits the free devices
    Blocked,
    /// The queue is empty
    Idle,
}

/// Aggregate view served by the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemStatus {
    /// Schedulable devices in the ledger
    pub total_gpus: usize,
    /// Devices currently free
    pub available_gpus: usize,
    /// Tasks waiting in the queue
    pub pending_tasks: usize,
    /// Tasks currently executing
    pub running_tasks: usize,
    /// Finished tasks retained in history
    pub finished_tasks: usize,
    /// Whether the scheduling loop is live
    pub scheduler_running: bool,
    /// Configured idle scan interval
    pub idle_interval_secs: u64,
    /// Configured retry scan interval
    pub retry_interval_secs: u64,
}

/// Scheduler coordinates task admission, device reservation and child
/// supervision.
///
/// One loop makes every admission decision; supervisors run concurrently and
/// report outcomes back over a channel. The device ledger is only ever
/// touched under the state lock.
pub struct Scheduler {
    config: SchedulerConfig,
    probe: Arc<dyn GpuProbe>,
    supervisor: Arc<dyn Supervise>,
    extractor: RequirementExtractor,
    state: RwLock<SchedState>,
    events: broadcast::Sender<TaskEvent>,
    completions: mpsc::UnboundedSender<Completion>,
    completion_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<Completion>>>,
    wake: Notify,
    shutdown: CancellationToken,
    started: AtomicBool,
    loop_handle: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    /// Probe the GPU inventory and create an idle scheduler; `start` launches
    /// the scheduling loop
    pub fn new(
        config: SchedulerConfig,
        probe: Arc<dyn GpuProbe>,
        supervisor: Arc<dyn Supervise>,
        events: broadcast::Sender<TaskEvent>,
    ) -> Self {
        let devices = match probe.probe() {
            Ok(devices) => devices,
            Err(e) => {
                warn!(error = %e, "GPU probe failed, starting with empty inventory");
                Vec::new()
            }
        };
        let allocator = GpuAllocator::new(devices);

        info!(
            gpus = allocator.total(),
            admission = ?config.admission,
            "Scheduler initialized"
        );

        let (completions, completion_rx) = mpsc::unbounded_channel();
        Self {
            config,
            probe,
            supervisor,
            extractor: RequirementExtractor::new(),
            state: RwLock::new(SchedState {
                pending: VecDeque::new(),
                running: HashMap::new(),
                history: VecDeque::new(),
                allocator,
                halted: false,
            }),
            events,
            completions,
            completion_rx: std::sync::Mutex::new(Some(completion_rx)),
            wake: Notify::new(),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            loop_handle: std::sync::Mutex::new(None),
        }
    }

    /// Launch the scheduling loop; double starts are ignored with a warning
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already started");
            return;
        }
        let rx = self
            .completion_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(rx) = rx else {
            error!("Completion receiver missing, refusing to start");
            return;
        };
        let scheduler = Arc::clone(self);
        let handle = tokio::spawn(async move { scheduler.run_loop(rx).await });
        *self
            .loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
    }

    /// Stop the loop and signal every running child to wind down
    pub async fn shutdown(&self) {
        info!("Scheduler shutting down");
        self.shutdown.cancel();
        {
            let state = self.state.read().await;
            for running in state.running.values() {
                running.cancel.cancel();
            }
        }
        let handle = self
            .loop_handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Analyze and enqueue a script.
    ///
    /// The script is read, classified and parsed for device requirements
    /// before it enters the queue. Unreadable scripts are still recorded, as
    /// tasks that are already failed, so the caller always gets an id to
    /// query.
    pub async fn submit(&self, request: SubmitRequest) -> Uuid {
        let timeout_secs = request
            .timeout_secs
            .unwrap_or(self.config.default_timeout_secs);

        match self.analyze(&request.script_path).await {
            Ok((script_type, preferred)) => {
                let requested = if preferred.is_empty() {
                    request.gpu_count.unwrap_or(0)
                } else {
                    // devices named in the script override the caller's count
                    preferred.len() as u32
                };
                let task = Task::new(
                    request.script_path,
                    script_type,
                    requested,
                    preferred,
                    timeout_secs,
                );
                let id = task.id;

                info!(
                    task_id = %id,
                    script = %task.script_path.display(),
                    script_type = %task.script_type,
                    gpus = requested,
                    "Task submitted"
                );
                self.emit(
                    &task,
                    TaskEventKind::Submitted {
                        requested_gpus: requested,
                    },
                );

                let mut state = self.state.write().await;
                if requested as usize > state.allocator.total() {
                    warn!(
                        task_id = %id,
                        requested,
                        total = state.allocator.total(),
                        "Task requests more devices than the host has and will wait indefinitely"
                    );
                }
                state.pending.push_back(task);
                drop(state);
                self.wake.notify_one();
                id
            }
            Err(e) => {
                let mut task = Task::new(
                    request.script_path,
                    ScriptType::Unknown,
                    0,
                    Vec::new(),
                    timeout_secs,
                );
                let id = task.id;
                warn!(task_id = %id, error = %e, "Submitted script is unreadable, failing task");
                self.emit(&task, TaskEventKind::Submitted { requested_gpus: 0 });
                task.error_message = Some(e.to_string());
                task.mark_finished(TaskStatus::Failed);
                self.emit(
                    &task,
                    TaskEventKind::ExecutionFailed {
                        exit_code: None,
                        error: e.to_string(),
                    },
                );
                let mut state = self.state.write().await;
                let limit = self.config.history_limit;
                state.remember(task, limit);
                id
            }
        }
    }

    /// Cancel a task; returns false when it is unknown or already terminal.
    ///
    /// A pending task leaves the queue immediately. A running task has its
    /// supervisor signalled; its devices come back only after the child is
    /// reaped and the completion arrives.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        let mut state = self.state.write().await;
        if let Some(position) = state.pending.iter().position(|t| t.id == task_id) {
            if let Some(mut task) = state.pending.remove(position) {
                info!(task_id = %task_id, "Pending task cancelled");
                task.mark_finished(TaskStatus::Cancelled);
                self.emit(&task, TaskEventKind::ExecutionCancelled);
                let limit = self.config.history_limit;
                state.remember(task, limit);
            }
            return true;
        }
        if let Some(running) = state.running.get(&task_id) {
            info!(task_id = %task_id, "Cancelling running task");
            running.cancel.cancel();
            return true;
        }
        false
    }

    /// Get a snapshot of one task, wherever it is in its lifecycle
    pub async fn get_status(&self, task_id: Uuid) -> Option<Task> {
        let state = self.state.read().await;
        state
            .running
            .get(&task_id)
            .map(|r| r.task.clone())
            .or_else(|| state.pending.iter().find(|t| t.id == task_id).cloned())
            .or_else(|| state.history.iter().find(|t| t.id == task_id).cloned())
    }

    /// List all known tasks in submission order, optionally filtered by status
    pub async fn list_tasks(&self, filter: Option<TaskStatus>) -> Vec<Task> {
        let state = self.state.read().await;
        let mut tasks: Vec<Task> = state
            .pending
            .iter()
            .chain(state.running.values().map(|r| &r.task))
            .chain(state.history.iter())
            .filter(|t| filter.map_or(true, |f| t.status == f))
            .cloned()
            .collect();
        tasks.sort_by_key(|t| t.submitted_at);
        tasks
    }

    /// Current view of the device ledger
    pub async fn gpu_snapshot(&self) -> Vec<DeviceSlot> {
        self.state.read().await.allocator.snapshot()
    }

    /// Aggregate counts for the status endpoint
    pub async fn system_status(&self) -> SystemStatus {
        let state = self.state.read().await;
        SystemStatus {
            total_gpus: state.allocator.total(),
            available_gpus: state.allocator.available(),
            pending_tasks: state.pending.len(),
            running_tasks: state.running.len(),
            finished_tasks: state.history.len(),
            scheduler_running: self.started.load(Ordering::SeqCst)
                && !state.halted
                && !self.shutdown.is_cancelled(),
            idle_interval_secs: self.config.idle_interval_secs,
            retry_interval_secs: self.config.retry_interval_secs,
        }
    }

    /// Re-probe the hardware and fold new devices into the ledger
    pub async fn reconcile_gpus(&self) -> GpuletResult<Vec<DeviceSlot>> {
        let devices = self.probe.probe()?;
        let mut state = self.state.write().await;
        state.allocator.reconcile(devices);
        let snapshot = state.allocator.snapshot();
        drop(state);
        self.wake.notify_one();
        Ok(snapshot)
    }

    /// Subscribe to task lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.events.subscribe()
    }

    async fn run_loop(self: Arc<Self>, mut completions: mpsc::UnboundedReceiver<Completion>) {
        info!(
            idle_interval_secs = self.config.idle_interval_secs,
            retry_interval_secs = self.config.retry_interval_secs,
            "Scheduler loop running"
        );
        loop {
            while let Ok(completion) = completions.try_recv() {
                self.finalize(completion).await;
            }

            if let Err(e) = self.verify_ledger().await {
                error!(error = %e, "Device ledger corrupted, scheduling halted");
                self.state.write().await.halted = true;
            }
            if self.state.read().await.halted {
                break;
            }

            let interval = match self.admit_next().await {
                Admission::Admitted => continue,
                Admission::Blocked => Duration::from_secs(self.config.retry_interval_secs),
                Admission::Idle => Duration::from_secs(self.config.idle_interval_secs),
            };

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                Some(completion) = completions.recv() => self.finalize(completion).await,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(interval) => {}
            }
        }
        info!("Scheduler loop stopped");
    }

    /// Admit the earliest pending task whose request fits the free devices.
    /// Reservation, queue removal and the running-map insert happen under one
    /// lock acquisition.
    async fn admit_next(&self) -> Admission {
        let mut state = self.state.write().await;
        if state.pending.is_empty() {
            return Admission::Idle;
        }

        let strict = self.config.admission == AdmissionPolicy::StrictFifo;
        let st = &mut *state;
        let mut chosen: Option<(usize, Vec<u32>)> = None;
        for (position, task) in st.pending.iter().enumerate() {
            match st
                .allocator
                .try_reserve(task.requested_gpus, &task.preferred_gpus, task.id)
            {
                Ok(devices) => {
                    chosen = Some((position, devices));
                    break;
                }
                Err(e) if e.is_backpressure() => {
                    if strict {
                        break;
                    }
                }
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "Reservation failed");
                    if strict {
                        break;
                    }
                }
            }
        }

        let Some((position, devices)) = chosen else {
            debug!(
                pending = state.pending.len(),
                available = state.allocator.available(),
                "No pending task fits the free devices"
            );
            return Admission::Blocked;
        };
        let mut task = match state.pending.remove(position) {
            Some(task) => task,
            None => {
                let _ = state.allocator.release(&devices);
                return Admission::Blocked;
            }
        };
        task.mark_running(devices.clone());
        let cancel = CancellationToken::new();
        state.running.insert(
            task.id,
            RunningTask {
                task: task.clone(),
                cancel: cancel.clone(),
            },
        );
        drop(state);

        info!(task_id = %task.id, devices = ?task.assigned_gpus, "Task admitted");
        self.emit(&task, TaskEventKind::GpuAssigned { devices });
        self.emit(&task, TaskEventKind::ExecutionStarted);
        self.spawn_supervisor(&task, cancel);
        Admission::Admitted
    }

    fn spawn_supervisor(&self, task: &Task, cancel: CancellationToken) {
        let supervisor = Arc::clone(&self.supervisor);
        let completions = self.completions.clone();
        let request = ExecRequest {
            task_id: task.id,
            script_path: task.script_path.clone(),
            script_type: task.script_type,
            devices: task.assigned_gpus.clone(),
            timeout_secs: task.timeout_secs,
        };
        tokio::spawn(async move {
            let task_id = request.task_id;
            let outcome = supervisor.run(request, cancel).await;
            if completions.send(Completion { task_id, outcome }).is_err() {
                warn!(task_id = %task_id, "Scheduler gone, dropping completion");
            }
        });
    }

    /// Fold one supervisor outcome into the records, releasing the devices
    /// before anything else can be admitted
    async fn finalize(&self, completion: Completion) {
        let mut state = self.state.write().await;
        let Some(running) = state.running.remove(&completion.task_id) else {
            warn!(task_id = %completion.task_id, "Completion for unknown task");
            return;
        };
        let mut task = running.task;
        let outcome = completion.outcome;

        let devices = task.assigned_gpus.clone();
        if !devices.is_empty() {
            if let Err(e) = state.allocator.release(&devices) {
                error!(task_id = %task.id, error = %e, "Release failed, scheduling halted");
                state.halted = true;
            }
        }

        task.exit_code = outcome.exit_code;
        task.output_head = outcome.output_head;
        task.error_message = outcome.error.clone();
        let status = if outcome.status.is_terminal() {
            outcome.status
        } else {
            warn!(
                task_id = %task.id,
                status = %outcome.status,
                "Supervisor reported a non-terminal status"
            );
            TaskStatus::Failed
        };
        task.mark_finished(status);

        info!(
            task_id = %task.id,
            status = %task.status,
            exit_code = ?task.exit_code,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Task finished"
        );
        let kind = match status {
            TaskStatus::Success => TaskEventKind::ExecutionSuccess {
                exit_code: outcome.exit_code.unwrap_or(0),
                elapsed_secs: outcome.elapsed.as_secs_f64(),
            },
            TaskStatus::Timeout => TaskEventKind::ExecutionTimeout {
                timeout_secs: task.timeout_secs,
            },
            TaskStatus::Cancelled => TaskEventKind::ExecutionCancelled,
            _ => TaskEventKind::ExecutionFailed {
                exit_code: outcome.exit_code,
                error: outcome
                    .error
                    .unwrap_or_else(|| "unknown failure".to_string()),
            },
        };
        self.emit(&task, kind);
        let limit = self.config.history_limit;
        state.remember(task, limit);
    }

    /// The busy set must exactly match the union of running tasks'
    /// assignments; anything else is ledger corruption
    async fn verify_ledger(&self) -> GpuletResult<()> {
        let state = self.state.read().await;
        let mut owned: Vec<u32> = Vec::new();
        for running in state.running.values() {
            for device in &running.task.assigned_gpus {
                if owned.contains(device) {
                    return Err(GpuletError::LedgerCorrupted(format!(
                        "device {device} assigned to two running tasks"
                    )));
                }
                owned.push(*device);
            }
        }
        owned.sort_unstable();
        let busy = state.allocator.busy_indices();
        if busy != owned {
            return Err(GpuletError::LedgerCorrupted(format!(
                "busy devices {busy:?} do not match running assignments {owned:?}"
            )));
        }
        Ok(())
    }

    async fn analyze(&self, path: &Path) -> GpuletResult<(ScriptType, Vec<u32>)> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    GpuletError::ScriptNotFound(path.display().to_string())
                }
                std::io::ErrorKind::PermissionDenied => {
                    GpuletError::PermissionDenied(path.display().to_string())
                }
                _ => GpuletError::Io(e),
            })?;
        let first_line = content.lines().next().unwrap_or("");
        let script_type = classify(path, first_line);
        let preferred = self.extractor.extract(script_type, &content);
        Ok((script_type, preferred))
    }

    fn emit(&self, task: &Task, kind: TaskEventKind) {
        let _ = self
            .events
            .send(TaskEvent::new(task.id, task.script_type, kind));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gpulet_core::{ExecConfig, StaticProbe};
    use gpulet_exec::ProcessSupervisor;
    use std::path::PathBuf;
    use std::time::Instant;

    /// Supervisor returning a scripted status after a delay, honoring
    /// cancellation
    struct MockSupervisor {
        status: TaskStatus,
        delay: Duration,
    }

    impl MockSupervisor {
        fn instant(status: TaskStatus) -> Arc<Self> {
            Arc::new(Self {
                status,
                delay: Duration::from_millis(0),
            })
        }

        fn slow(status: TaskStatus, delay: Duration) -> Arc<Self> {
            Arc::new(Self { status, delay })
        }
    }

    #[async_trait::async_trait]
    impl Supervise for MockSupervisor {
        async fn run(&self, _request: ExecRequest, cancel: CancellationToken) -> Outcome {
            let status = tokio::select! {
                _ = tokio::time::sleep(self.delay) => self.status,
                _ = cancel.cancelled() => TaskStatus::Cancelled,
            };
            Outcome {
                status,
                exit_code: if status == TaskStatus::Success {
                    Some(0)
                } else {
                    None
                },
                output_head: String::new(),
                elapsed: self.delay,
                error: None,
            }
        }
    }

    fn build_scheduler(gpus: u32, supervisor: Arc<dyn Supervise>) -> Arc<Scheduler> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Scheduler::new(
            SchedulerConfig::default(),
            Arc::new(StaticProbe::new(gpus)),
            supervisor,
            events,
        ))
    }

    fn write_script(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    async fn wait_for_status(
        scheduler: &Scheduler,
        task_id: Uuid,
        status: TaskStatus,
        deadline: Duration,
    ) -> Task {
        let started = Instant::now();
        loop {
            if let Some(task) = scheduler.get_status(task_id).await {
                if task.status == status {
                    return task;
                }
            }
            assert!(
                started.elapsed() < deadline,
                "task {task_id} did not reach {status} in time"
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    #[tokio::test]
    async fn test_submit_analyzes_python_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            &dir,
            "train.py",
            "import os\nos.environ['CUDA_VISIBLE_DEVICES'] = '0,1'\n",
        );
        let scheduler = build_scheduler(4, MockSupervisor::instant(TaskStatus::Success));
        let id = scheduler.submit(SubmitRequest::new(path)).await;

        let task = scheduler.get_status(id).await.unwrap();
        assert_eq!(task.script_type, ScriptType::Python);
        assert_eq!(task.requested_gpus, 2);
        assert_eq!(task.preferred_gpus, vec![0, 1]);
        assert_eq!(task.status, TaskStatus::Pending);
    }

    #[tokio::test]
    async fn test_extracted_devices_override_caller_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            &dir,
            "train.py",
            "os.environ['CUDA_VISIBLE_DEVICES'] = '0-2'\n",
        );
        let scheduler = build_scheduler(4, MockSupervisor::instant(TaskStatus::Success));
        let mut request = SubmitRequest::new(path);
        request.gpu_count = Some(1);
        let id = scheduler.submit(request).await;

        let task = scheduler.get_status(id).await.unwrap();
        assert_eq!(task.requested_gpus, 3);
        assert_eq!(task.preferred_gpus, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_missing_script_fails_immediately() {
        let scheduler = build_scheduler(1, MockSupervisor::instant(TaskStatus::Success));
        let id = scheduler
            .submit(SubmitRequest::new("/no/such/script.sh"))
            .await;

        let task = scheduler.get_status(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.script_type, ScriptType::Unknown);
        assert!(task.error_message.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_small_task_admitted_past_blocked_big_task() {
        let dir = tempfile::tempdir().unwrap();
        let big = write_script(&dir, "big.sh", "sleep 1\n");
        let small = write_script(&dir, "small.sh", "sleep 1\n");
        let scheduler = build_scheduler(
            1,
            MockSupervisor::slow(TaskStatus::Success, Duration::from_secs(5)),
        );

        let mut request = SubmitRequest::new(big);
        request.gpu_count = Some(4);
        let big_id = scheduler.submit(request).await;
        let mut request = SubmitRequest::new(small);
        request.gpu_count = Some(1);
        let small_id = scheduler.submit(request).await;

        assert!(matches!(scheduler.admit_next().await, Admission::Admitted));
        assert_eq!(
            scheduler.get_status(small_id).await.unwrap().status,
            TaskStatus::Running
        );
        assert_eq!(
            scheduler.get_status(big_id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_strict_fifo_blocks_behind_big_head() {
        let dir = tempfile::tempdir().unwrap();
        let big = write_script(&dir, "big.sh", "sleep 1\n");
        let small = write_script(&dir, "small.sh", "sleep 1\n");
        let (events, _) = broadcast::channel(64);
        let config = SchedulerConfig {
            admission: AdmissionPolicy::StrictFifo,
            ..SchedulerConfig::default()
        };
        let scheduler = Arc::new(Scheduler::new(
            config,
            Arc::new(StaticProbe::new(1)),
            MockSupervisor::slow(TaskStatus::Success, Duration::from_secs(5)),
            events,
        ));

        let mut request = SubmitRequest::new(big);
        request.gpu_count = Some(4);
        scheduler.submit(request).await;
        let mut request = SubmitRequest::new(small);
        request.gpu_count = Some(1);
        let small_id = scheduler.submit(request).await;

        assert!(matches!(scheduler.admit_next().await, Admission::Blocked));
        assert_eq!(
            scheduler.get_status(small_id).await.unwrap().status,
            TaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(&dir, "wait.sh", "sleep 1\n");
        let scheduler = build_scheduler(0, MockSupervisor::instant(TaskStatus::Success));
        let mut request = SubmitRequest::new(path);
        request.gpu_count = Some(1);
        let id = scheduler.submit(request).await;

        assert!(scheduler.cancel(id).await);
        let task = scheduler.get_status(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);

        // already terminal
        assert!(!scheduler.cancel(id).await);
        assert!(!scheduler.cancel(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn test_cancel_running_task_releases_devices() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(&dir, "slow.sh", "sleep 30\n");
        let scheduler = build_scheduler(
            1,
            MockSupervisor::slow(TaskStatus::Success, Duration::from_secs(30)),
        );
        scheduler.start();

        let mut request = SubmitRequest::new(path);
        request.gpu_count = Some(1);
        let id = scheduler.submit(request).await;
        wait_for_status(&scheduler, id, TaskStatus::Running, Duration::from_secs(3)).await;

        assert!(scheduler.cancel(id).await);
        let task =
            wait_for_status(&scheduler, id, TaskStatus::Cancelled, Duration::from_secs(3)).await;
        assert!(task.assigned_gpus.is_empty());
        assert_eq!(scheduler.system_status().await.available_gpus, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_pending_task_runs_after_devices_free_up() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_script(&dir, "first.sh", "true\n");
        let second = write_script(&dir, "second.sh", "true\n");
        let scheduler = build_scheduler(
            2,
            MockSupervisor::slow(TaskStatus::Success, Duration::from_millis(300)),
        );
        scheduler.start();

        let mut request = SubmitRequest::new(first);
        request.gpu_count = Some(1);
        let first_id = scheduler.submit(request).await;
        let mut request = SubmitRequest::new(second);
        request.gpu_count = Some(2);
        let second_id = scheduler.submit(request).await;

        wait_for_status(
            &scheduler,
            first_id,
            TaskStatus::Running,
            Duration::from_secs(2),
        )
        .await;
        assert_eq!(
            scheduler.get_status(second_id).await.unwrap().status,
            TaskStatus::Pending
        );

        wait_for_status(
            &scheduler,
            first_id,
            TaskStatus::Success,
            Duration::from_secs(3),
        )
        .await;
        let task = wait_for_status(
            &scheduler,
            second_id,
            TaskStatus::Success,
            Duration::from_secs(3),
        )
        .await;
        assert!(task.assigned_gpus.is_empty());

        let status = scheduler.system_status().await;
        assert_eq!(status.available_gpus, 2);
        assert_eq!(status.finished_tasks, 2);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_frees_devices() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(&dir, "slow.sh", "sleep 10\n");
        let (events, _) = broadcast::channel(64);
        let exec_config = ExecConfig {
            kill_grace_secs: 1,
            ..ExecConfig::default()
        };
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::default(),
            Arc::new(StaticProbe::new(1)),
            Arc::new(ProcessSupervisor::new(exec_config, events.clone())),
            events,
        ));
        scheduler.start();

        let mut request = SubmitRequest::new(path);
        request.gpu_count = Some(1);
        request.timeout_secs = Some(2);
        let id = scheduler.submit(request).await;

        let task =
            wait_for_status(&scheduler, id, TaskStatus::Timeout, Duration::from_secs(6)).await;
        assert!(task.error_message.unwrap().contains("timed out"));
        assert_eq!(scheduler.system_status().await.available_gpus, 1);
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_zero_gpu_task_runs_unbound() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(&dir, "cpu.sh", "true\n");
        let scheduler = build_scheduler(0, MockSupervisor::instant(TaskStatus::Success));
        scheduler.start();

        let id = scheduler.submit(SubmitRequest::new(path)).await;
        let task =
            wait_for_status(&scheduler, id, TaskStatus::Success, Duration::from_secs(3)).await;
        assert_eq!(task.requested_gpus, 0);
        assert!(task.assigned_gpus.is_empty());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_lifecycle_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(&dir, "ok.sh", "true\n");
        let (events, mut rx) = broadcast::channel(64);
        let scheduler = Arc::new(Scheduler::new(
            SchedulerConfig::default(),
            Arc::new(StaticProbe::new(1)),
            MockSupervisor::instant(TaskStatus::Success),
            events,
        ));
        scheduler.start();

        let mut request = SubmitRequest::new(path);
        request.gpu_count = Some(1);
        let id = scheduler.submit(request).await;
        wait_for_status(&scheduler, id, TaskStatus::Success, Duration::from_secs(3)).await;

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            assert_eq!(event.task_id, id);
            kinds.push(event.kind);
        }
        assert!(matches!(
            kinds[0],
            TaskEventKind::Submitted { requested_gpus: 1 }
        ));
        assert!(kinds
            .iter()
            .any(|k| matches!(k, TaskEventKind::GpuAssigned { .. })));
        assert!(kinds
            .iter()
            .any(|k| matches!(k, TaskEventKind::ExecutionStarted)));
        assert!(kinds
            .iter()
            .any(|k| matches!(k, TaskEventKind::ExecutionSuccess { .. })));
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_list_tasks_order_and_filter() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_script(&dir, "a.sh", "true\n");
        let second = write_script(&dir, "b.sh", "true\n");
        let scheduler = build_scheduler(0, MockSupervisor::instant(TaskStatus::Success));

        let mut request = SubmitRequest::new(first);
        request.gpu_count = Some(1);
        let first_id = scheduler.submit(request).await;
        let mut request = SubmitRequest::new(second);
        request.gpu_count = Some(1);
        scheduler.submit(request).await;
        let failed_id = scheduler.submit(SubmitRequest::new("/missing.sh")).await;

        let all = scheduler.list_tasks(None).await;
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].id, first_id);

        let failed = scheduler.list_tasks(Some(TaskStatus::Failed)).await;
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, failed_id);

        let pending = scheduler.list_tasks(Some(TaskStatus::Pending)).await;
        assert_eq!(pending.len(), 2);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let (events, _) = broadcast::channel(64);
        let config = SchedulerConfig {
            history_limit: 2,
            ..SchedulerConfig::default()
        };
        let scheduler = Arc::new(Scheduler::new(
            config,
            Arc::new(StaticProbe::new(0)),
            MockSupervisor::instant(TaskStatus::Success),
            events,
        ));

        let oldest = scheduler.submit(SubmitRequest::new("/missing-1.sh")).await;
        scheduler.submit(SubmitRequest::new("/missing-2.sh")).await;
        scheduler.submit(SubmitRequest::new("/missing-3.sh")).await;

        assert_eq!(scheduler.system_status().await.finished_tasks, 2);
        assert!(scheduler.get_status(oldest).await.is_none());
    }

    #[tokio::test]
    async fn test_double_start_is_ignored() {
        let scheduler = build_scheduler(0, MockSupervisor::instant(TaskStatus::Success));
        scheduler.start();
        scheduler.start();
        scheduler.shutdown().await;
    }
}
