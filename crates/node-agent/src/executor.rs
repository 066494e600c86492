//! Local task execution
//!
//! Each submitted task runs its own control loop: the driver produces steps,
//! the loop relays progress frames, and exactly one terminal frame is sent
//! per task. A stop request aborts the loop before its next step; the step
//! already in flight is allowed to finish, since not every underlying tool is
//! safely interruptible mid-call.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use fleet_core::protocol::{NodeFrame, TaskEvent, TaskEventKind, TaskOptions};

use crate::error::{AgentError, Result};

/// Outcome of one control-loop step
pub enum Step {
    Progress(TaskEvent),
    Finished(serde_json::Value),
}

/// The seam between the control loop and a concrete workload
#[async_trait]
pub trait TaskDriver: Send {
    /// Run the next step of the workload
    async fn step(&mut self) -> Result<Step>;

    /// Best-effort abort of in-flight work, called after a stop request
    async fn abort(&mut self);

    /// Deliver an operator message to the running workload
    async fn message(&mut self, text: String) -> Result<()>;
}

/// Builds a driver for a submitted task
pub type DriverFactory =
    Arc<dyn Fn(Uuid, &str, &TaskOptions) -> Box<dyn TaskDriver> + Send + Sync>;

/// Default driver: runs the goal as a shell command, streaming stdout lines
/// as progress events
pub struct ShellDriver {
    goal: String,
    options: TaskOptions,
    child: Option<Child>,
    stdout: Option<Lines<BufReader<ChildStdout>>>,
    stdin: Option<ChildStdin>,
}

impl ShellDriver {
    pub fn new(goal: &str, options: &TaskOptions) -> Self {
        Self {
            goal: goal.to_string(),
            options: options.clone(),
            child: None,
            stdout: None,
            stdin: None,
        }
    }

    fn spawn(&mut self) -> Result<()> {
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.goal)
            .envs(&self.options.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = command
            .spawn()
            .map_err(|e| AgentError::ExecutionFailed(format!("failed to spawn shell: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::ExecutionFailed("no stdout pipe".to_string()))?;
        self.stdin = child.stdin.take();
        self.stdout = Some(BufReader::new(stdout).lines());
        self.child = Some(child);
        Ok(())
    }
}

#[async_trait]
impl TaskDriver for ShellDriver {
    async fn step(&mut self) -> Result<Step> {
        if self.child.is_none() {
            self.spawn()?;
        }

        let lines = self
            .stdout
            .as_mut()
            .ok_or_else(|| AgentError::ExecutionFailed("stdout already drained".to_string()))?;

        match lines.next_line().await? {
            Some(line) => Ok(Step::Progress(TaskEvent::new(TaskEventKind::Stdout, line))),
            None => {
                let child = self
                    .child
                    .as_mut()
                    .ok_or_else(|| AgentError::ExecutionFailed("child vanished".to_string()))?;
                let status = child.wait().await?;
                if status.success() {
                    Ok(Step::Finished(serde_json::json!({
                        "success": true,
                        "exitCode": status.code(),
                    })))
                } else {
                    Err(AgentError::ExecutionFailed(format!(
                        "command exited with {}",
                        status.code().map_or("signal".to_string(), |c| c.to_string())
                    )))
                }
            }
        }
    }

    async fn abort(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }

    async fn message(&mut self, text: String) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| AgentError::ExecutionFailed("task has no stdin".to_string()))?;
        stdin.write_all(text.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

struct RunningTask {
    stop_tx: watch::Sender<bool>,
    msg_tx: mpsc::Sender<String>,
}

/// Runs tasks and reports their lifecycle over the outbound frame queue
pub struct TaskExecutor {
    outbound: mpsc::Sender<NodeFrame>,
    tasks: Arc<RwLock<HashMap<Uuid, RunningTask>>>,
    factory: DriverFactory,
}

impl TaskExecutor {
    /// Executor with the default shell driver
    pub fn new(outbound: mpsc::Sender<NodeFrame>) -> Self {
        Self::with_factory(
            outbound,
            Arc::new(|_, goal, options| {
                Box::new(ShellDriver::new(goal, options)) as Box<dyn TaskDriver>
            }),
        )
    }

    pub fn with_factory(outbound: mpsc::Sender<NodeFrame>, factory: DriverFactory) -> Self {
        Self {
            outbound,
            tasks: Arc::new(RwLock::new(HashMap::new())),
            factory,
        }
    }

    /// Start a task's control loop
    pub async fn submit(&self, task_id: Uuid, goal: &str, options: &TaskOptions) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task_id) {
            return Err(AgentError::TaskAlreadyRunning(task_id.to_string()));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (msg_tx, msg_rx) = mpsc::channel(32);
        tasks.insert(task_id, RunningTask { stop_tx, msg_tx });
        drop(tasks);

        let driver = (self.factory)(task_id, goal, options);
        let outbound = self.outbound.clone();
        let registry = Arc::clone(&self.tasks);

        info!("Starting task {}", task_id);
        tokio::spawn(async move {
            run_task(task_id, driver, outbound, stop_rx, msg_rx).await;
            registry.write().await.remove(&task_id);
        });

        Ok(())
    }

    /// Request a stop. Takes effect before the task's next step.
    pub async fn stop(&self, task_id: Uuid) {
        let tasks = self.tasks.read().await;
        match tasks.get(&task_id) {
            Some(running) => {
                info!("Stop requested for task {}", task_id);
                let _ = running.stop_tx.send(true);
            }
            None => warn!("Stop for unknown or finished task {}", task_id),
        }
    }

    /// Forward an operator message to a running task
    pub async fn message(&self, task_id: Uuid, text: String) {
        let tasks = self.tasks.read().await;
        match tasks.get(&task_id) {
            Some(running) => {
                let _ = running.msg_tx.send(text).await;
            }
            None => warn!("Message for unknown or finished task {}", task_id),
        }
    }

    pub async fn running_count(&self) -> usize {
        self.tasks.read().await.len()
    }
}

/// Drive one task to exactly one terminal frame
async fn run_task(
    task_id: Uuid,
    mut driver: Box<dyn TaskDriver>,
    outbound: mpsc::Sender<NodeFrame>,
    stop_rx: watch::Receiver<bool>,
    mut msg_rx: mpsc::Receiver<String>,
) {
    let _ = outbound.send(NodeFrame::TaskStarted { task_id }).await;

    let terminal = loop {
        // The stop signal is honored between steps; the step in flight below
        // runs to completion.
        if *stop_rx.borrow() {
            driver.abort().await;
            break NodeFrame::TaskStopped { task_id };
        }

        while let Ok(text) = msg_rx.try_recv() {
            if let Err(e) = driver.message(text).await {
                warn!("Task {} rejected message: {}", task_id, e);
            }
        }

        match driver.step().await {
            Ok(Step::Progress(event)) => {
                let _ = outbound
                    .send(NodeFrame::TaskProgress { task_id, event })
                    .await;
            }
            Ok(Step::Finished(result)) => {
                break NodeFrame::TaskCompleted { task_id, result };
            }
            Err(e) => {
                break NodeFrame::TaskError {
                    task_id,
                    error: e.to_string(),
                };
            }
        }
    };

    info!("Task {} finished: {:?}", task_id, frame_name(&terminal));
    let _ = outbound.send(terminal).await;
}

fn frame_name(frame: &NodeFrame) -> &'static str {
    match frame {
        NodeFrame::TaskCompleted { .. } => "completed",
        NodeFrame::TaskError { .. } => "error",
        NodeFrame::TaskStopped { .. } => "stopped",
        _ => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    struct ScriptedDriver {
        steps: VecDeque<Result<Step>>,
        step_delay: Duration,
        aborted: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TaskDriver for ScriptedDriver {
        async fn step(&mut self) -> Result<Step> {
            tokio::time::sleep(self.step_delay).await;
            self.steps
                .pop_front()
                .unwrap_or_else(|| Ok(Step::Finished(serde_json::json!({"success": true}))))
        }

        async fn abort(&mut self) {
            self.aborted.store(true, Ordering::SeqCst);
        }

        async fn message(&mut self, _text: String) -> Result<()> {
            Ok(())
        }
    }

    fn progress(text: &str) -> Result<Step> {
        Ok(Step::Progress(TaskEvent::new(TaskEventKind::Log, text)))
    }

    fn scripted_executor(
        steps: Vec<Result<Step>>,
        step_delay: Duration,
    ) -> (TaskExecutor, mpsc::Receiver<NodeFrame>, Arc<AtomicBool>) {
        let (tx, rx) = mpsc::channel(64);
        let aborted = Arc::new(AtomicBool::new(false));
        let aborted_clone = Arc::clone(&aborted);
        let steps = Arc::new(std::sync::Mutex::new(Some(steps)));

        let executor = TaskExecutor::with_factory(
            tx,
            Arc::new(move |_, _, _| {
                let steps = steps.lock().unwrap().take().expect("driver built twice");
                Box::new(ScriptedDriver {
                    steps: steps.into(),
                    step_delay,
                    aborted: Arc::clone(&aborted_clone),
                }) as Box<dyn TaskDriver>
            }),
        );
        (executor, rx, aborted)
    }

    #[tokio::test]
    async fn test_lifecycle_frames_in_order() {
        let (executor, mut rx, _) = scripted_executor(
            vec![
                progress("step 1"),
                progress("step 2"),
                Ok(Step::Finished(serde_json::json!({"ok": true}))),
            ],
            Duration::ZERO,
        );

        let task_id = Uuid::new_v4();
        executor
            .submit(task_id, "goal", &TaskOptions::default())
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            NodeFrame::TaskStarted { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            NodeFrame::TaskProgress { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            NodeFrame::TaskProgress { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            NodeFrame::TaskCompleted { .. }
        ));

        // No frames after the terminal one; the channel stays empty.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(executor.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_driver_error_sends_exactly_one_terminal_frame() {
        let (executor, mut rx, _) = scripted_executor(
            vec![
                progress("step 1"),
                Err(AgentError::ExecutionFailed("boom".to_string())),
            ],
            Duration::ZERO,
        );

        let task_id = Uuid::new_v4();
        executor
            .submit(task_id, "goal", &TaskOptions::default())
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            NodeFrame::TaskStarted { .. }
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            NodeFrame::TaskProgress { .. }
        ));
        match rx.recv().await.unwrap() {
            NodeFrame::TaskError { error, .. } => assert!(error.contains("boom")),
            other => panic!("unexpected frame: {:?}", other),
        }

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_aborts_between_steps() {
        let steps = (0..100).map(|i| progress(&format!("step {}", i))).collect();
        let (executor, mut rx, aborted) =
            scripted_executor(steps, Duration::from_millis(10));

        let task_id = Uuid::new_v4();
        executor
            .submit(task_id, "goal", &TaskOptions::default())
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            NodeFrame::TaskStarted { .. }
        ));
        // Let a step or two through, then request a stop.
        let _ = rx.recv().await.unwrap();
        executor.stop(task_id).await;

        // Everything from here on is progress until the single stopped frame.
        loop {
            match rx.recv().await.unwrap() {
                NodeFrame::TaskProgress { .. } => continue,
                NodeFrame::TaskStopped { .. } => break,
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert!(aborted.load(Ordering::SeqCst));

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(executor.running_count().await, 0);
    }

    #[tokio::test]
    async fn test_duplicate_submit_is_rejected() {
        let steps = (0..50).map(|i| progress(&format!("step {}", i))).collect();
        let (executor, _rx, _) = scripted_executor(steps, Duration::from_millis(10));

        let task_id = Uuid::new_v4();
        executor
            .submit(task_id, "goal", &TaskOptions::default())
            .await
            .unwrap();
        let err = executor
            .submit(task_id, "goal", &TaskOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::TaskAlreadyRunning(_)));
    }

    #[tokio::test]
    async fn test_shell_driver_streams_and_completes() {
        let (tx, mut rx) = mpsc::channel(64);
        let executor = TaskExecutor::new(tx);
        let task_id = Uuid::new_v4();

        executor
            .submit(task_id, "echo one && echo two", &TaskOptions::default())
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            NodeFrame::TaskStarted { .. }
        ));
        let mut lines = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                NodeFrame::TaskProgress { event, .. } => {
                    lines.push(event.content.unwrap_or_default());
                }
                NodeFrame::TaskCompleted { result, .. } => {
                    assert_eq!(result["success"], serde_json::json!(true));
                    break;
                }
                other => panic!("unexpected frame: {:?}", other),
            }
        }
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
    }

    #[tokio::test]
    async fn test_shell_driver_failure_is_task_error() {
        let (tx, mut rx) = mpsc::channel(64);
        let executor = TaskExecutor::new(tx);
        let task_id = Uuid::new_v4();

        executor
            .submit(task_id, "exit 3", &TaskOptions::default())
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            NodeFrame::TaskStarted { .. }
        ));
        match rx.recv().await.unwrap() {
            NodeFrame::TaskError { error, .. } => assert!(error.contains("3")),
            other => panic!("unexpected frame: {:?}", other),
        }
    }
}
