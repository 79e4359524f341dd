use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, warn};
use spindle_common::config::WorkerConfig;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::{ExecutionError, ExecutionResult};
use crate::id::WorkerId;
use crate::protocol::Envelope;
use crate::worker::READY_LINE;
use crate::worker_manager::{WorkerLaunchOptions, WorkerListener, WorkerManager, WorkerTransport};

#[derive(Debug, Clone)]
pub struct ProcessWorkerManagerOptions {
    pub program: String,
    pub arguments: Vec<String>,
}

impl ProcessWorkerManagerOptions {
    pub fn new(config: &WorkerConfig) -> ExecutionResult<Self> {
        if config.program.is_empty() {
            return Err(ExecutionError::invalid("the worker program is not set"));
        }
        Ok(Self {
            program: config.program.clone(),
            arguments: config.arguments.clone(),
        })
    }
}

struct ProcessWorker {
    token: CancellationToken,
    exited: watch::Receiver<bool>,
}

/// Runs each worker as a child process that speaks the protocol
/// over its standard input and output, one JSON message per line.
/// The standard error of the child is inherited.
pub struct ProcessWorkerManager {
    options: ProcessWorkerManagerOptions,
    workers: Mutex<HashMap<WorkerId, ProcessWorker>>,
}

impl ProcessWorkerManager {
    pub fn new(options: ProcessWorkerManagerOptions) -> Self {
        Self {
            options,
            workers: Mutex::new(HashMap::new()),
        }
    }

    async fn spawn_child(
        &self,
        id: WorkerId,
        options: &WorkerLaunchOptions,
    ) -> ExecutionResult<(Child, ChildStdin, Lines<BufReader<ChildStdout>>)> {
        let mut child = Command::new(&self.options.program)
            .args(&self.options.arguments)
            .current_dir(&options.working_directory)
            .envs(&options.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ExecutionError::WorkerLaunchError(format!(
                    "failed to run {}: {e}",
                    self.options.program
                ))
            })?;
        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            return Err(ExecutionError::internal(format!(
                "missing standard I/O for worker {id}"
            )));
        };
        let mut lines = BufReader::new(stdout).lines();
        match lines.next_line().await? {
            Some(line) if line.trim() == READY_LINE => Ok((child, stdin, lines)),
            Some(line) => {
                let _ = child.kill().await;
                Err(ExecutionError::WorkerLaunchError(format!(
                    "malformed initial message: {line}"
                )))
            }
            None => {
                let status = child.wait().await?;
                Err(ExecutionError::WorkerLaunchError(format!(
                    "worker {id} exited before it was ready ({status})"
                )))
            }
        }
    }
}

#[async_trait]
impl WorkerManager for ProcessWorkerManager {
    async fn launch_worker(
        &self,
        id: WorkerId,
        options: WorkerLaunchOptions,
    ) -> ExecutionResult<Box<dyn WorkerTransport>> {
        let (child, stdin, lines) = self.spawn_child(id, &options).await?;
        debug!("worker {id} started as process {:?}", child.id());
        let token = CancellationToken::new();
        let (exited_tx, exited_rx) = watch::channel(false);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_lines(id, stdin, rx));
        self.workers.lock().await.insert(
            id,
            ProcessWorker {
                token: token.clone(),
                exited: exited_rx,
            },
        );
        Ok(Box::new(ProcessWorkerTransport {
            worker_id: id,
            sender: Some(tx),
            child: Some((child, lines)),
            token,
            exited: Some(exited_tx),
            detached: Arc::new(AtomicBool::new(false)),
        }))
    }

    async fn stop_worker(&self, id: WorkerId) -> ExecutionResult<()> {
        let worker = self.workers.lock().await.remove(&id);
        if let Some(mut worker) = worker {
            worker.token.cancel();
            // The sender is dropped without a value if the transport was never attached.
            let _ = worker.exited.wait_for(|x| *x).await;
        }
        Ok(())
    }

    async fn stop(&self) -> ExecutionResult<()> {
        let workers = self
            .workers
            .lock()
            .await
            .drain()
            .map(|(_, x)| x)
            .collect::<Vec<_>>();
        for worker in &workers {
            worker.token.cancel();
        }
        for mut worker in workers {
            let _ = worker.exited.wait_for(|x| *x).await;
        }
        Ok(())
    }
}

async fn write_lines(
    id: WorkerId,
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = lines.recv().await {
        let result = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = result {
            debug!("failed to write to worker {id}: {e}");
            break;
        }
    }
}

fn describe_exit(id: WorkerId, status: std::io::Result<ExitStatus>) -> String {
    match status {
        Ok(status) => match (status.code(), exit_signal(&status)) {
            (Some(code), _) => format!("worker {id} exited with code {code}"),
            (None, Some(signal)) => format!("worker {id} exited with signal {signal}"),
            (None, None) => format!("worker {id} exited unexpectedly ({status})"),
        },
        Err(e) => format!("worker {id} exited unexpectedly: {e}"),
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

async fn serve(
    id: WorkerId,
    mut child: Child,
    mut lines: Lines<BufReader<ChildStdout>>,
    listener: Box<dyn WorkerListener>,
    token: CancellationToken,
    detached: Arc<AtomicBool>,
    exited: watch::Sender<bool>,
) {
    let error = loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = child.kill().await;
                break None;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match Envelope::from_json_line(&line) {
                        Ok(envelope) => {
                            if !detached.load(Ordering::Acquire) {
                                listener.on_message(envelope);
                            }
                        }
                        Err(e) => {
                            warn!("invalid message from worker {id}: {line}");
                            let _ = child.kill().await;
                            break Some(e);
                        }
                    }
                }
                Ok(None) => {
                    let status = child.wait().await;
                    break Some(ExecutionError::WorkerExited(describe_exit(id, status)));
                }
                Err(e) => {
                    let _ = child.kill().await;
                    break Some(e.into());
                }
            }
        }
    };
    if let Some(error) = error {
        if !detached.load(Ordering::Acquire) {
            listener.on_exit(error);
        }
    }
    let _ = exited.send(true);
}

struct ProcessWorkerTransport {
    worker_id: WorkerId,
    /// The lines to write to the worker. It is dropped on detach
    /// so that the worker sees the end of its input.
    sender: Option<mpsc::UnboundedSender<String>>,
    child: Option<(Child, Lines<BufReader<ChildStdout>>)>,
    token: CancellationToken,
    exited: Option<watch::Sender<bool>>,
    detached: Arc<AtomicBool>,
}

impl WorkerTransport for ProcessWorkerTransport {
    fn attach(&mut self, listener: Box<dyn WorkerListener>) {
        let (Some((child, lines)), Some(exited)) = (self.child.take(), self.exited.take()) else {
            return;
        };
        tokio::spawn(serve(
            self.worker_id,
            child,
            lines,
            listener,
            self.token.clone(),
            Arc::clone(&self.detached),
            exited,
        ));
    }

    fn send(&self, envelope: Envelope) -> ExecutionResult<()> {
        let line = envelope.to_json_line()?;
        self.sender
            .as_ref()
            .and_then(|x| x.send(line).ok())
            .ok_or_else(|| {
                ExecutionError::WorkerExited(format!(
                    "cannot write to worker {}",
                    self.worker_id
                ))
            })
    }

    fn detach(&mut self) {
        self.detached.store(true, Ordering::Release);
        self.sender = None;
    }

    fn supports_handles(&self) -> bool {
        false
    }
}

#[cfg(all(test, unix))]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;

    use super::*;
    use crate::id::RequestId;
    use crate::protocol::{Reply, Request};

    fn manager(script: &str) -> ProcessWorkerManager {
        ProcessWorkerManager::new(ProcessWorkerManagerOptions {
            program: "sh".to_string(),
            arguments: vec!["-c".to_string(), script.to_string()],
        })
    }

    fn launch_options() -> WorkerLaunchOptions {
        WorkerLaunchOptions {
            working_directory: PathBuf::from("."),
            environment: HashMap::from([("SPINDLE_TEST_REPLY".to_string(), "[6,1]".to_string())]),
        }
    }

    #[derive(Clone, Default)]
    struct RecordingListener {
        messages: Arc<StdMutex<Vec<Envelope>>>,
        exit: Arc<StdMutex<Option<String>>>,
    }

    impl WorkerListener for RecordingListener {
        fn on_message(&self, envelope: Envelope) {
            self.messages.lock().unwrap().push(envelope);
        }

        fn on_exit(&self, error: ExecutionError) {
            *self.exit.lock().unwrap() = Some(error.to_string());
        }
    }

    #[test]
    fn test_options_require_program() {
        let config = WorkerConfig {
            program: String::new(),
            arguments: vec![],
        };
        assert!(matches!(
            ProcessWorkerManagerOptions::new(&config),
            Err(ExecutionError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_launch_rejects_malformed_start() {
        let manager = manager("echo hello; sleep 10");
        let result = manager
            .launch_worker(WorkerId::from(1), launch_options())
            .await;
        let Err(ExecutionError::WorkerLaunchError(message)) = result else {
            unreachable!()
        };
        assert_eq!(message, "malformed initial message: hello");
    }

    #[tokio::test]
    async fn test_launch_reports_early_exit() {
        let manager = manager("exit 3");
        let result = manager
            .launch_worker(WorkerId::from(1), launch_options())
            .await;
        assert!(matches!(result, Err(ExecutionError::WorkerLaunchError(_))));
    }

    #[tokio::test]
    async fn test_exchange_lines_and_exit() {
        let manager = manager(r#"echo '"start"'; read line; echo "$SPINDLE_TEST_REPLY"; exit 2"#);
        let mut transport = manager
            .launch_worker(WorkerId::from(1), launch_options())
            .await
            .unwrap();
        assert!(!transport.supports_handles());
        let listener = RecordingListener::default();
        transport.attach(Box::new(listener.clone()));
        transport
            .send(Request::Invoke { id: RequestId::from(1) }.encode())
            .unwrap();
        for _ in 0..100 {
            if listener.exit.lock().unwrap().is_some() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        let messages = listener.messages.lock().unwrap().clone();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            Reply::decode(messages[0].clone()).unwrap(),
            Reply::Next { id: RequestId::from(1) }
        );
        let exit = listener.exit.lock().unwrap().clone().unwrap();
        assert!(exit.contains("exited with code 2"));
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_worker_kills_process() {
        let manager = manager(r#"echo '"start"'; sleep 60"#);
        let mut transport = manager
            .launch_worker(WorkerId::from(1), launch_options())
            .await
            .unwrap();
        let listener = RecordingListener::default();
        transport.attach(Box::new(listener.clone()));
        transport.detach();
        manager.stop_worker(WorkerId::from(1)).await.unwrap();
        assert!(listener.exit.lock().unwrap().is_none());
        assert!(transport
            .send(Request::Invoke { id: RequestId::from(1) }.encode())
            .is_err());
    }
}
