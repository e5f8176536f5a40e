use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdout};
use tokio::sync::mpsc;
use tonic::{Request, Response, Status};

use fedlink_core::id::{sint64_to_uint64, uint64_to_sint64};

use crate::executor::{Executor, RunLaunch};
use crate::grpc::proto::exec_server::Exec;
use crate::grpc::proto::{
    StartRunRequest, StartRunResponse, StreamLogsRequest, StreamLogsResponse,
};

/// How long the capture task waits for either stream before checking
/// whether the child exited.
const SELECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Pause between delivery sweeps of a log subscriber.
const STREAM_INTERVAL: Duration = Duration::from_millis(100);

/// Run-launching and log-streaming servicer. Owns every child process
/// it starts and one shared append-only log buffer.
pub struct ExecService {
    executor: Arc<dyn Executor>,
    runs: Arc<tokio::sync::Mutex<HashMap<u64, Child>>>,
    logs: Arc<Mutex<Vec<String>>>,
}

impl ExecService {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            runs: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            logs: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

#[tonic::async_trait]
impl Exec for ExecService {
    async fn start_run(
        &self,
        request: Request<StartRunRequest>,
    ) -> Result<Response<StartRunResponse>, Status> {
        let req = request.into_inner();
        let RunLaunch { run_id, mut child } = self
            .executor
            .start_run(&req.fab_file)
            .await
            .map_err(|e| Status::internal(format!("failed to start run: {e:#}")))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        self.runs.lock().await.insert(run_id, child);

        tokio::spawn(capture_logs(
            run_id,
            stdout,
            stderr,
            self.runs.clone(),
            self.logs.clone(),
        ));

        tracing::info!(run_id, "run started");
        Ok(Response::new(StartRunResponse {
            run_id: uint64_to_sint64(run_id),
        }))
    }

    type StreamLogsStream =
        tokio_stream::wrappers::ReceiverStream<Result<StreamLogsResponse, Status>>;

    async fn stream_logs(
        &self,
        request: Request<StreamLogsRequest>,
    ) -> Result<Response<Self::StreamLogsStream>, Status> {
        let run_id = sint64_to_uint64(request.into_inner().run_id);
        if !self.runs.lock().await.contains_key(&run_id) {
            return Err(Status::not_found(format!("run {run_id} not found")));
        }

        let (tx, rx) = mpsc::channel(64);
        let logs = self.logs.clone();

        // Tail the shared buffer with a per-subscriber cursor, starting
        // from the beginning. The stream outlives child exit (post-
        // mortem reading) and ends when the subscriber disconnects.
        tokio::spawn(async move {
            let mut last_sent = 0usize;
            loop {
                let pending: Vec<String> = {
                    let logs = logs.lock().unwrap();
                    logs[last_sent..].to_vec()
                };
                for line in pending {
                    last_sent += 1;
                    let msg = StreamLogsResponse { log_output: line };
                    if tx.send(Ok(msg)).await.is_err() {
                        // Subscriber gone — stop tailing.
                        return;
                    }
                }
                tokio::time::sleep(STREAM_INTERVAL).await;
            }
        });

        Ok(Response::new(tokio_stream::wrappers::ReceiverStream::new(
            rx,
        )))
    }
}

async fn run_exited(runs: &tokio::sync::Mutex<HashMap<u64, Child>>, run_id: u64) -> bool {
    let mut runs = runs.lock().await;
    match runs.get_mut(&run_id) {
        Some(child) => matches!(child.try_wait(), Ok(Some(_)) | Err(_)),
        None => true,
    }
}

fn append_line(logs: &Mutex<Vec<String>>, line: String) {
    if line.is_empty() {
        return;
    }
    logs.lock().unwrap().push(line);
}

/// Read one line from the stream, or park forever when it is closed
/// (the select arm is disabled then anyway). `None` means EOF.
async fn next_line<R: AsyncBufRead + Unpin>(lines: &mut Option<Lines<R>>) -> Option<String> {
    match lines {
        Some(lines) => lines.next_line().await.ok().flatten(),
        None => std::future::pending().await,
    }
}

/// Pull whatever the pipe still holds after exit; stop when the stream
/// reports EOF or nothing is ready within the select window.
async fn drain<R: AsyncBufRead + Unpin>(lines: &mut Option<Lines<R>>, logs: &Mutex<Vec<String>>) {
    while lines.is_some() {
        match tokio::time::timeout(SELECT_TIMEOUT, next_line(lines)).await {
            Ok(Some(line)) => append_line(logs, line),
            Ok(None) => *lines = None,
            Err(_) => break,
        }
    }
}

/// Cooperatively multiplex the child's stdout and stderr into the
/// shared buffer. Waits up to [`SELECT_TIMEOUT`] for either stream to
/// produce a line; once the child has exited, drains the remainder and
/// finishes. Subscribers keep reading the buffer afterwards.
async fn capture_logs(
    run_id: u64,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    runs: Arc<tokio::sync::Mutex<HashMap<u64, Child>>>,
    logs: Arc<Mutex<Vec<String>>>,
) {
    let mut stdout = stdout.map(|s| BufReader::new(s).lines());
    let mut stderr = stderr.map(|s| BufReader::new(s).lines());

    loop {
        if stdout.is_none() && stderr.is_none() {
            break;
        }
        tokio::select! {
            line = next_line(&mut stdout), if stdout.is_some() => {
                match line {
                    Some(line) => append_line(&logs, line),
                    None => stdout = None,
                }
            }
            line = next_line(&mut stderr), if stderr.is_some() => {
                match line {
                    Some(line) => append_line(&logs, line),
                    None => stderr = None,
                }
            }
            _ = tokio::time::sleep(SELECT_TIMEOUT) => {
                if run_exited(&runs, run_id).await {
                    drain(&mut stdout, &logs).await;
                    drain(&mut stderr, &logs).await;
                    break;
                }
            }
        }
    }

    tracing::info!(run_id, "log capture finished");
}
