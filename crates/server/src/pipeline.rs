use std::io;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use crate::transcode::PipelineSpec;

const CHUNK_SIZE: usize = 16 * 1024;
const CHANNEL_DEPTH: usize = 8;
/// How long an upstream stage gets to notice its reader is gone.
const UPSTREAM_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum PipelineError {
    Empty,
    Spawn { program: String, source: io::Error },
    Io(io::Error),
}

impl std::fmt::Display for PipelineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineError::Empty => write!(f, "pipeline has no stages"),
            PipelineError::Spawn { program, source } => {
                write!(f, "failed to start {}: {}", program, source)
            }
            PipelineError::Io(err) => write!(f, "io error: {}", err),
        }
    }
}

impl std::error::Error for PipelineError {}

impl From<io::Error> for PipelineError {
    fn from(err: io::Error) -> Self {
        PipelineError::Io(err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The last stage closed its output.
    Finished,
    /// The consumer went away first.
    Abandoned,
    /// Reading the last stage's output failed.
    Failed,
}

/// How a pipeline ended and how each stage exited, in stage order. A `None`
/// status means the process could not be reaped.
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub end: StreamEnd,
    pub statuses: Vec<Option<ExitStatus>>,
}

impl PipelineReport {
    pub fn all_exited(&self) -> bool {
        self.statuses.iter().all(Option::is_some)
    }
}

/// Running processes of one request, chained stdout to stdin.
pub struct Pipeline {
    children: Vec<Child>,
    output: Option<ChildStdout>,
}

impl Pipeline {
    /// Starts every stage. If any stage fails to start, the ones already
    /// running are killed before the error is returned.
    pub async fn spawn(spec: &PipelineSpec) -> Result<Self, PipelineError> {
        if spec.stages.is_empty() {
            return Err(PipelineError::Empty);
        }

        let mut pipeline = Pipeline {
            children: Vec::with_capacity(spec.stages.len()),
            output: None,
        };
        let mut upstream: Option<ChildStdout> = None;

        for stage in &spec.stages {
            let program = stage.program().to_string();
            if program.is_empty() {
                pipeline.shutdown(StreamEnd::Failed).await;
                return Err(PipelineError::Empty);
            }

            let stdin: Stdio = match upstream.take() {
                Some(out) => match out.try_into() {
                    Ok(stdin) => stdin,
                    Err(err) => {
                        pipeline.shutdown(StreamEnd::Failed).await;
                        return Err(PipelineError::Io(err));
                    }
                },
                None => Stdio::null(),
            };

            let mut command = Command::new(&program);
            command
                .args(&stage.argv[1..])
                .stdin(stdin)
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true);

            let spawned = command.spawn();
            drop(command);
            let mut child = match spawned {
                Ok(child) => child,
                Err(source) => {
                    warn!("Failed to start {}: {}", program, source);
                    pipeline.shutdown(StreamEnd::Failed).await;
                    return Err(PipelineError::Spawn { program, source });
                }
            };
            info!("Started {} (pid {:?})", program, child.id());

            upstream = child.stdout.take();
            pipeline.children.push(child);
        }

        pipeline.output = upstream;
        if pipeline.output.is_none() {
            pipeline.shutdown(StreamEnd::Failed).await;
            return Err(PipelineError::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "last stage has no output",
            )));
        }
        Ok(pipeline)
    }

    /// Terminates the last stage unless it already finished, then reaps the
    /// rest. Upstream stages normally exit on their own once their reader is
    /// gone; any still running after a grace period is killed.
    pub async fn shutdown(mut self, end: StreamEnd) -> PipelineReport {
        drop(self.output.take());
        let mut statuses = vec![None; self.children.len()];

        let last = self.children.len().saturating_sub(1);
        for (idx, child) in self.children.iter_mut().enumerate().rev() {
            let status = if idx == last && end != StreamEnd::Finished {
                terminate(child).await
            } else {
                match tokio::time::timeout(UPSTREAM_GRACE, child.wait()).await {
                    Ok(Ok(status)) => Some(status),
                    Ok(Err(err)) => {
                        warn!("Failed to wait for stage {}: {}", idx, err);
                        None
                    }
                    Err(_) => terminate(child).await,
                }
            };
            statuses[idx] = status;
        }

        info!("Pipeline ended ({:?}), exit statuses {:?}", end, statuses);
        PipelineReport { end, statuses }
    }

    /// Turns the pipeline into a streamed response body. The pipeline is shut
    /// down when the output ends or the client disconnects, and
    /// `on_complete` then receives the report.
    pub fn into_body<F>(mut self, on_complete: F) -> Body
    where
        F: FnOnce(PipelineReport) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(CHANNEL_DEPTH);
        let output = self.output.take();

        tokio::spawn(async move {
            let end = match output {
                Some(output) => pump(output, &tx).await,
                None => StreamEnd::Failed,
            };
            drop(tx);
            let report = self.shutdown(end).await;
            on_complete(report);
        });

        Body::from_stream(ReceiverStream::new(rx))
    }
}

async fn pump(mut output: ChildStdout, tx: &mpsc::Sender<Result<Bytes, io::Error>>) -> StreamEnd {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            _ = tx.closed() => {
                debug!("Client went away mid-stream");
                return StreamEnd::Abandoned;
            }
            read = output.read(&mut buf) => read,
        };
        match read {
            Ok(0) => return StreamEnd::Finished,
            Ok(n) => {
                if tx.send(Ok(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    debug!("Client went away mid-stream");
                    return StreamEnd::Abandoned;
                }
            }
            Err(err) => {
                warn!("Reading transcoder output failed: {}", err);
                let _ = tx.send(Err(err)).await;
                return StreamEnd::Failed;
            }
        }
    }
}

async fn terminate(child: &mut Child) -> Option<ExitStatus> {
    match child.try_wait() {
        Ok(Some(status)) => return Some(status),
        Ok(None) => {}
        Err(err) => warn!("Failed to poll child: {}", err),
    }
    if let Err(err) = child.start_kill() {
        debug!("Kill failed: {}", err);
    }
    match child.wait().await {
        Ok(status) => Some(status),
        Err(err) => {
            warn!("Failed to reap child: {}", err);
            None
        }
    }
}
