use std::sync::Arc;

use log::{debug, warn};
use spindle_server::actor::ActorHandle;
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use crate::codec::{ErrorKind, RemoteError, Value};
use crate::error::{ExecutionError, ExecutionResult};
use crate::protocol::{Envelope, Reply};
use crate::worker::actor::WorkerActor;
use crate::worker::event::WorkerEvent;
use crate::worker::module::ModuleLoader;
use crate::worker::options::WorkerOptions;

/// The first line a worker process writes once it is ready for requests.
pub(crate) const READY_LINE: &str = "\"start\"";

/// Serves the worker protocol over standard input and output,
/// with one JSON message per line.
///
/// The function returns when standard input is closed and all
/// replies have been written, or when the pool sends an invalid message.
pub async fn run_worker(loader: Arc<dyn ModuleLoader>) -> ExecutionResult<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(format!("{READY_LINE}\n").as_bytes()).await?;
    stdout.flush().await?;

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ActorHandle::<WorkerActor>::new(WorkerOptions { loader, output: tx });
    let writer = write_replies(rx, stdout);
    tokio::pin!(writer);
    tokio::select! {
        result = read_requests(handle) => {
            result?;
            writer.await
        }
        result = &mut writer => result,
    }
}

async fn read_requests(handle: ActorHandle<WorkerActor>) -> ExecutionResult<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let envelope = Envelope::from_json_line(&line)?;
        handle.send(WorkerEvent::Message { envelope })?;
    }
    debug!("the pool closed the worker input");
    let _ = handle.send(WorkerEvent::Shutdown);
    Ok(())
}

async fn write_replies<W>(
    mut replies: mpsc::UnboundedReceiver<Envelope>,
    mut output: W,
) -> ExecutionResult<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = replies.recv().await {
        let line = match envelope.to_json_line() {
            Ok(x) => x,
            Err(ExecutionError::ProtocolError(message)) => {
                warn!("{message}");
                let id = Reply::decode(envelope)?.id();
                Reply::Throw {
                    id,
                    value: Value::Error(RemoteError::new(ErrorKind::Type, message)),
                }
                .encode()
                .to_json_line()?
            }
            Err(e) => return Err(e),
        };
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
        output.flush().await?;
    }
    Ok(())
}
