//! TCP newline-delimited-JSON `Transport` (§6 Design Notes "Dynamic dispatch
//! across hosted/native builds"). One connection per external Controller;
//! each line in is an `Invocation`, each line out an `InvocationResult`.
//!
//! Grounded on `faas-guest-agent/src/main.rs`'s accept-loop-over-TcpListener
//! shape, adapted from its single-shot command protocol to a persistent
//! bidirectional stream of invocations/results.

use std::sync::Arc;

use async_trait::async_trait;
use faas_common::{Invocation, InvocationResult};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};

/// Accepts exactly one Controller connection at a time. Lines received on
/// that connection are decoded as `Invocation`s and handed to the engine's
/// work queue; `InvocationResult`s are serialized back out as they complete.
pub struct TcpNdjsonTransport {
    inbound: Mutex<mpsc::Receiver<Invocation>>,
    outbound: mpsc::Sender<InvocationResult>,
}

impl TcpNdjsonTransport {
    /// Binds `addr` and spawns the accept loop. Returns once the listener is
    /// bound; connection handling happens in the background for the
    /// transport's lifetime.
    pub async fn bind(addr: &str) -> std::io::Result<Arc<Self>> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "transport listening for controller connections");

        let (in_tx, in_rx) = mpsc::channel(256);
        let (out_tx, out_rx) = mpsc::channel::<InvocationResult>(256);

        tokio::spawn(accept_loop(listener, in_tx, out_rx));

        Ok(Arc::new(Self {
            inbound: Mutex::new(in_rx),
            outbound: out_tx,
        }))
    }
}

#[async_trait]
impl faas_executor::Transport for TcpNdjsonTransport {
    async fn accept_invocation(&self) -> Option<Invocation> {
        self.inbound.lock().await.recv().await
    }

    async fn deliver_result(&self, result: InvocationResult) {
        if self.outbound.send(result).await.is_err() {
            warn!(transaction_id = %result.info.transaction_id, "no controller connected to deliver result to");
        }
    }
}

/// One connection at a time: the most recent connection replaces whatever
/// was there before, matching a single active Controller per host.
async fn accept_loop(
    listener: TcpListener,
    in_tx: mpsc::Sender<Invocation>,
    mut out_rx: mpsc::Receiver<InvocationResult>,
) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!(error = %e, "controller accept failed");
                continue;
            }
        };
        info!(%peer, "controller connected");
        let (read_half, write_half) = stream.into_split();

        let in_tx = in_tx.clone();
        let reader_task = tokio::spawn(read_invocations(read_half, in_tx));

        // Drains results onto this connection until the reader observes EOF
        // and the task above completes, at which point we drop the writer
        // and accept the next Controller.
        let writer_task = tokio::spawn(async move {
            let mut write_half = write_half;
            while let Some(result) = out_rx.recv().await {
                if let Err(e) = write_line(&mut write_half, &result).await {
                    warn!(error = %e, "failed writing result to controller");
                    return out_rx;
                }
            }
            out_rx
        });

        let _ = reader_task.await;
        out_rx = match writer_task.await {
            Ok(rx) => rx,
            Err(_) => return,
        };
    }
}

async fn read_invocations(
    read_half: tokio::net::tcp::OwnedReadHalf,
    in_tx: mpsc::Sender<Invocation>,
) {
    let mut lines = BufReader::new(read_half).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match serde_json::from_str::<Invocation>(&line) {
                Ok(inv) => {
                    if in_tx.send(inv).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!(error = %e, "dropping malformed invocation line"),
            },
            Ok(None) => return,
            Err(e) => {
                warn!(error = %e, "error reading from controller connection");
                return;
            }
        }
    }
}

async fn write_line(
    write_half: &mut tokio::net::tcp::OwnedWriteHalf,
    result: &InvocationResult,
) -> std::io::Result<()> {
    let mut line = serde_json::to_string(result).map_err(std::io::Error::other)?;
    line.push('\n');
    write_half.write_all(line.as_bytes()).await
}
