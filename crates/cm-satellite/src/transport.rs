//! Line-delimited JSON over any byte stream (process stdio, sockets)

use crate::client::SatelliteClient;
use crate::host::SatelliteHost;
use crate::protocol::{RpcFault, RpcRequest, RpcResponse};
use crate::{SatelliteError, SatelliteResult};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const IN_MEMORY_BUFFER: usize = 64 * 1024;

async fn write_lines<W, T>(mut writer: W, mut messages: mpsc::UnboundedReceiver<T>) -> SatelliteResult<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    while let Some(message) = messages.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Serve satellite requests read from `reader`, answering on `writer`
///
/// Each request is dispatched on its own task, so a slow handler does not
/// hold up the others. Returns once the reader hits EOF and every
/// in-flight request has been answered. A line that cannot be tied to a
/// request id ends the connection with [`SatelliteError::Codec`], so the
/// satellite fails its pending calls instead of waiting on them.
pub async fn serve_stream<Rd, Wr>(host: Arc<SatelliteHost>, reader: Rd, writer: Wr) -> SatelliteResult<()>
where
    Rd: AsyncRead + Unpin + Send + 'static,
    Wr: AsyncWrite + Unpin + Send + 'static,
{
    let (responses, outgoing) = mpsc::unbounded_channel::<RpcResponse>();
    let writer = tokio::spawn(write_lines(writer, outgoing));
    let mut lines = BufReader::new(reader).lines();

    let mut violation = None;

    info!("Serving satellite requests");
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RpcRequest>(&line) {
            Ok(request) => {
                let host = host.clone();
                let responses = responses.clone();
                tokio::spawn(async move {
                    let response = host.dispatch(request).await;
                    let _ = responses.send(response);
                });
            }
            Err(e) => {
                // Answer if the request id is recoverable, so the caller does not hang
                let request_id = serde_json::from_str::<Value>(&line)
                    .ok()
                    .and_then(|value| value.get("request_id").and_then(Value::as_u64));
                warn!(request_id = ?request_id, error = %e, "Malformed satellite request");
                let Some(request_id) = request_id else {
                    warn!("Closing satellite connection, request cannot be answered");
                    violation = Some(e);
                    break;
                };
                let fault = RpcFault::MalformedRequest {
                    message: e.to_string(),
                };
                let _ = responses.send(RpcResponse::new(request_id, Err(fault)));
            }
        }
    }

    debug!("Satellite stream closed, draining responses");
    drop(responses);
    let written = match writer.await {
        Ok(result) => result,
        Err(e) => {
            warn!(error = %e, "Response writer task failed");
            Ok(())
        }
    };
    match violation {
        Some(e) => Err(SatelliteError::Codec(e)),
        None => written,
    }
}

/// Connect a client over a byte stream to a primary
///
/// The returned task reads responses until EOF, then fails every pending
/// call with [`RpcFault::ChannelClosed`].
pub fn connect_stream<Rd, Wr>(reader: Rd, writer: Wr) -> (Arc<SatelliteClient>, JoinHandle<()>)
where
    Rd: AsyncRead + Unpin + Send + 'static,
    Wr: AsyncWrite + Unpin + Send + 'static,
{
    let (client, requests) = SatelliteClient::new();

    {
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = write_lines(writer, requests).await {
                warn!(error = %e, "Satellite request writer failed");
                client.fail_all();
            }
        });
    }

    let reader_task = {
        let client = client.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) if line.trim().is_empty() => {}
                    Ok(Some(line)) => match serde_json::from_str::<RpcResponse>(&line) {
                        Ok(response) => {
                            client.handle_response(response);
                        }
                        Err(e) => warn!(error = %e, "Malformed satellite response"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "Satellite response stream failed");
                        break;
                    }
                }
            }
            client.fail_all();
        })
    };

    (client, reader_task)
}

/// Connect a client to `host` inside one process
pub fn connect_in_memory(host: Arc<SatelliteHost>) -> (Arc<SatelliteClient>, JoinHandle<()>) {
    let (satellite_end, primary_end) = tokio::io::duplex(IN_MEMORY_BUFFER);

    let (primary_read, primary_write) = tokio::io::split(primary_end);
    tokio::spawn(async move {
        if let Err(e) = serve_stream(host, primary_read, primary_write).await {
            warn!(error = %e, "In-memory satellite host failed");
        }
    });

    let (satellite_read, satellite_write) = tokio::io::split(satellite_end);
    connect_stream(satellite_read, satellite_write)
}
