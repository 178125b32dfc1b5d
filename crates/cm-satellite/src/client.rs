//! Satellite side: forwards resource calls to the primary

use crate::protocol::{RpcFault, RpcOutcome, RpcRequest, RpcResponse, RpcResult};
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Removes a call's pending entry when the caller stops waiting
///
/// Covers callers that drop the call future, e.g. under their own timeout.
struct PendingCall<'a> {
    pending: &'a DashMap<u64, oneshot::Sender<RpcOutcome>>,
    request_id: u64,
}

impl Drop for PendingCall<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

/// Correlates outgoing calls with their responses
///
/// Any number of calls may be in flight on one channel. Calls are sent at
/// most once; a fault is returned to the caller, never retried here.
pub struct SatelliteClient {
    next_id: AtomicU64,
    pending: DashMap<u64, oneshot::Sender<RpcOutcome>>,
    outgoing: mpsc::UnboundedSender<RpcRequest>,
    closed: AtomicBool,
}

impl SatelliteClient {
    /// Create a client and the queue of requests it wants sent
    ///
    /// The caller drains the receiver onto the wire and feeds responses back
    /// through [`handle_response`](Self::handle_response).
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<RpcRequest>) {
        let (outgoing, requests) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            next_id: AtomicU64::new(1),
            pending: DashMap::new(),
            outgoing,
            closed: AtomicBool::new(false),
        });
        (client, requests)
    }

    /// Call `method` on the primary's resource `resource_id`
    ///
    /// Waits indefinitely; see [`call_with_timeout`](Self::call_with_timeout).
    pub async fn call_resource_rpc(
        &self,
        resource_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> RpcResult<Value> {
        let (request_id, response) = self.send(resource_id, method, args)?;
        let _pending = PendingCall {
            pending: &self.pending,
            request_id,
        };
        match response.await {
            Ok(outcome) => outcome.into(),
            // Sender dropped by fail_all
            Err(_) => Err(RpcFault::ChannelClosed),
        }
    }

    /// Like [`call_resource_rpc`](Self::call_resource_rpc), failing with
    /// [`RpcFault::Timeout`] after `timeout`
    ///
    /// A timed-out call may still have run on the primary.
    pub async fn call_with_timeout(
        &self,
        timeout: Duration,
        resource_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> RpcResult<Value> {
        let (request_id, response) = self.send(resource_id, method, args)?;
        let _pending = PendingCall {
            pending: &self.pending,
            request_id,
        };
        match tokio::time::timeout(timeout, response).await {
            Ok(Ok(outcome)) => outcome.into(),
            Ok(Err(_)) => Err(RpcFault::ChannelClosed),
            Err(_) => {
                warn!(request_id = request_id, method = %method, "Remote call timed out");
                Err(RpcFault::Timeout)
            }
        }
    }

    fn send(
        &self,
        resource_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> RpcResult<(u64, oneshot::Receiver<RpcOutcome>)> {
        if self.is_closed() {
            return Err(RpcFault::ChannelClosed);
        }

        let request_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id, tx);

        // fail_all may have drained the table between the check and the insert
        if self.is_closed() {
            self.pending.remove(&request_id);
            return Err(RpcFault::ChannelClosed);
        }

        trace!(request_id = request_id, resource_id = %resource_id, method = %method, "Sending remote call");
        let request = RpcRequest {
            request_id,
            resource_id: resource_id.to_string(),
            method: method.to_string(),
            args,
        };
        if self.outgoing.send(request).is_err() {
            self.pending.remove(&request_id);
            return Err(RpcFault::ChannelClosed);
        }
        Ok((request_id, rx))
    }

    /// Complete the call `response` answers
    ///
    /// Returns false for unknown or already completed request ids.
    pub fn handle_response(&self, response: RpcResponse) -> bool {
        match self.pending.remove(&response.request_id) {
            Some((_, tx)) => tx.send(response.outcome).is_ok(),
            None => {
                debug!(request_id = response.request_id, "Response for unknown request");
                false
            }
        }
    }

    /// Close the client and fail every pending call with
    /// [`RpcFault::ChannelClosed`]
    pub fn fail_all(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        let count = ids.len();
        for id in ids {
            if let Some((_, tx)) = self.pending.remove(&id) {
                let _ = tx.send(RpcOutcome::Fault(RpcFault::ChannelClosed));
            }
        }
        if count > 0 {
            warn!(count = count, "Failed pending remote calls, channel closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outgoing.is_closed()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// Handle to one remote resource
///
/// Building block for the remote half of a capability trait: the local
/// implementation acts on the device, the remote one forwards through this.
#[derive(Clone)]
pub struct RemoteResource {
    client: Arc<SatelliteClient>,
    id: String,
}

impl RemoteResource {
    pub fn new(client: Arc<SatelliteClient>, id: impl Into<String>) -> Self {
        Self {
            client,
            id: id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> RpcResult<Value> {
        self.client.call_resource_rpc(&self.id, method, args).await
    }

    /// Call and decode the result
    pub async fn call_as<T: DeserializeOwned>(&self, method: &str, args: Vec<Value>) -> RpcResult<T> {
        let value = self.call(method, args).await?;
        serde_json::from_value(value).map_err(RpcFault::handler_failed)
    }
}

impl std::fmt::Debug for RemoteResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteResource").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_concurrent_calls_correlated() {
        let (client, mut requests) = SatelliteClient::new();

        let first = {
            let client = client.clone();
            tokio::spawn(async move { client.call_resource_rpc("a", "one", vec![]).await })
        };
        let second = {
            let client = client.clone();
            tokio::spawn(async move { client.call_resource_rpc("b", "two", vec![json!(2)]).await })
        };

        let mut received = vec![requests.recv().await.unwrap(), requests.recv().await.unwrap()];
        received.sort_by_key(|r| r.request_id);
        assert_eq!(client.pending_count(), 2);

        // Answer out of order
        for request in received.iter().rev() {
            let answer = json!(format!("{}:{}", request.resource_id, request.method));
            assert!(client.handle_response(RpcResponse::new(request.request_id, Ok(answer))));
        }

        let mut results = vec![first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];
        results.sort_by_key(|v| v.to_string());
        assert_eq!(results, vec![json!("a:one"), json!("b:two")]);
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fault_returned_to_caller() {
        let (client, mut requests) = SatelliteClient::new();
        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.call_resource_rpc("a", "nope", vec![]).await })
        };

        let request = requests.recv().await.unwrap();
        client.handle_response(RpcResponse::new(
            request.request_id,
            Err(RpcFault::UnknownMethod {
                kind_name: "Plug".into(),
                method: "nope".into(),
            }),
        ));

        assert!(matches!(
            call.await.unwrap(),
            Err(RpcFault::UnknownMethod { method, .. }) if method == "nope"
        ));
    }

    #[tokio::test]
    async fn test_fail_all_closes() {
        let (client, mut requests) = SatelliteClient::new();
        let call = {
            let client = client.clone();
            tokio::spawn(async move { client.call_resource_rpc("a", "wait", vec![]).await })
        };
        requests.recv().await.unwrap();

        client.fail_all();

        assert_eq!(call.await.unwrap(), Err(RpcFault::ChannelClosed));
        assert_eq!(
            client.call_resource_rpc("a", "again", vec![]).await,
            Err(RpcFault::ChannelClosed)
        );
    }

    #[tokio::test]
    async fn test_dropped_transport_fails_fast() {
        let (client, requests) = SatelliteClient::new();
        drop(requests);

        assert_eq!(
            client.call_resource_rpc("a", "ping", vec![]).await,
            Err(RpcFault::ChannelClosed)
        );
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_with_timeout() {
        let (client, _requests) = SatelliteClient::new();

        let result = client
            .call_with_timeout(Duration::from_secs(2), "a", "slow", vec![])
            .await;

        assert_eq!(result, Err(RpcFault::Timeout));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_calls_release_pending() {
        let (client, _requests) = SatelliteClient::new();

        for _ in 0..100 {
            let call = client.call_resource_rpc("a", "slow", vec![]);
            assert!(tokio::time::timeout(Duration::from_secs(1), call).await.is_err());
        }

        assert_eq!(client.pending_count(), 0);
    }

    #[test]
    fn test_late_response_ignored() {
        let (client, _requests) = SatelliteClient::new();
        assert!(!client.handle_response(RpcResponse::new(99, Ok(json!(null)))));
    }
}
