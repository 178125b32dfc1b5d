//! Primary side: executes calls forwarded by satellites

use crate::protocol::{RpcFault, RpcRequest, RpcResponse, RpcResult};
use crate::{SatelliteError, SatelliteResult};
use cm_core::panic_message;
use cm_resources::{Resource, ResourceStorage};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

/// Future type for remote method handlers
pub type RpcFuture = Pin<Box<dyn Future<Output = RpcResult<Value>> + Send>>;

/// Remote method handler: `(resource, args) -> result`
pub type RpcMethod<R> = Arc<dyn Fn(Arc<R>, Vec<Value>) -> RpcFuture + Send + Sync>;

/// Methods a resource kind exposes to satellites
pub struct RpcTable<R> {
    methods: HashMap<String, RpcMethod<R>>,
}

impl<R: Resource> RpcTable<R> {
    pub fn new() -> Self {
        Self {
            methods: HashMap::new(),
        }
    }

    /// Expose `name`; a later registration of the same name replaces it
    pub fn method<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Arc<R>, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RpcResult<Value>> + Send + 'static,
    {
        let handler: RpcMethod<R> = Arc::new(move |resource: Arc<R>, args: Vec<Value>| {
            Box::pin(handler(resource, args)) as RpcFuture
        });
        self.methods.insert(name.into(), handler);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    /// Exposed method names, sorted
    pub fn method_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.methods.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl<R: Resource> Default for RpcTable<R> {
    fn default() -> Self {
        Self::new()
    }
}

/// One resource kind's storage and method table, type-erased
trait RpcSlot: Send + Sync {
    fn kind(&self) -> &'static str;
    fn contains(&self, id: &str) -> bool;
    fn call(&self, id: &str, method: &str, args: Vec<Value>) -> RpcResult<RpcFuture>;
}

struct Slot<R: Resource> {
    storage: Arc<ResourceStorage<R>>,
    table: RpcTable<R>,
}

impl<R: Resource> RpcSlot for Slot<R> {
    fn kind(&self) -> &'static str {
        R::KIND
    }

    fn contains(&self, id: &str) -> bool {
        self.storage.contains(id)
    }

    fn call(&self, id: &str, method: &str, args: Vec<Value>) -> RpcResult<RpcFuture> {
        let handler = self
            .table
            .methods
            .get(method)
            .ok_or_else(|| RpcFault::UnknownMethod {
                kind_name: R::KIND.to_string(),
                method: method.to_string(),
            })?;
        // Deleted since the slot lookup
        let resource = self
            .storage
            .get_by_id(id)
            .ok_or_else(|| RpcFault::UnknownResource { id: id.to_string() })?;
        Ok(handler(resource, args))
    }
}

/// Dispatches satellite requests to the canonical resources
///
/// Only kinds with a slot handler are callable; resources of other kinds
/// are reported as unknown.
#[derive(Default)]
pub struct SatelliteHost {
    slots: DashMap<&'static str, Arc<dyn RpcSlot>>,
}

impl SatelliteHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make resources in `storage` callable through `table`
    #[instrument(skip(self, storage, table), fields(kind = R::KIND))]
    pub fn define_slot_handler<R: Resource>(
        &self,
        storage: Arc<ResourceStorage<R>>,
        table: RpcTable<R>,
    ) -> SatelliteResult<()> {
        match self.slots.entry(R::KIND) {
            Entry::Occupied(_) => Err(SatelliteError::KindAlreadyDefined(R::KIND)),
            Entry::Vacant(slot) => {
                debug!(kind = R::KIND, methods = ?table.method_names(), "Defining slot handler");
                slot.insert(Arc::new(Slot { storage, table }));
                Ok(())
            }
        }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.slots.iter().map(|entry| *entry.key()).collect();
        kinds.sort_unstable();
        kinds
    }

    fn slot_for(&self, resource_id: &str) -> Option<Arc<dyn RpcSlot>> {
        self.slots
            .iter()
            .find(|entry| entry.value().contains(resource_id))
            .map(|entry| entry.value().clone())
    }

    /// Run one request to completion
    ///
    /// Handler errors and panics become faults; nothing here is retried.
    #[instrument(skip(self, request), fields(request_id = request.request_id, method = %request.method))]
    pub async fn dispatch(&self, request: RpcRequest) -> RpcResponse {
        let RpcRequest {
            request_id,
            resource_id,
            method,
            args,
        } = request;

        let call = self
            .slot_for(&resource_id)
            .ok_or_else(|| RpcFault::UnknownResource {
                id: resource_id.clone(),
            })
            .and_then(|slot| slot.call(&resource_id, &method, args));

        let outcome = match call {
            Ok(future) => match AssertUnwindSafe(future).catch_unwind().await {
                Ok(result) => result,
                Err(payload) => Err(RpcFault::handler_failed(format!(
                    "panicked: {}",
                    panic_message(payload)
                ))),
            },
            Err(fault) => Err(fault),
        };

        if let Err(fault) = &outcome {
            warn!(resource_id = %resource_id, method = %method, fault = %fault, "Remote call failed");
        }
        RpcResponse::new(request_id, outcome)
    }
}
