//! The environment ties the store, the publish queue and in-flight executions together.
//!
//! Network transport is the caller's concern: an execution is started with [Environment::execute]
//! and each response the transport receives for it is handed to [Environment::on_payload]. The
//! environment normalizes the response, routes incremental chunks through the execution's
//! [IncrementalState], commits the result through the publish queue and returns what changed.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    fmt::{Display, Formatter},
    sync::Arc,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
    check::Availability,
    config::StoreConfig,
    error::StoreError,
    event::StoreEvent,
    handlers::FieldHandler,
    incremental::IncrementalState,
    normalize::{
        normalize_data, normalize_response, GraphQLResponse, NormalizationSelector,
        NormalizeOptions,
    },
    operation::{OperationKind, OperationRequest, ReaderSelector, RequestIdentifier},
    publish::{
        OptimisticUpdate, OptimisticUpdateId, OptimisticUpdater, PublishQueue, RunResult,
        StoreUpdater,
    },
    reader::Snapshot,
    record::{format_path, DataId, ROOT_TYPE},
    resolver::ResolverContext,
    store::{Store, SubscriptionId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ExecutionId(u64);

impl Display for ExecutionId {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "exec#{}", self.0)
    }
}

struct Execution {
    request: OperationRequest,
    incremental: IncrementalState,
    optimistic: Option<OptimisticUpdateId>,
    updater: Option<StoreUpdater>,
}

pub struct Environment {
    queue: PublishQueue,
    executions: BTreeMap<ExecutionId, Execution>,
    next_execution: u64,
}

impl Environment {
    pub fn new(config: StoreConfig) -> Self {
        Environment::with_store(Store::new(config, None))
    }

    /// An environment that reports store events on `tx`.
    pub fn with_events(config: StoreConfig, tx: UnboundedSender<StoreEvent>) -> Self {
        Environment::with_store(Store::new(config, Some(tx)))
    }

    pub fn with_store(store: Store) -> Self {
        Environment {
            queue: PublishQueue::new(store),
            executions: BTreeMap::new(),
            next_execution: 0,
        }
    }

    pub fn store(&self) -> &Store {
        self.queue.store()
    }

    pub fn register_resolver<F>(&self, name: &str, resolver: F)
    where
        F: Fn(&ResolverContext<'_>) -> Result<Value, StoreError> + Send + Sync + 'static,
    {
        self.queue.store().resolvers().register(name, resolver);
    }

    pub fn register_handler(&mut self, name: &str, handler: Arc<dyn FieldHandler>) {
        self.queue.handlers_mut().register(name, handler);
    }

    pub fn lookup(&self, selector: &ReaderSelector) -> Result<Snapshot, StoreError> {
        self.queue.store().lookup(selector)
    }

    /// Read `selector` and keep `callback` informed of every later change to the result.
    pub fn subscribe<F>(
        &mut self,
        selector: &ReaderSelector,
        callback: F,
    ) -> Result<(Snapshot, SubscriptionId), StoreError>
    where
        F: FnMut(&Snapshot) + Send + 'static,
    {
        let snapshot = self.lookup(selector)?;
        let id = self
            .queue
            .store_mut()
            .subscribe(snapshot.clone(), Box::new(callback));
        Ok((snapshot, id))
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.queue.store_mut().unsubscribe(id)
    }

    pub fn retain(&mut self, request: &OperationRequest) -> RequestIdentifier {
        self.queue.store_mut().retain(request)
    }

    pub fn release(&mut self, identifier: &RequestIdentifier) {
        self.queue.store_mut().release(identifier)
    }

    pub fn gc(&mut self) -> Vec<DataId> {
        self.queue.store_mut().gc()
    }

    pub fn check(&self, request: &OperationRequest) -> Availability {
        self.queue.store().check(request)
    }

    /// Start tracking an execution of `request`.
    pub fn execute(&mut self, request: OperationRequest) -> ExecutionId {
        let id = ExecutionId(self.next_execution);
        self.next_execution += 1;
        tracing::debug!("Executing {} as {id}", request.operation.name);
        self.executions.insert(
            id,
            Execution {
                request,
                incremental: IncrementalState::new(),
                optimistic: None,
                updater: None,
            },
        );
        id
    }

    /// Start a mutation. The optimistic response and updater, if any, are applied immediately
    /// and stay applied until the server responds or the execution fails. `updater` runs once,
    /// after the server response is committed.
    pub fn execute_mutation(
        &mut self,
        request: OperationRequest,
        optimistic_response: Option<Value>,
        optimistic_updater: Option<OptimisticUpdater>,
        updater: Option<StoreUpdater>,
    ) -> Result<(ExecutionId, RunResult), StoreError> {
        let update = match (optimistic_response, optimistic_updater) {
            (None, None) => None,
            (None, Some(optimistic)) => Some(OptimisticUpdate::Updater(optimistic)),
            (Some(data), optimistic) => {
                let options = NormalizeOptions::for_operation(
                    self.queue.store().config(),
                    &request.operation,
                );
                let payload = normalize_data(
                    self.queue.store().source(),
                    &root_selector(&request),
                    &data,
                    Vec::new(),
                    &[],
                    &options,
                )?;
                Some(OptimisticUpdate::Payload {
                    payload: Arc::new(payload),
                    updater: optimistic,
                })
            }
        };
        let id = self.execute(request);
        let optimistic = update.map(|update| self.queue.apply_update(update));
        if let Some(execution) = self.executions.get_mut(&id) {
            execution.optimistic = optimistic;
            execution.updater = updater;
        }
        let result = match optimistic {
            Some(_) => self.queue.run()?,
            None => RunResult::default(),
        };
        Ok((id, result))
    }

    pub fn is_active(&self, id: ExecutionId) -> bool {
        self.executions.contains_key(&id)
    }

    /// Deferred selections of an execution still waiting for data, as `(label, path)`.
    pub fn pending_incremental(&self, id: ExecutionId) -> Vec<(String, String)> {
        self.executions
            .get(&id)
            .map(|execution| execution.incremental.pending())
            .unwrap_or_default()
    }

    /// Commit one server response for `id`. Responses for executions that were cancelled or
    /// completed are dropped. A query or mutation whose response has no further chunks coming is
    /// completed automatically, and a bare `{"hasNext": false}` completes any execution.
    pub fn on_payload(
        &mut self,
        id: ExecutionId,
        response: GraphQLResponse,
    ) -> Result<RunResult, StoreError> {
        if !response.is_incremental()
            && response.data.is_none()
            && response.errors.is_empty()
            && !response.has_next
        {
            tracing::debug!("{id} closed by an empty final response");
            return self.complete(id);
        }
        let Some(execution) = self.executions.get_mut(&id) else {
            tracing::debug!("Dropping payload for inactive execution {id}");
            return Ok(RunResult::default());
        };
        let options = NormalizeOptions::for_operation(
            self.queue.store().config(),
            &execution.request.operation,
        );

        let (payload, updater) = if response.is_incremental() {
            let Some(payload) =
                execution
                    .incremental
                    .process(self.queue.store().source(), &response, &options)?
            else {
                return Ok(RunResult::default());
            };
            (payload, None)
        } else {
            let payload = normalize_response(
                self.queue.store().source(),
                &response,
                &root_selector(&execution.request),
                &options,
            )?;
            if let Some(optimistic) = execution.optimistic.take() {
                self.queue.revert_update(optimistic);
            }
            (payload, execution.updater.take())
        };

        let orphans = execution.incremental.register(payload.incremental.clone());
        let subscription = execution.request.operation.kind == OperationKind::Subscription;
        let done =
            !response.has_next && !subscription && execution.incremental.pending().is_empty();

        self.queue.commit_payload(payload, updater);
        let mut result = self.queue.run()?;
        if let (Some(label), Some(path)) = (response.label.as_ref(), response.path.as_ref()) {
            self.queue.store_mut().emit(StoreEvent::IncrementalApplied {
                label: label.clone(),
                path: format_path(path),
            });
        }
        for orphan in orphans.into_iter() {
            result.merge(self.on_payload(id, orphan)?);
        }
        if done && self.executions.remove(&id).is_some() {
            tracing::debug!("Completed {id}");
        }
        Ok(result)
    }

    /// The transport failed. Any optimistic update of the execution is rolled back and the
    /// execution is dropped.
    pub fn on_error(
        &mut self,
        id: ExecutionId,
        error: &StoreError,
    ) -> Result<RunResult, StoreError> {
        tracing::warn!("Execution {id} failed: {error}");
        self.finish(id)
    }

    /// Stop an execution. Later responses for it are ignored and any optimistic update it
    /// applied is rolled back.
    pub fn cancel(&mut self, id: ExecutionId) -> Result<RunResult, StoreError> {
        tracing::debug!("Cancelling {id}");
        self.finish(id)
    }

    /// Mark an execution complete, e.g. a subscription whose transport closed.
    pub fn complete(&mut self, id: ExecutionId) -> Result<RunResult, StoreError> {
        if let Some(execution) = self.executions.get(&id) {
            let pending = execution.incremental.pending();
            if !pending.is_empty() {
                tracing::warn!(
                    "Completing {id} with {} deferred selections unfulfilled",
                    pending.len()
                );
            }
        }
        self.finish(id)
    }

    fn finish(&mut self, id: ExecutionId) -> Result<RunResult, StoreError> {
        let Some(execution) = self.executions.remove(&id) else {
            return Ok(RunResult::default());
        };
        match execution.optimistic {
            Some(optimistic) => {
                self.queue.revert_update(optimistic);
                self.queue.run()
            }
            None => Ok(RunResult::default()),
        }
    }

    /// Commit an imperative write.
    pub fn commit_update(&mut self, updater: StoreUpdater) -> Result<RunResult, StoreError> {
        self.queue.commit_update(updater);
        self.queue.run()
    }

    /// Normalize and commit a response for `request` without an execution, e.g. data loaded from
    /// elsewhere.
    pub fn commit_payload(
        &mut self,
        request: &OperationRequest,
        response: &GraphQLResponse,
    ) -> Result<RunResult, StoreError> {
        let options =
            NormalizeOptions::for_operation(self.queue.store().config(), &request.operation);
        let payload = normalize_response(
            self.queue.store().source(),
            response,
            &root_selector(request),
            &options,
        )?;
        self.queue.commit_payload(payload, None);
        self.queue.run()
    }

    pub fn apply_update(
        &mut self,
        updater: OptimisticUpdater,
    ) -> Result<(OptimisticUpdateId, RunResult), StoreError> {
        let id = self.queue.apply_update(OptimisticUpdate::Updater(updater));
        let result = self.queue.run()?;
        Ok((id, result))
    }

    pub fn revert_update(&mut self, id: OptimisticUpdateId) -> Result<RunResult, StoreError> {
        if !self.queue.revert_update(id) {
            tracing::debug!("{id} was not applied");
            return Ok(RunResult::default());
        }
        self.queue.run()
    }
}

fn root_selector(request: &OperationRequest) -> NormalizationSelector {
    NormalizationSelector {
        data_id: request.root_id(),
        typename: ROOT_TYPE.to_string(),
        selections: request.normalization_selections().to_vec(),
        variables: request.variables.clone(),
    }
}
