//! State containers around the remote operations.
//!
//! Each container tracks `{data, loading, error}` for one operation the way
//! a UI binding would, without depending on any particular UI runtime: the
//! host polls [`snapshot`](OperationState::snapshot) after awaiting an
//! action, and re-fetch-on-changed-inputs is an explicit `sync` call using
//! structural equality.
//!
//! Invocations carry a sequence number; a completion that has been
//! superseded by a newer invocation is discarded, so rapid re-invocation can
//! never leave an older result on top of a newer one. There is no
//! cancellation of the in-flight request itself.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use secrecy::SecretString;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::auth::{identity_is_authenticated, LoginResponse};
use crate::client::{ClientError, FrappeClient};
use crate::db::ListOptions;

/// Point-in-time view of a tracked operation.
#[derive(Clone, Debug)]
pub struct StateSnapshot<T> {
    /// Result of the most recent completed invocation, if any.
    pub data: Option<T>,
    /// Whether an invocation is in flight.
    pub loading: bool,
    /// Error of the most recent completed invocation, cleared when a new
    /// invocation starts.
    pub error: Option<Arc<ClientError>>,
}

/// Shared loading/error/result cell driving every container in this module.
#[derive(Clone)]
pub struct OperationState<T> {
    shared: Arc<Mutex<StateInner<T>>>,
}

struct StateInner<T> {
    data: Option<T>,
    loading: bool,
    error: Option<Arc<ClientError>>,
    seq: u64,
}

impl<T: Clone> OperationState<T> {
    /// Operations that fetch on first use start with `loading = true`;
    /// user-triggered ones start idle.
    pub fn new(initially_loading: bool) -> Self {
        Self {
            shared: Arc::new(Mutex::new(StateInner {
                data: None,
                loading: initially_loading,
                error: None,
                seq: 0,
            })),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot<T> {
        let inner = self.lock();
        StateSnapshot {
            data: inner.data.clone(),
            loading: inner.loading,
            error: inner.error.clone(),
        }
    }

    /// Drives one invocation: marks loading and clears the prior error, then
    /// stores the outcome. The error is both stored and returned so a caller
    /// awaiting the action still observes failure. Superseded completions
    /// leave the state to the newer invocation.
    pub async fn run<Fut>(&self, operation: Fut) -> Result<T, Arc<ClientError>>
    where
        Fut: Future<Output = Result<T, ClientError>>,
    {
        let my_seq = {
            let mut inner = self.lock();
            inner.seq += 1;
            inner.loading = true;
            inner.error = None;
            inner.seq
        };

        let result = operation.await;

        let mut inner = self.lock();
        let latest = inner.seq == my_seq;
        match result {
            Ok(value) => {
                if latest {
                    inner.data = Some(value.clone());
                    inner.loading = false;
                }
                Ok(value)
            }
            Err(error) => {
                let error = Arc::new(error);
                if latest {
                    inner.error = Some(Arc::clone(&error));
                    inner.loading = false;
                }
                Err(error)
            }
        }
    }

    /// Overwrites the stored result outside an invocation.
    pub(crate) fn store(&self, value: T) {
        let mut inner = self.lock();
        inner.data = Some(value);
        inner.error = None;
        inner.loading = false;
    }

    fn lock(&self) -> MutexGuard<'_, StateInner<T>> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Tracked fetch of a single document.
pub struct DocResource<T> {
    client: FrappeClient,
    doctype: String,
    name: String,
    state: OperationState<T>,
}

impl<T> DocResource<T>
where
    T: DeserializeOwned + Clone,
{
    pub fn new(
        client: FrappeClient,
        doctype: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            client,
            doctype: doctype.into(),
            name: name.into(),
            state: OperationState::new(true),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot<T> {
        self.state.snapshot()
    }

    pub async fn fetch(&self) -> Result<T, Arc<ClientError>> {
        self.state
            .run(self.client.get_doc(&self.doctype, &self.name))
            .await
    }

    /// Refetches only when the target changed; returns `None` when the
    /// inputs are structurally identical to the current ones.
    pub async fn sync(
        &mut self,
        doctype: &str,
        name: &str,
    ) -> Option<Result<T, Arc<ClientError>>> {
        if self.doctype == doctype && self.name == name {
            return None;
        }
        self.doctype = doctype.to_string();
        self.name = name.to_string();
        Some(self.fetch().await)
    }
}

/// Tracked fetch of a document list.
pub struct ListResource<T> {
    client: FrappeClient,
    doctype: String,
    options: ListOptions,
    state: OperationState<Vec<T>>,
}

impl<T> ListResource<T>
where
    T: DeserializeOwned + Clone,
{
    pub fn new(client: FrappeClient, doctype: impl Into<String>, options: ListOptions) -> Self {
        Self {
            client,
            doctype: doctype.into(),
            options,
            state: OperationState::new(true),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot<Vec<T>> {
        self.state.snapshot()
    }

    pub async fn fetch(&self) -> Result<Vec<T>, Arc<ClientError>> {
        self.state
            .run(self.client.get_list(&self.doctype, &self.options))
            .await
    }

    /// Refetches only when the options changed structurally.
    pub async fn sync(
        &mut self,
        options: ListOptions,
    ) -> Option<Result<Vec<T>, Arc<ClientError>>> {
        if self.options == options {
            return None;
        }
        self.options = options;
        Some(self.fetch().await)
    }
}

/// Tracked invocation of a whitelisted server method.
pub struct MethodCall<T> {
    client: FrappeClient,
    method: String,
    params: Value,
    state: OperationState<T>,
}

impl<T> MethodCall<T>
where
    T: DeserializeOwned + Clone,
{
    pub fn new(client: FrappeClient, method: impl Into<String>, params: Value) -> Self {
        Self {
            client,
            method: method.into(),
            params,
            state: OperationState::new(false),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot<T> {
        self.state.snapshot()
    }

    pub async fn execute(&self) -> Result<T, Arc<ClientError>> {
        self.invoke(self.params.clone()).await
    }

    /// Executes with overrides merged over the base parameters.
    pub async fn execute_with(&self, overrides: Value) -> Result<T, Arc<ClientError>> {
        self.invoke(merge_params(&self.params, overrides)).await
    }

    /// Replaces the base parameters and re-executes when they changed.
    pub async fn sync_params(&mut self, params: Value) -> Option<Result<T, Arc<ClientError>>> {
        if self.params == params {
            return None;
        }
        self.params = params;
        Some(self.execute().await)
    }

    async fn invoke(&self, params: Value) -> Result<T, Arc<ClientError>> {
        self.state
            .run(async { self.client.call(&self.method, &params).await })
            .await
    }
}

/// Tracked create/update/remove on one doctype, sharing a single
/// loading/error cell across the three actions.
pub struct CrudHandle {
    client: FrappeClient,
    doctype: String,
    state: OperationState<Value>,
}

impl CrudHandle {
    pub fn new(client: FrappeClient, doctype: impl Into<String>) -> Self {
        Self {
            client,
            doctype: doctype.into(),
            state: OperationState::new(false),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot<Value> {
        self.state.snapshot()
    }

    pub async fn create(&self, doc: &Value) -> Result<Value, Arc<ClientError>> {
        self.state
            .run(self.client.create_doc(&self.doctype, doc))
            .await
    }

    pub async fn update(&self, name: &str, patch: &Value) -> Result<Value, Arc<ClientError>> {
        self.state
            .run(self.client.update_doc(&self.doctype, name, patch))
            .await
    }

    pub async fn remove(&self, name: &str) -> Result<Value, Arc<ClientError>> {
        self.state
            .run(async {
                self.client
                    .delete_doc(&self.doctype, name)
                    .await
                    .map(Value::from)
            })
            .await
    }
}

/// Tracked authentication state.
///
/// `data` is `Some(Some(user))` for an authenticated session,
/// `Some(None)` for a known-Guest session, and `None` before the first
/// refresh completes.
pub struct AuthResource {
    client: FrappeClient,
    state: OperationState<Option<String>>,
}

impl AuthResource {
    pub fn new(client: FrappeClient) -> Self {
        Self {
            client,
            state: OperationState::new(true),
        }
    }

    pub fn snapshot(&self) -> StateSnapshot<Option<String>> {
        self.state.snapshot()
    }

    /// Identity of the current session, if authenticated.
    pub fn user(&self) -> Option<String> {
        self.state.snapshot().data.flatten()
    }

    /// Derived from the last fetched identity; Guest and unknown are both
    /// not-logged-in.
    pub fn is_logged_in(&self) -> bool {
        self.user().is_some()
    }

    /// Fetches the identity. Failures and the Guest sentinel both resolve to
    /// unauthenticated rather than surfacing an error.
    pub async fn refresh(&self) -> Option<String> {
        let result = self
            .state
            .run(async {
                match self.client.get_current_user().await {
                    Ok(user) => Ok(identity_is_authenticated(&user).then_some(user)),
                    Err(error) => {
                        debug!(event = "auth_refresh_failed", error = %error);
                        Ok(None)
                    }
                }
            })
            .await;
        result.ok().flatten()
    }

    /// Logs in and refreshes the tracked identity afterward.
    pub async fn login(
        &self,
        username: &str,
        password: &SecretString,
    ) -> Result<LoginResponse, ClientError> {
        let response = self.client.login(username, password).await?;
        self.refresh().await;
        Ok(response)
    }

    /// Logs out and marks the session as Guest.
    pub async fn logout(&self) -> Result<(), ClientError> {
        self.client.logout().await?;
        self.state.store(None);
        Ok(())
    }
}

/// Merges override parameters over base parameters.
///
/// When both are JSON objects the overrides win key-by-key; otherwise the
/// overrides replace the base entirely.
fn merge_params(base: &Value, overrides: Value) -> Value {
    match (base, overrides) {
        (Value::Object(base), Value::Object(overrides)) => {
            let mut merged = base.clone();
            for (key, value) in overrides {
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (_, overrides) => overrides,
    }
}
