//! RPC operations on [`RpcClient`]

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error};

use super::RpcClient;
use crate::error::{Cause, Error, Result};
use crate::payload::to_kwargs;
use crate::rpc::{CallOptions, MethodHandler, RegisterOptions};

/// Event name reported when unregistering a handler that was never registered
const UNREGISTERED_EVENT: &str = "<unregistered>";

impl RpcClient {
    /// Invoke a remote method and discard its reply
    pub async fn send<T: Serialize + ?Sized>(&self, event: &str, data: &T, options: CallOptions) -> Result<()> {
        self.invoke(event, data, &options).await.map(|_| ())
    }

    /// Invoke a remote method and return its reply
    pub async fn call<T: Serialize + ?Sized>(&self, event: &str, data: &T, options: CallOptions) -> Result<Value> {
        self.invoke(event, data, &options).await
    }

    /// Invoke a remote method and decode its reply into `R`
    pub async fn call_as<T, R>(&self, event: &str, data: &T, options: CallOptions) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let reply = self.invoke(event, data, &options).await?;
        serde_json::from_value(reply).map_err(|e| Error::Rpc {
            event: event.to_string(),
            source: e.into(),
        })
    }

    async fn invoke<T: Serialize + ?Sized>(&self, event: &str, data: &T, options: &CallOptions) -> Result<Value> {
        let session = self.live_session()?;
        let rpc_error = |source: Cause| Error::Rpc {
            event: event.to_string(),
            source,
        };

        let kwargs = to_kwargs(data).map_err(|e| rpc_error(e.into()))?;
        let timeout = options.timeout.or(self.config.default_timeout);

        debug!(event = event, timeout = ?timeout, "Calling remote method");
        self.retry_policy
            .run(
                || session.rpc.call(event, kwargs.clone(), options),
                timeout,
                options.retry_count,
            )
            .await
            .map_err(|e| {
                let err = rpc_error(e.into());
                error!(error = %err, "RPC call failed");
                err
            })
    }

    /// Serve `event` with `handler` on this connection
    pub async fn register_event(&self, event: &str, handler: MethodHandler, options: RegisterOptions) -> Result<()> {
        let session = self.live_session()?;

        session
            .rpc
            .register(event, handler, &options)
            .await
            .map_err(|e| {
                error!(event = event, error = %e, "Failed to register event handler");
                Error::EventRegistration {
                    event: event.to_string(),
                    source: e.into(),
                }
            })
    }

    /// Stop serving the event registered with `handler`
    ///
    /// `handler` must be a clone of the registered handler.
    pub async fn unregister_event(&self, handler: &MethodHandler) -> Result<()> {
        let session = self.live_session()?;
        let event = session
            .rpc
            .method_of(handler)
            .await
            .unwrap_or_else(|| UNREGISTERED_EVENT.to_string());

        session.rpc.unregister(handler).await.map(|_| ()).map_err(|e| {
            error!(event = %event, error = %e, "Failed to unregister event handler");
            Error::EventRegistration {
                event,
                source: e.into(),
            }
        })
    }

    /// Names of the events this client currently serves
    pub async fn registered_events(&self) -> Result<Vec<String>> {
        Ok(self.live_session()?.rpc.registered_methods().await)
    }
}
