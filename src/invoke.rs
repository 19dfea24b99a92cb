use std::sync::Arc;

use async_trait::async_trait;

use crate::error::InvokeError;
use crate::types::{CanonicalEvent, DestinationSpec, OutboundMethod, RoutingRule, WebhookAuth};

#[cfg(not(feature = "http"))]
use std::time::Duration;

/// Capability for triggering a named workflow with a parameter map.
///
/// The concrete workflow engine is an external collaborator; hosts
/// register an implementation at startup.
#[async_trait]
pub trait WorkflowRunner: Send + Sync {
    async fn trigger(
        &self,
        workflow_id: &str,
        params: &serde_json::Map<String, serde_json::Value>,
        event: &CanonicalEvent,
    ) -> Result<(), InvokeError>;
}

/// Capability for calling a named internal service method.
#[async_trait]
pub trait ServiceCaller: Send + Sync {
    async fn call(
        &self,
        service: &str,
        method: &str,
        params: &serde_json::Map<String, serde_json::Value>,
        event: &CanonicalEvent,
    ) -> Result<(), InvokeError>;
}

/// Uniform destination invoker.
///
/// Selects the implementation for the matched rule's destination shape
/// and performs the side-effecting call under the rule's timeout.
/// Exceeding the timeout cancels the in-flight call and classifies as
/// transient.
pub struct DestinationInvoker {
    workflows: Option<Arc<dyn WorkflowRunner>>,
    services: Option<Arc<dyn ServiceCaller>>,
    #[cfg(feature = "http")]
    http_client: reqwest::Client,
}

impl Default for DestinationInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl DestinationInvoker {
    pub fn new() -> Self {
        Self {
            workflows: None,
            services: None,
            #[cfg(feature = "http")]
            http_client: reqwest::Client::new(),
        }
    }

    pub fn with_workflow_runner(mut self, runner: Arc<dyn WorkflowRunner>) -> Self {
        self.workflows = Some(runner);
        self
    }

    pub fn with_service_caller(mut self, caller: Arc<dyn ServiceCaller>) -> Self {
        self.services = Some(caller);
        self
    }

    /// Perform the destination call for a matched rule.
    pub async fn invoke(
        &self,
        rule: &RoutingRule,
        event: &CanonicalEvent,
    ) -> Result<(), InvokeError> {
        match tokio::time::timeout(rule.timeout, self.invoke_inner(&rule.destination, event)).await
        {
            Ok(result) => result,
            Err(_) => Err(InvokeError::Timeout),
        }
    }

    async fn invoke_inner(
        &self,
        destination: &DestinationSpec,
        event: &CanonicalEvent,
    ) -> Result<(), InvokeError> {
        match destination {
            DestinationSpec::WorkflowTrigger {
                workflow_id,
                params,
            } => match &self.workflows {
                Some(runner) => runner.trigger(workflow_id, params, event).await,
                None => Err(InvokeError::NoHandler("workflow")),
            },
            DestinationSpec::ServiceCall {
                service,
                method,
                params,
            } => match &self.services {
                Some(caller) => caller.call(service, method, params, event).await,
                None => Err(InvokeError::NoHandler("service")),
            },
            DestinationSpec::ExternalWebhook { url, method, auth } => {
                self.post_external(url, *method, auth.as_ref(), event).await
            }
        }
    }

    #[cfg(feature = "http")]
    async fn post_external(
        &self,
        url: &str,
        method: OutboundMethod,
        auth: Option<&WebhookAuth>,
        event: &CanonicalEvent,
    ) -> Result<(), InvokeError> {
        let mut request = match method {
            OutboundMethod::Post => self.http_client.post(url),
            OutboundMethod::Put => self.http_client.put(url),
        };

        request = match auth {
            Some(WebhookAuth::Bearer(token)) => request.bearer_auth(token),
            Some(WebhookAuth::Header { name, value }) => request.header(name, value),
            None => request,
        };

        let response = request
            .header("Content-Type", "application/json")
            .json(event)
            .send()
            .await;

        match response {
            Ok(resp) => {
                let status = resp.status();
                if status.is_success() {
                    Ok(())
                } else if status.as_u16() == 429 {
                    Err(InvokeError::RateLimited)
                } else {
                    Err(InvokeError::Status(status.as_u16()))
                }
            }
            Err(err) => {
                if err.is_timeout() {
                    Err(InvokeError::Timeout)
                } else {
                    Err(InvokeError::Network(err.to_string()))
                }
            }
        }
    }

    /// Simulated external delivery when the `http` feature is off.
    #[cfg(not(feature = "http"))]
    async fn post_external(
        &self,
        _url: &str,
        _method: OutboundMethod,
        _auth: Option<&WebhookAuth>,
        _event: &CanonicalEvent,
    ) -> Result<(), InvokeError> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(())
    }
}
