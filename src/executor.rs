//! Runs one typed request against the capability registry.
//!
//! The executor resolves the target class or instance, then either awaits
//! the capability on the dispatcher thread or ships a blocking job to the
//! worker pool. Output goes through the session handle; the terminal message
//! is left to the caller.

use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

use crate::capability::{
    CapabilityRegistry, ClassRef, ModelCall, ModelOperation, ModelType, PluginObject,
    RuntimeContext,
};
use crate::endpoint::parse_raw_http_request;
use crate::error::{ErrorCode, InvocationError};
use crate::message::InvokeMessage;
use crate::request::{
    AgentStrategyRequest, DynamicParameterRequest, EndpointRequest, ModelAction, ModelRequest,
    OAuthRequest, PluginRequest, ToolRequest,
};
use crate::session::SessionHandle;
use crate::worker::{Job, TaskKind, WorkerPool};

pub struct Executor {
    registry: Arc<CapabilityRegistry>,
    pool: Option<Arc<WorkerPool>>,
}

fn unsupported(class: &str, capability: &str) -> InvocationError {
    InvocationError::new(
        ErrorCode::Unsupported,
        format!("{} does not implement {}", class, capability),
    )
}

fn to_values(messages: Vec<InvokeMessage>) -> Result<Vec<Value>, String> {
    messages
        .into_iter()
        .map(|m| serde_json::to_value(m).map_err(|e| e.to_string()))
        .collect()
}

fn model_type_of(operation: ModelOperation) -> ModelType {
    match operation {
        ModelOperation::Llm => ModelType::Llm,
        ModelOperation::TextEmbedding => ModelType::TextEmbedding,
        ModelOperation::Rerank => ModelType::Rerank,
        ModelOperation::Tts => ModelType::Tts,
        ModelOperation::Speech2Text => ModelType::Speech2Text,
        ModelOperation::Moderation => ModelType::Moderation,
    }
}

fn construct(
    class: &ClassRef,
    session: &SessionHandle,
    user_id: Option<&String>,
    credentials: &Value,
    credential_type: Option<&str>,
) -> Result<Arc<dyn PluginObject>, InvocationError> {
    let ctx = RuntimeContext {
        session_id: session.id().to_string(),
        user_id: user_id.cloned(),
        credentials: credentials.clone(),
        credential_type: credential_type.map(str::to_string),
    };
    Ok(class.construct(&ctx)?)
}

impl Executor {
    pub fn new(registry: Arc<CapabilityRegistry>, pool: Option<Arc<WorkerPool>>) -> Self {
        Self { registry, pool }
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> Option<&Arc<WorkerPool>> {
        self.pool.as_ref()
    }

    /// Run `request`, streaming output to `session`. `kind` selects the
    /// worker pool for invocations that support it; without a pool
    /// everything runs inline.
    pub async fn execute(
        &self,
        request: PluginRequest,
        kind: TaskKind,
        session: &SessionHandle,
    ) -> Result<(), InvocationError> {
        let offload = kind == TaskKind::Cpu && self.pool.is_some();
        debug!(session_id = %session.id(), request = %request.label(), offload, "executing request");
        match request {
            PluginRequest::Tool(r) => self.tool(r, offload, session).await,
            PluginRequest::Model(r) => self.model(r, offload, session).await,
            PluginRequest::Endpoint(r) => self.endpoint(r, offload, session).await,
            PluginRequest::AgentStrategy(r) => self.agent_strategy(r, offload, session).await,
            PluginRequest::Oauth(r) => self.oauth(r, session).await,
            PluginRequest::DynamicParameter(r) => self.dynamic_parameter(r, session).await,
        }
    }

    async fn offload(&self, session: &SessionHandle, job: Job) -> Result<(), InvocationError> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| InvocationError::new(ErrorCode::ShuttingDown, "worker pool unavailable"))?;
        for value in pool.run(session.id(), job).await? {
            session.emit_value(value);
        }
        Ok(())
    }

    async fn tool(
        &self,
        request: ToolRequest,
        offload: bool,
        session: &SessionHandle,
    ) -> Result<(), InvocationError> {
        match request {
            ToolRequest::InvokeTool(r) => {
                let registration = self
                    .registry
                    .tool(&r.provider, &r.tool)
                    .ok_or_else(|| InvocationError::not_found(format!("tool {}/{}", r.provider, r.tool)))?;
                let class = registration.class.clone();
                let object = construct(
                    &class,
                    session,
                    r.user_id.as_ref(),
                    &r.credentials,
                    Some(&r.credential_type),
                )?;
                if object.as_tool().is_none() {
                    return Err(unsupported(class.name(), "tool"));
                }
                if offload {
                    let params = r.tool_parameters;
                    let job: Job = Box::new(move || -> Result<Vec<Value>, String> {
                        let tool = object.as_tool().ok_or("not a tool")?;
                        to_values(tool.invoke_blocking(params).map_err(|e| e.to_string())?)
                    });
                    return self.offload(session, job).await;
                }
                match object.as_tool() {
                    Some(tool) => Ok(tool.invoke(r.tool_parameters, session).await?),
                    None => Err(unsupported(class.name(), "tool")),
                }
            }
            ToolRequest::ValidateToolCredentials(r) => {
                let provider = self
                    .registry
                    .tool_provider(&r.provider)
                    .ok_or_else(|| InvocationError::not_found(format!("tool provider {}", r.provider)))?;
                let validator = provider
                    .instance
                    .as_tool_provider()
                    .ok_or_else(|| unsupported(&r.provider, "tool provider"))?;
                validator.validate_credentials(&r.credentials).await?;
                session.emit(json!({ "result": true }));
                Ok(())
            }
            ToolRequest::GetToolRuntimeParameters(r) => {
                let registration = self
                    .registry
                    .tool(&r.provider, &r.tool)
                    .ok_or_else(|| InvocationError::not_found(format!("tool {}/{}", r.provider, r.tool)))?;
                let object = construct(
                    &registration.class,
                    session,
                    r.user_id.as_ref(),
                    &r.credentials,
                    None,
                )?;
                let tool = object
                    .as_tool()
                    .ok_or_else(|| unsupported(registration.class.name(), "tool"))?;
                let parameters = tool.runtime_parameters().await?;
                session.emit(json!({ "parameters": parameters }));
                Ok(())
            }
        }
    }

    async fn model(
        &self,
        r: ModelRequest,
        offload: bool,
        session: &SessionHandle,
    ) -> Result<(), InvocationError> {
        let provider = self
            .registry
            .model_provider(&r.provider)
            .ok_or_else(|| InvocationError::not_found(format!("model provider {}", r.provider)))?;

        if r.action == ModelAction::ValidateProviderCredentials {
            let validator = provider
                .instance
                .as_model_provider()
                .ok_or_else(|| unsupported(&r.provider, "model provider"))?;
            validator.validate_provider_credentials(&r.credentials).await?;
            session.emit(json!({ "result": true }));
            return Ok(());
        }

        let model_type = match r.action {
            ModelAction::GetTtsModelVoices => ModelType::Tts,
            action => action.operation().map_or(r.model_type, model_type_of),
        };
        let object = provider.models.get(&model_type).cloned().ok_or_else(|| {
            InvocationError::not_found(format!("{} model of provider {}", model_type.as_str(), r.provider))
        })?;
        let model = object
            .as_model()
            .ok_or_else(|| unsupported(&r.provider, "model"))?;

        match r.action {
            ModelAction::ValidateModelCredentials => {
                model.validate_credentials(&r.model, &r.credentials).await?;
                session.emit(json!({ "result": true }));
            }
            ModelAction::GetTtsModelVoices => {
                let language = r.params.get("language").and_then(Value::as_str);
                let voices = model.voices(&r.model, &r.credentials, language).await?;
                session.emit(json!({ "voices": voices }));
            }
            ModelAction::GetAiModelSchemas => {
                let schema = model.model_schema(&r.model, &r.credentials).await?;
                session.emit(json!({ "modelSchema": schema }));
            }
            action => {
                let operation = action
                    .operation()
                    .ok_or_else(|| unsupported(&r.provider, action.as_str()))?;
                let call = ModelCall {
                    operation,
                    model: r.model,
                    credentials: r.credentials,
                    params: Value::Object(r.params),
                    user_id: r.user_id,
                };
                if !action.is_invocation() {
                    let num_tokens = model.num_tokens(call).await?;
                    session.emit(json!({ "numTokens": num_tokens }));
                } else if offload {
                    let job: Job = Box::new(move || -> Result<Vec<Value>, String> {
                        let model = object.as_model().ok_or("not a model")?;
                        model.invoke_blocking(call).map_err(|e| e.to_string())
                    });
                    self.offload(session, job).await?;
                } else {
                    model.invoke(call, session).await?;
                }
            }
        }
        Ok(())
    }

    async fn endpoint(
        &self,
        request: EndpointRequest,
        offload: bool,
        session: &SessionHandle,
    ) -> Result<(), InvocationError> {
        let EndpointRequest::InvokeEndpoint(r) = request;
        let http = parse_raw_http_request(&r.raw_http_request);
        let matched = self
            .registry
            .dispatch_endpoint(&http.method, &http.path)
            .ok_or_else(|| InvocationError::not_found(format!("endpoint {} {}", http.method, http.route_path())))?;
        let class = matched.target.class.clone();
        let params = matched.params;
        let object = construct(&class, session, r.user_id.as_ref(), &Value::Null, None)?;
        if object.as_endpoint().is_none() {
            return Err(unsupported(class.name(), "endpoint"));
        }
        if offload {
            let settings = r.settings;
            let job: Job = Box::new(move || -> Result<Vec<Value>, String> {
                let endpoint = object.as_endpoint().ok_or("not an endpoint")?;
                endpoint
                    .invoke_blocking(&http, &params, &settings)
                    .map_err(|e| e.to_string())
            });
            return self.offload(session, job).await;
        }
        match object.as_endpoint() {
            Some(endpoint) => Ok(endpoint.invoke(&http, &params, &r.settings, session).await?),
            None => Err(unsupported(class.name(), "endpoint")),
        }
    }

    async fn agent_strategy(
        &self,
        request: AgentStrategyRequest,
        offload: bool,
        session: &SessionHandle,
    ) -> Result<(), InvocationError> {
        let AgentStrategyRequest::InvokeAgentStrategy(r) = request;
        let registration = self
            .registry
            .agent_strategy(&r.agent_strategy_provider, &r.agent_strategy)
            .ok_or_else(|| {
                InvocationError::not_found(format!(
                    "agent strategy {}/{}",
                    r.agent_strategy_provider, r.agent_strategy
                ))
            })?;
        let class = registration.class.clone();
        let object = construct(&class, session, r.user_id.as_ref(), &Value::Null, None)?;
        if object.as_agent_strategy().is_none() {
            return Err(unsupported(class.name(), "agent strategy"));
        }
        if offload {
            let params = r.agent_strategy_parameters;
            let job: Job = Box::new(move || -> Result<Vec<Value>, String> {
                let strategy = object.as_agent_strategy().ok_or("not an agent strategy")?;
                to_values(strategy.invoke_blocking(params).map_err(|e| e.to_string())?)
            });
            return self.offload(session, job).await;
        }
        match object.as_agent_strategy() {
            Some(strategy) => Ok(strategy.invoke(r.agent_strategy_parameters, session).await?),
            None => Err(unsupported(class.name(), "agent strategy")),
        }
    }

    async fn oauth(&self, request: OAuthRequest, session: &SessionHandle) -> Result<(), InvocationError> {
        let provider_name = match &request {
            OAuthRequest::GetAuthorizationUrl(r) => &r.provider,
            OAuthRequest::GetCredentials(r) => &r.provider,
            OAuthRequest::RefreshCredentials(r) => &r.provider,
        };
        let object = self
            .registry
            .oauth_provider(provider_name)
            .ok_or_else(|| InvocationError::not_found(format!("oauth provider {}", provider_name)))?;
        let oauth = object
            .as_oauth_provider()
            .ok_or_else(|| unsupported(provider_name, "oauth"))?;

        let payload = match &request {
            OAuthRequest::GetAuthorizationUrl(r) => {
                let url = oauth.authorization_url(&r.redirect_uri, &r.system_credentials).await?;
                json!({ "authorizationUrl": url })
            }
            OAuthRequest::GetCredentials(r) => {
                let http = parse_raw_http_request(&r.raw_http_request);
                let credentials = oauth
                    .credentials(&r.redirect_uri, &r.system_credentials, &http)
                    .await?;
                serde_json::to_value(credentials)
                    .map_err(|e| InvocationError::new(ErrorCode::HandlerError, e.to_string()))?
            }
            OAuthRequest::RefreshCredentials(r) => {
                let credentials = oauth
                    .refresh_credentials(&r.redirect_uri, &r.system_credentials, &r.credentials)
                    .await?;
                serde_json::to_value(credentials)
                    .map_err(|e| InvocationError::new(ErrorCode::HandlerError, e.to_string()))?
            }
        };
        session.emit(payload);
        Ok(())
    }

    async fn dynamic_parameter(
        &self,
        request: DynamicParameterRequest,
        session: &SessionHandle,
    ) -> Result<(), InvocationError> {
        let DynamicParameterRequest::FetchParameterOptions(r) = request;
        let object = self
            .registry
            .dynamic_select(&r.provider)
            .ok_or_else(|| InvocationError::not_found(format!("dynamic select provider {}", r.provider)))?;
        let select = object
            .as_dynamic_select()
            .ok_or_else(|| unsupported(&r.provider, "dynamic select"))?;
        let options = select.fetch_parameter_options(&r.parameter).await?;
        session.emit(json!({ "options": options }));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::fixtures::{demo_declaration, demo_module};
    use crate::codec::{Envelope, Event};
    use crate::session::SessionRegistry;
    use tokio::sync::mpsc;

    struct Harness {
        executor: Executor,
        sessions: SessionRegistry,
        outbound: mpsc::UnboundedReceiver<Envelope>,
    }

    fn harness(pool: Option<Arc<WorkerPool>>) -> Harness {
        let registry = Arc::new(CapabilityRegistry::build(&demo_module(), &demo_declaration()).unwrap());
        let (tx, outbound) = mpsc::unbounded_channel();
        Harness {
            executor: Executor::new(registry, pool),
            sessions: SessionRegistry::new(tx, 16, 8, 1024),
            outbound,
        }
    }

    impl Harness {
        async fn run(&mut self, id: &str, request: Value, kind: TaskKind) -> Result<Vec<Value>, InvocationError> {
            self.sessions.open(id).unwrap();
            let handle = self.sessions.handle(id).unwrap();
            let request = PluginRequest::from_value(request).unwrap();
            let result = self.executor.execute(request, kind, &handle).await;
            let mut data = Vec::new();
            while let Ok(envelope) = self.outbound.try_recv() {
                assert_eq!(envelope.event, Event::Session);
                assert_eq!(envelope.session_id, id);
                assert_eq!(envelope.data["type"], "stream");
                data.push(envelope.data["data"].clone());
            }
            result.map(|_| data)
        }
    }

    #[tokio::test]
    async fn test_invoke_tool_streams_text() {
        let mut h = harness(None);
        let out = h
            .run(
                "s1",
                json!({"type": "tool", "action": "invoke_tool", "provider": "demo", "tool": "echo",
                       "toolParameters": {"text": "hi"}}),
                TaskKind::Io,
            )
            .await
            .unwrap();
        assert_eq!(out, vec![json!({"type": "text", "message": {"text": "hi"}})]);
    }

    #[tokio::test]
    async fn test_invoke_tool_on_worker() {
        let pool = Arc::new(WorkerPool::new(1, 4));
        let mut h = harness(Some(pool.clone()));
        let out = h
            .run(
                "s1",
                json!({"type": "tool", "action": "invoke_tool", "provider": "demo", "tool": "sum",
                       "toolParameters": {"n": 4}}),
                TaskKind::Cpu,
            )
            .await
            .unwrap();
        assert_eq!(out, vec![json!({"type": "json", "message": {"jsonObject": {"sum": 10}}})]);
        assert_eq!(pool.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_worker_panic_becomes_worker_crashed() {
        let pool = Arc::new(WorkerPool::new(1, 4));
        let mut h = harness(Some(pool));
        let err = h
            .run(
                "s1",
                json!({"type": "tool", "action": "invoke_tool", "provider": "demo", "tool": "sum",
                       "toolParameters": {"n": 13}}),
                TaskKind::Cpu,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::WorkerCrashed);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let mut h = harness(None);
        let err = h
            .run(
                "s1",
                json!({"type": "tool", "action": "invoke_tool", "provider": "demo", "tool": "nope"}),
                TaskKind::Io,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CapabilityNotFound);
    }

    #[tokio::test]
    async fn test_handler_error_code() {
        let mut h = harness(None);
        let err = h
            .run(
                "s1",
                json!({"type": "tool", "action": "invoke_tool", "provider": "demo", "tool": "echo",
                       "toolParameters": {"text": "fail"}}),
                TaskKind::Io,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::HandlerError);
    }

    #[tokio::test]
    async fn test_validate_tool_credentials() {
        let mut h = harness(None);
        let out = h
            .run(
                "ok",
                json!({"type": "tool", "action": "validate_tool_credentials", "provider": "demo",
                       "credentials": {"api_key": "k"}}),
                TaskKind::Io,
            )
            .await
            .unwrap();
        assert_eq!(out, vec![json!({"result": true})]);

        let err = h
            .run(
                "bad",
                json!({"type": "tool", "action": "validate_tool_credentials", "provider": "demo",
                       "credentials": {}}),
                TaskKind::Io,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_runtime_parameters_default_empty() {
        let mut h = harness(None);
        let out = h
            .run(
                "s1",
                json!({"type": "tool", "action": "get_tool_runtime_parameters", "provider": "demo",
                       "tool": "echo"}),
                TaskKind::Io,
            )
            .await
            .unwrap();
        assert_eq!(out, vec![json!({"parameters": []})]);
    }

    #[tokio::test]
    async fn test_invoke_llm_streams_deltas() {
        let mut h = harness(None);
        let out = h
            .run(
                "s1",
                json!({"type": "model", "action": "invoke_llm", "provider": "demo-models",
                       "model": "tiny", "promptMessages": []}),
                TaskKind::Io,
            )
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![json!({"delta": "hello"}), json!({"delta": "from"}), json!({"delta": "tiny"})]
        );
    }

    #[tokio::test]
    async fn test_num_tokens_and_missing_model_type() {
        let mut h = harness(None);
        let out = h
            .run(
                "s1",
                json!({"type": "model", "action": "get_llm_num_tokens", "provider": "demo-models",
                       "model": "tiny", "promptMessages": [{"role": "user"}, {"role": "user"}]}),
                TaskKind::Io,
            )
            .await
            .unwrap();
        assert_eq!(out, vec![json!({"numTokens": 2})]);

        let err = h
            .run(
                "s2",
                json!({"type": "model", "action": "invoke_rerank", "provider": "demo-models",
                       "model": "tiny"}),
                TaskKind::Io,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CapabilityNotFound);
    }

    #[tokio::test]
    async fn test_offloaded_model_without_blocking_impl_is_task_failed() {
        let pool = Arc::new(WorkerPool::new(1, 4));
        let mut h = harness(Some(pool));
        let err = h
            .run(
                "s1",
                json!({"type": "model", "action": "invoke_llm", "provider": "demo-models", "model": "m"}),
                TaskKind::Cpu,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::TaskFailed);
    }

    #[tokio::test]
    async fn test_invoke_endpoint() {
        let mut h = harness(None);
        let out = h
            .run(
                "s1",
                json!({"type": "endpoint", "action": "invoke_endpoint",
                       "rawHttpRequest": "GET /hello/ada?x=1 HTTP/1.1\r\nHost: local\r\n\r\n"}),
                TaskKind::Io,
            )
            .await
            .unwrap();
        assert_eq!(out, vec![json!({"status": 200, "method": "GET", "name": "ada"})]);

        let err = h
            .run(
                "s2",
                json!({"type": "endpoint", "action": "invoke_endpoint",
                       "rawHttpRequest": "POST /hello/ada HTTP/1.1\r\n\r\n"}),
                TaskKind::Io,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CapabilityNotFound);
    }

    #[tokio::test]
    async fn test_agent_strategy_steps() {
        let mut h = harness(None);
        let out = h
            .run(
                "s1",
                json!({"type": "agent_strategy", "action": "invoke_agent_strategy",
                       "agentStrategyProvider": "agents", "agentStrategy": "steps",
                       "agentStrategyParameters": {"steps": 2}}),
                TaskKind::Io,
            )
            .await
            .unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[1]["message"]["text"], "step 1");
    }

    #[tokio::test]
    async fn test_oauth_flow() {
        let mut h = harness(None);
        let out = h
            .run(
                "s1",
                json!({"type": "oauth", "action": "get_authorization_url", "provider": "demo",
                       "redirectUri": "https://host/cb"}),
                TaskKind::Io,
            )
            .await
            .unwrap();
        assert_eq!(
            out,
            vec![json!({"authorizationUrl": "https://auth.example/authorize?redirect_uri=https://host/cb"})]
        );

        let out = h
            .run(
                "s2",
                json!({"type": "oauth", "action": "get_credentials", "provider": "demo",
                       "rawHttpRequest": "GET /cb?code=abc HTTP/1.1\r\n\r\n"}),
                TaskKind::Io,
            )
            .await
            .unwrap();
        assert_eq!(out[0]["credentials"]["access_token"], "abc");

        let err = h
            .run(
                "s3",
                json!({"type": "oauth", "action": "refresh_credentials", "provider": "demo"}),
                TaskKind::Io,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::Unsupported);
    }

    #[tokio::test]
    async fn test_dynamic_select_not_registered() {
        let mut h = harness(None);
        let err = h
            .run(
                "s1",
                json!({"type": "dynamic_parameter", "action": "fetch_parameter_options",
                       "provider": "demo", "parameter": "model"}),
                TaskKind::Io,
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::CapabilityNotFound);
        assert!(h.sessions.get("s1").is_some());
    }
}
