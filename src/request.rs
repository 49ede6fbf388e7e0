//! Typed plugin requests carried in the `data` of `request` envelopes.
//!
//! Requests are keyed first by `type`, then by `action`:
//!
//! ```json
//! {"type": "tool", "action": "invoke_tool", "provider": "demo", "tool": "echo",
//!  "toolParameters": {"text": "hi"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::capability::{ModelOperation, ModelType};
use crate::error::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid request: {0}")]
    Decode(#[from] serde_json::Error),
}

impl RequestError {
    pub fn code(&self) -> ErrorCode {
        ErrorCode::InvalidRequest
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PluginRequest {
    Tool(ToolRequest),
    Model(ModelRequest),
    Endpoint(EndpointRequest),
    AgentStrategy(AgentStrategyRequest),
    Oauth(OAuthRequest),
    DynamicParameter(DynamicParameterRequest),
}

impl PluginRequest {
    pub fn from_value(data: Value) -> Result<Self, RequestError> {
        Ok(serde_json::from_value(data)?)
    }

    /// `type/action`, for logs.
    pub fn label(&self) -> String {
        let (kind, action) = match self {
            Self::Tool(r) => (
                "tool",
                match r {
                    ToolRequest::InvokeTool(_) => "invoke_tool",
                    ToolRequest::ValidateToolCredentials(_) => "validate_tool_credentials",
                    ToolRequest::GetToolRuntimeParameters(_) => "get_tool_runtime_parameters",
                },
            ),
            Self::Model(r) => ("model", r.action.as_str()),
            Self::Endpoint(_) => ("endpoint", "invoke_endpoint"),
            Self::AgentStrategy(_) => ("agent_strategy", "invoke_agent_strategy"),
            Self::Oauth(r) => (
                "oauth",
                match r {
                    OAuthRequest::GetAuthorizationUrl(_) => "get_authorization_url",
                    OAuthRequest::GetCredentials(_) => "get_credentials",
                    OAuthRequest::RefreshCredentials(_) => "refresh_credentials",
                },
            ),
            Self::DynamicParameter(_) => ("dynamic_parameter", "fetch_parameter_options"),
        };
        format!("{}/{}", kind, action)
    }
}

fn default_credential_type() -> String {
    "api_key".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ToolRequest {
    InvokeTool(ToolInvokeRequest),
    ValidateToolCredentials(ToolValidateCredentialsRequest),
    GetToolRuntimeParameters(ToolRuntimeParametersRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvokeRequest {
    pub provider: String,
    pub tool: String,
    #[serde(default)]
    pub credentials: Value,
    #[serde(default = "default_credential_type")]
    pub credential_type: String,
    #[serde(default)]
    pub tool_parameters: Value,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolValidateCredentialsRequest {
    pub provider: String,
    #[serde(default)]
    pub credentials: Value,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolRuntimeParametersRequest {
    pub provider: String,
    pub tool: String,
    #[serde(default)]
    pub credentials: Value,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelAction {
    ValidateProviderCredentials,
    ValidateModelCredentials,
    InvokeLlm,
    GetLlmNumTokens,
    InvokeTextEmbedding,
    GetTextEmbeddingNumTokens,
    InvokeRerank,
    InvokeTts,
    GetTtsModelVoices,
    #[serde(rename = "invoke_speech2text")]
    InvokeSpeech2Text,
    InvokeModeration,
    GetAiModelSchemas,
}

impl ModelAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValidateProviderCredentials => "validate_provider_credentials",
            Self::ValidateModelCredentials => "validate_model_credentials",
            Self::InvokeLlm => "invoke_llm",
            Self::GetLlmNumTokens => "get_llm_num_tokens",
            Self::InvokeTextEmbedding => "invoke_text_embedding",
            Self::GetTextEmbeddingNumTokens => "get_text_embedding_num_tokens",
            Self::InvokeRerank => "invoke_rerank",
            Self::InvokeTts => "invoke_tts",
            Self::GetTtsModelVoices => "get_tts_model_voices",
            Self::InvokeSpeech2Text => "invoke_speech2text",
            Self::InvokeModeration => "invoke_moderation",
            Self::GetAiModelSchemas => "get_ai_model_schemas",
        }
    }

    /// The model operation an `invoke_*` or token-count action runs.
    pub fn operation(&self) -> Option<ModelOperation> {
        match self {
            Self::InvokeLlm | Self::GetLlmNumTokens => Some(ModelOperation::Llm),
            Self::InvokeTextEmbedding | Self::GetTextEmbeddingNumTokens => {
                Some(ModelOperation::TextEmbedding)
            }
            Self::InvokeRerank => Some(ModelOperation::Rerank),
            Self::InvokeTts => Some(ModelOperation::Tts),
            Self::InvokeSpeech2Text => Some(ModelOperation::Speech2Text),
            Self::InvokeModeration => Some(ModelOperation::Moderation),
            _ => None,
        }
    }

    /// True for the `invoke_*` actions that stream model output.
    pub fn is_invocation(&self) -> bool {
        matches!(
            self,
            Self::InvokeLlm
                | Self::InvokeTextEmbedding
                | Self::InvokeRerank
                | Self::InvokeTts
                | Self::InvokeSpeech2Text
                | Self::InvokeModeration
        )
    }
}

fn default_model_type() -> ModelType {
    ModelType::Llm
}

/// A model request. Operation-specific fields (`promptMessages`, `texts`,
/// `query`, `docs`, `voice`, ...) are kept verbatim in `params`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelRequest {
    pub action: ModelAction,
    pub provider: String,
    #[serde(default)]
    pub model: String,
    #[serde(default = "default_model_type")]
    pub model_type: ModelType,
    #[serde(default)]
    pub credentials: Value,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum EndpointRequest {
    InvokeEndpoint(EndpointInvokeRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointInvokeRequest {
    pub raw_http_request: String,
    #[serde(default)]
    pub settings: Value,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentStrategyRequest {
    InvokeAgentStrategy(AgentStrategyInvokeRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStrategyInvokeRequest {
    pub agent_strategy_provider: String,
    pub agent_strategy: String,
    #[serde(default)]
    pub agent_strategy_parameters: Value,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum OAuthRequest {
    GetAuthorizationUrl(OAuthAuthorizationUrlRequest),
    GetCredentials(OAuthCredentialsRequest),
    RefreshCredentials(OAuthRefreshRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthAuthorizationUrlRequest {
    pub provider: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub system_credentials: Value,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCredentialsRequest {
    pub provider: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub system_credentials: Value,
    #[serde(default)]
    pub raw_http_request: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthRefreshRequest {
    pub provider: String,
    #[serde(default)]
    pub redirect_uri: String,
    #[serde(default)]
    pub system_credentials: Value,
    #[serde(default)]
    pub credentials: Value,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DynamicParameterRequest {
    FetchParameterOptions(FetchParameterOptionsRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchParameterOptionsRequest {
    pub provider: String,
    pub parameter: String,
    #[serde(default)]
    pub provider_action: Option<String>,
    #[serde(default)]
    pub credentials: Value,
    #[serde(default)]
    pub user_id: Option<String>,
}
