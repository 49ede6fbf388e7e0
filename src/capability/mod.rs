//! Capability families a plugin can expose, and the class model used to
//! discover them.
//!
//! A plugin hands the runtime a [`PluginModule`]: an ordered list of named
//! exports, some of which are classes. A class is any type implementing
//! [`PluginClass`]; its `MARKERS` constant is the only thing that decides which
//! capability families it belongs to. Constructing a class yields a
//! [`PluginObject`], which exposes typed views (`as_tool`, `as_model`, ...) for
//! the families it implements.

pub mod registry;
pub mod scanner;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::endpoint::HttpRequest;
use crate::error::CapabilityError;
use crate::message::InvokeMessage;
use crate::session::SessionHandle;

pub use registry::{CapabilityRegistry, PluginDeclaration};
pub use scanner::{
    find_class, find_sub_classes, load_single_subclass, scan_classes, ClassInfo, ScanError,
};

/// Static capability marker carried by a class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Marker {
    Tool,
    ToolProvider,
    Model,
    ModelProvider,
    Endpoint,
    AgentStrategy,
    OAuthProvider,
    DynamicSelect,
}

impl fmt::Display for Marker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Tool => "Tool",
            Self::ToolProvider => "ToolProvider",
            Self::Model => "Model",
            Self::ModelProvider => "ModelProvider",
            Self::Endpoint => "Endpoint",
            Self::AgentStrategy => "AgentStrategy",
            Self::OAuthProvider => "OAuthProvider",
            Self::DynamicSelect => "DynamicSelect",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelType {
    #[serde(rename = "llm")]
    Llm,
    #[serde(rename = "text-embedding")]
    TextEmbedding,
    #[serde(rename = "rerank")]
    Rerank,
    #[serde(rename = "speech2text")]
    Speech2Text,
    #[serde(rename = "moderation")]
    Moderation,
    #[serde(rename = "tts")]
    Tts,
}

impl ModelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Llm => "llm",
            Self::TextEmbedding => "text-embedding",
            Self::Rerank => "rerank",
            Self::Speech2Text => "speech2text",
            Self::Moderation => "moderation",
            Self::Tts => "tts",
        }
    }
}

/// Per-invocation context handed to class constructors.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    pub session_id: String,
    pub user_id: Option<String>,
    pub credentials: Value,
    pub credential_type: Option<String>,
}

impl RuntimeContext {
    pub fn for_session(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Default::default()
        }
    }
}

/// A plugin class. Implemented on a type, never on a value.
pub trait PluginClass: 'static {
    /// The class's own name, used for `default` exports and class lookups.
    const NAME: &'static str;
    const MARKERS: &'static [Marker];
    /// Abstract bases are skipped by the scanner unless they carry the marker.
    const ABSTRACT: bool = false;

    fn construct(_ctx: &RuntimeContext) -> Result<Arc<dyn PluginObject>, CapabilityError> {
        Err(CapabilityError::Unsupported("construct"))
    }
}

type Constructor = fn(&RuntimeContext) -> Result<Arc<dyn PluginObject>, CapabilityError>;

struct ClassMeta {
    name: &'static str,
    markers: &'static [Marker],
    is_abstract: bool,
    type_id: TypeId,
    construct: Constructor,
}

/// Type-erased handle to a [`PluginClass`]. Two refs are equal when they point
/// at the same class, whichever export they were reached through.
#[derive(Clone)]
pub struct ClassRef(Arc<ClassMeta>);

impl ClassRef {
    pub fn of<C: PluginClass>() -> Self {
        Self(Arc::new(ClassMeta {
            name: C::NAME,
            markers: C::MARKERS,
            is_abstract: C::ABSTRACT,
            type_id: TypeId::of::<C>(),
            construct: C::construct,
        }))
    }

    pub fn name(&self) -> &'static str {
        self.0.name
    }

    pub fn markers(&self) -> &'static [Marker] {
        self.0.markers
    }

    pub fn has_marker(&self, marker: Marker) -> bool {
        self.0.markers.contains(&marker)
    }

    pub fn is_abstract(&self) -> bool {
        self.0.is_abstract
    }

    pub fn construct(&self, ctx: &RuntimeContext) -> Result<Arc<dyn PluginObject>, CapabilityError> {
        (self.0.construct)(ctx)
    }
}

impl PartialEq for ClassRef {
    fn eq(&self, other: &Self) -> bool {
        self.0.type_id == other.0.type_id
    }
}

impl Eq for ClassRef {}

impl fmt::Debug for ClassRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassRef")
            .field("name", &self.0.name)
            .field("markers", &self.0.markers)
            .finish()
    }
}

pub type ExportedFn = Arc<dyn Fn(Value) -> Value + Send + Sync>;

/// One named export of a plugin module.
#[derive(Clone)]
pub enum ExportValue {
    Class(ClassRef),
    Function(ExportedFn),
    Value(Value),
}

impl fmt::Debug for ExportValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Class(c) => f.debug_tuple("Class").field(c).finish(),
            Self::Function(_) => f.write_str("Function"),
            Self::Value(v) => f.debug_tuple("Value").field(v).finish(),
        }
    }
}

pub const DEFAULT_EXPORT: &str = "default";

/// Ordered set of named exports. Re-exporting a name replaces the earlier
/// value in place.
#[derive(Debug, Clone, Default)]
pub struct PluginModule {
    exports: Vec<(String, ExportValue)>,
}

impl PluginModule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn export(mut self, name: impl Into<String>, value: ExportValue) -> Self {
        let name = name.into();
        match self.exports.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = value,
            None => self.exports.push((name, value)),
        }
        self
    }

    pub fn class<C: PluginClass>(self, export_name: impl Into<String>) -> Self {
        self.export(export_name, ExportValue::Class(ClassRef::of::<C>()))
    }

    pub fn default_class<C: PluginClass>(self) -> Self {
        self.class::<C>(DEFAULT_EXPORT)
    }

    pub fn function<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Value) -> Value + Send + Sync + 'static,
    {
        self.export(name, ExportValue::Function(Arc::new(f)))
    }

    pub fn value(self, name: impl Into<String>, value: Value) -> Self {
        self.export(name, ExportValue::Value(value))
    }

    pub fn exports(&self) -> impl Iterator<Item = (&str, &ExportValue)> {
        self.exports.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn get(&self, name: &str) -> Option<&ExportValue> {
        self.exports.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.exports.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exports.is_empty()
    }
}

/// A constructed plugin class. Each view returns `Some` for the capability
/// families the object implements.
pub trait PluginObject: Send + Sync + 'static {
    fn as_tool_provider(&self) -> Option<&dyn ToolProvider> {
        None
    }
    fn as_tool(&self) -> Option<&dyn Tool> {
        None
    }
    fn as_model_provider(&self) -> Option<&dyn ModelProvider> {
        None
    }
    fn as_model(&self) -> Option<&dyn Model> {
        None
    }
    fn as_endpoint(&self) -> Option<&dyn Endpoint> {
        None
    }
    fn as_agent_strategy(&self) -> Option<&dyn AgentStrategy> {
        None
    }
    fn as_oauth_provider(&self) -> Option<&dyn OAuthProvider> {
        None
    }
    fn as_dynamic_select(&self) -> Option<&dyn DynamicSelect> {
        None
    }
}

#[async_trait]
pub trait ToolProvider: Send + Sync {
    async fn validate_credentials(&self, credentials: &Value) -> Result<(), CapabilityError>;
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Stream output through `session`; the terminal message is written by
    /// the caller.
    async fn invoke(&self, parameters: Value, session: &SessionHandle) -> Result<(), CapabilityError>;

    async fn runtime_parameters(&self) -> Result<Value, CapabilityError> {
        Ok(Value::Array(Vec::new()))
    }

    /// Synchronous variant run on a worker thread for CPU-bound tools.
    fn invoke_blocking(&self, _parameters: Value) -> Result<Vec<InvokeMessage>, CapabilityError> {
        Err(CapabilityError::Unsupported("invoke_blocking"))
    }
}

#[async_trait]
pub trait ModelProvider: Send + Sync {
    async fn validate_provider_credentials(&self, credentials: &Value) -> Result<(), CapabilityError>;
}

/// Which model operation is being invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelOperation {
    Llm,
    TextEmbedding,
    Rerank,
    Tts,
    Speech2Text,
    Moderation,
}

/// Arguments of a model call. `params` holds the operation-specific fields
/// (prompt messages, texts, query and docs, ...) exactly as the host sent them.
#[derive(Debug, Clone)]
pub struct ModelCall {
    pub operation: ModelOperation,
    pub model: String,
    pub credentials: Value,
    pub params: Value,
    pub user_id: Option<String>,
}

#[async_trait]
pub trait Model: Send + Sync {
    fn model_type(&self) -> ModelType;

    async fn validate_credentials(&self, model: &str, credentials: &Value) -> Result<(), CapabilityError>;

    async fn invoke(&self, call: ModelCall, session: &SessionHandle) -> Result<(), CapabilityError>;

    async fn num_tokens(&self, _call: ModelCall) -> Result<u64, CapabilityError> {
        Err(CapabilityError::Unsupported("get_num_tokens"))
    }

    async fn voices(
        &self,
        _model: &str,
        _credentials: &Value,
        _language: Option<&str>,
    ) -> Result<Vec<Value>, CapabilityError> {
        Ok(Vec::new())
    }

    async fn model_schema(&self, _model: &str, _credentials: &Value) -> Result<Option<Value>, CapabilityError> {
        Ok(None)
    }

    fn invoke_blocking(&self, _call: ModelCall) -> Result<Vec<Value>, CapabilityError> {
        Err(CapabilityError::Unsupported("invoke_blocking"))
    }
}

#[async_trait]
pub trait Endpoint: Send + Sync {
    async fn invoke(
        &self,
        request: &HttpRequest,
        params: &HashMap<String, String>,
        settings: &Value,
        session: &SessionHandle,
    ) -> Result<(), CapabilityError>;

    fn invoke_blocking(
        &self,
        _request: &HttpRequest,
        _params: &HashMap<String, String>,
        _settings: &Value,
    ) -> Result<Vec<Value>, CapabilityError> {
        Err(CapabilityError::Unsupported("invoke_blocking"))
    }
}

#[async_trait]
pub trait AgentStrategy: Send + Sync {
    async fn invoke(&self, parameters: Value, session: &SessionHandle) -> Result<(), CapabilityError>;

    fn invoke_blocking(&self, _parameters: Value) -> Result<Vec<InvokeMessage>, CapabilityError> {
        Err(CapabilityError::Unsupported("invoke_blocking"))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OAuthCredentials {
    #[serde(default)]
    pub metadata: Value,
    pub credentials: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    async fn authorization_url(
        &self,
        redirect_uri: &str,
        system_credentials: &Value,
    ) -> Result<String, CapabilityError>;

    async fn credentials(
        &self,
        redirect_uri: &str,
        system_credentials: &Value,
        request: &HttpRequest,
    ) -> Result<OAuthCredentials, CapabilityError>;

    async fn refresh_credentials(
        &self,
        _redirect_uri: &str,
        _system_credentials: &Value,
        _credentials: &Value,
    ) -> Result<OAuthCredentials, CapabilityError> {
        Err(CapabilityError::Unsupported("refresh_credentials"))
    }
}

#[async_trait]
pub trait DynamicSelect: Send + Sync {
    async fn fetch_parameter_options(&self, parameter: &str) -> Result<Vec<Value>, CapabilityError>;
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_class_ref_identity() {
        let a = ClassRef::of::<EchoTool>();
        let b = ClassRef::of::<EchoTool>();
        let c = ClassRef::of::<DemoProvider>();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.name(), "EchoTool");
        assert!(a.has_marker(Marker::Tool));
        assert!(!a.has_marker(Marker::ToolProvider));
    }

    #[test]
    fn test_one_class_many_markers() {
        let provider = ClassRef::of::<DemoProvider>();
        assert!(provider.has_marker(Marker::ToolProvider));
        assert!(provider.has_marker(Marker::OAuthProvider));

        let obj = provider.construct(&RuntimeContext::default()).unwrap();
        assert!(obj.as_tool_provider().is_some());
        assert!(obj.as_oauth_provider().is_some());
        assert!(obj.as_tool().is_none());
    }

    #[test]
    fn test_abstract_class_cannot_construct() {
        let base = ClassRef::of::<BaseTool>();
        assert!(base.is_abstract());
        assert!(matches!(
            base.construct(&RuntimeContext::default()),
            Err(CapabilityError::Unsupported(_))
        ));
    }

    #[test]
    fn test_module_export_replaces_in_place() {
        let module = PluginModule::new()
            .value("a", serde_json::json!(1))
            .value("b", serde_json::json!(2))
            .class::<EchoTool>("a");
        let names: Vec<&str> = module.exports().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert!(matches!(module.get("a"), Some(ExportValue::Class(_))));
    }

    #[test]
    fn test_model_type_names() {
        assert_eq!(
            serde_json::to_value(ModelType::TextEmbedding).unwrap(),
            "text-embedding"
        );
        let t: ModelType = serde_json::from_str("\"llm\"").unwrap();
        assert_eq!(t, ModelType::Llm);
    }
}
