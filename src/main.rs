use async_trait::async_trait;
use clap::Parser;
use monie_plugin::capability::{
    Endpoint, Marker, PluginClass, PluginObject, RuntimeContext, Tool, ToolProvider,
};
use monie_plugin::capability::registry::{
    EndpointDeclaration, ToolDeclaration, ToolProviderDeclaration,
};
use monie_plugin::endpoint::HttpRequest;
use monie_plugin::{
    CapabilityError, InvokeMessage, PluginDeclaration, PluginModule, PluginRuntime,
    RuntimeConfig, RuntimeError, SessionHandle,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Monie plugin runtime - serves a plugin to its host over stdin/stdout
#[derive(Parser, Debug)]
#[command(name = "monie-plugin", version, about)]
struct Args {
    /// Runtime configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Plugin declaration file (TOML); the bundled sample plugin is used when omitted
    #[arg(short, long)]
    manifest: Option<PathBuf>,

    /// Number of worker threads for CPU-bound tasks
    #[arg(short, long)]
    workers: Option<usize>,

    /// Run every task on the dispatcher thread
    #[arg(long)]
    disable_worker: bool,
}

/// Echoes `text` back as a text message.
struct EchoTool;

impl PluginClass for EchoTool {
    const NAME: &'static str = "EchoTool";
    const MARKERS: &'static [Marker] = &[Marker::Tool];

    fn construct(_ctx: &RuntimeContext) -> Result<Arc<dyn PluginObject>, CapabilityError> {
        Ok(Arc::new(EchoTool))
    }
}

impl PluginObject for EchoTool {
    fn as_tool(&self) -> Option<&dyn Tool> {
        Some(self)
    }
}

#[async_trait]
impl Tool for EchoTool {
    async fn invoke(&self, parameters: Value, session: &SessionHandle) -> Result<(), CapabilityError> {
        let text = parameters["text"]
            .as_str()
            .ok_or_else(|| CapabilityError::InvalidParameters("text is required".into()))?;
        session.emit_message(InvokeMessage::text(text));
        Ok(())
    }
}

/// FNV-1a digest of `text` hashed `rounds` times. Declared CPU-bound.
struct DigestTool;

impl DigestTool {
    fn digest(parameters: &Value) -> Result<InvokeMessage, CapabilityError> {
        let text = parameters["text"]
            .as_str()
            .ok_or_else(|| CapabilityError::InvalidParameters("text is required".into()))?;
        let rounds = parameters["rounds"].as_u64().unwrap_or(1).max(1);
        let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
        for _ in 0..rounds {
            for byte in text.bytes() {
                hash ^= u64::from(byte);
                hash = hash.wrapping_mul(0x0100_0000_01b3);
            }
        }
        Ok(InvokeMessage::json(json!({
            "digest": format!("{:016x}", hash),
            "rounds": rounds,
        })))
    }
}

impl PluginClass for DigestTool {
    const NAME: &'static str = "DigestTool";
    const MARKERS: &'static [Marker] = &[Marker::Tool];

    fn construct(_ctx: &RuntimeContext) -> Result<Arc<dyn PluginObject>, CapabilityError> {
        Ok(Arc::new(DigestTool))
    }
}

impl PluginObject for DigestTool {
    fn as_tool(&self) -> Option<&dyn Tool> {
        Some(self)
    }
}

#[async_trait]
impl Tool for DigestTool {
    async fn invoke(&self, parameters: Value, session: &SessionHandle) -> Result<(), CapabilityError> {
        session.emit_message(Self::digest(&parameters)?);
        Ok(())
    }

    fn invoke_blocking(&self, parameters: Value) -> Result<Vec<InvokeMessage>, CapabilityError> {
        Ok(vec![Self::digest(&parameters)?])
    }
}

struct SampleProvider;

impl PluginClass for SampleProvider {
    const NAME: &'static str = "SampleProvider";
    const MARKERS: &'static [Marker] = &[Marker::ToolProvider];

    fn construct(_ctx: &RuntimeContext) -> Result<Arc<dyn PluginObject>, CapabilityError> {
        Ok(Arc::new(SampleProvider))
    }
}

impl PluginObject for SampleProvider {
    fn as_tool_provider(&self) -> Option<&dyn ToolProvider> {
        Some(self)
    }
}

#[async_trait]
impl ToolProvider for SampleProvider {
    async fn validate_credentials(&self, _credentials: &Value) -> Result<(), CapabilityError> {
        Ok(())
    }
}

struct PingEndpoint;

impl PluginClass for PingEndpoint {
    const NAME: &'static str = "PingEndpoint";
    const MARKERS: &'static [Marker] = &[Marker::Endpoint];

    fn construct(_ctx: &RuntimeContext) -> Result<Arc<dyn PluginObject>, CapabilityError> {
        Ok(Arc::new(PingEndpoint))
    }
}

impl PluginObject for PingEndpoint {
    fn as_endpoint(&self) -> Option<&dyn Endpoint> {
        Some(self)
    }
}

#[async_trait]
impl Endpoint for PingEndpoint {
    async fn invoke(
        &self,
        _request: &HttpRequest,
        params: &HashMap<String, String>,
        _settings: &Value,
        session: &SessionHandle,
    ) -> Result<(), CapabilityError> {
        session.emit(json!({
            "status": 200,
            "body": format!("pong {}", params.get("name").map_or("", String::as_str)),
        }));
        Ok(())
    }
}

fn sample_module() -> PluginModule {
    PluginModule::new()
        .default_class::<SampleProvider>()
        .class::<EchoTool>("EchoTool")
        .class::<DigestTool>("DigestTool")
        .class::<PingEndpoint>("PingEndpoint")
}

fn sample_declaration() -> PluginDeclaration {
    PluginDeclaration {
        tool_providers: vec![ToolProviderDeclaration {
            name: "sample".into(),
            class: None,
            cpu_bound: false,
            tools: vec![
                ToolDeclaration {
                    name: "echo".into(),
                    class: Some("EchoTool".into()),
                    cpu_bound: false,
                },
                ToolDeclaration {
                    name: "digest".into(),
                    class: Some("DigestTool".into()),
                    cpu_bound: true,
                },
            ],
        }],
        endpoints: vec![EndpointDeclaration {
            path: "/ping/:name".into(),
            method: "GET".into(),
            class: Some("PingEndpoint".into()),
            cpu_bound: false,
        }],
        ..Default::default()
    }
}

fn load_declaration(path: Option<&PathBuf>) -> Result<PluginDeclaration, RuntimeError> {
    let Some(path) = path else {
        return Ok(sample_declaration());
    };
    let content = std::fs::read_to_string(path)
        .map_err(|e| RuntimeError::Config(format!("{}: {}", path.display(), e)))?;
    toml::from_str(&content).map_err(|e| RuntimeError::Config(e.to_string()))
}

async fn run(args: Args) -> Result<(), RuntimeError> {
    let mut config = match &args.config {
        Some(path) => RuntimeConfig::from_file(path)?,
        None => RuntimeConfig::default(),
    };
    config.apply_env();
    if let Some(workers) = args.workers {
        config.max_workers = workers;
    }
    if args.disable_worker {
        config.disable_worker = true;
    }

    let declaration = load_declaration(args.manifest.as_ref())?;
    info!(
        workers = config.max_workers,
        disable_worker = config.disable_worker,
        "Monie plugin runtime starting"
    );
    PluginRuntime::from_module(config, &sample_module(), &declaration)?
        .run_stdio()
        .await
}

#[tokio::main(flavor = "current_thread")] // Handlers share one thread; CPU work goes to the pool
async fn main() -> ExitCode {
    // stdout carries the protocol, so diagnostics go to stderr
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "plugin runtime failed");
            ExitCode::FAILURE
        }
    }
}
