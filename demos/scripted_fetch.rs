//! Example: fetching a token from page script through the bridge
//!
//! Run with: cargo run --example scripted_fetch

use async_trait::async_trait;
use attestee_core::{
    render_script_call, AgentConfig, AttestationAgent, AttestationError, Attester, Headers,
    QueueContext, ScriptSurface, WebContent, WebContentError, WebContentKind,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Stand-in for the attestation service client.
struct SimulatedAttester {
    calls: AtomicUsize,
}

#[async_trait]
impl Attester for SimulatedAttester {
    async fn attest(&self) -> Result<String, AttestationError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok(format!("demo-token-{}", n))
    }
}

/// Web view that prints what the page would execute.
struct ConsoleWebView {
    name: &'static str,
    bridge: Mutex<Option<ScriptSurface>>,
    user_agent: Mutex<String>,
}

impl ConsoleWebView {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            bridge: Mutex::new(None),
            user_agent: Mutex::new("Mozilla/5.0 (Demo)".to_string()),
        }
    }
}

impl WebContent for ConsoleWebView {
    fn kind(&self) -> WebContentKind {
        WebContentKind::Modern
    }

    fn inject_script_object(&self, name: &str, surface: ScriptSurface) -> Result<(), WebContentError> {
        println!("   [{}] injected window.{}.{}", self.name, name, surface.function_name());
        *self.bridge.lock() = Some(surface);
        Ok(())
    }

    fn remove_script_object(&self, name: &str) {
        println!("   [{}] removed window.{}", self.name, name);
        self.bridge.lock().take();
    }

    fn invoke_script_function(&self, function: &str, args: &[String]) {
        println!("   [{}] eval: {}", self.name, render_script_call(function, args));
    }

    fn add_outgoing_header(&self, key: &str, value: &str) {
        println!("   [{}] header {}: {}", self.name, key, value);
    }

    fn user_agent(&self) -> String {
        self.user_agent.lock().clone()
    }

    fn set_user_agent(&self, user_agent: &str) {
        println!("   [{}] user agent: {}", self.name, user_agent);
        *self.user_agent.lock() = user_agent.to_string();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    println!("Attestee - Scripted Token Fetch\n");
    println!("================================\n");

    // Step 1: Build the agent with a UI queue
    println!("1. Building agent...");
    let attester = Arc::new(SimulatedAttester {
        calls: AtomicUsize::new(0),
    });
    let (ui, driver) = QueueContext::new();
    let config = AgentConfig::from_json_str(r#"{"append_token_header": true}"#)?;
    let agent = AttestationAgent::builder(attester.clone())
        .config(config)
        .context(ui)
        .build()?;
    let ui_thread = tokio::spawn(driver.run());
    println!("   done\n");

    // Step 2: Register two web views
    println!("2. Registering web content...");
    let checkout: Arc<dyn WebContent> = Arc::new(ConsoleWebView::new("checkout"));
    let help: Arc<dyn WebContent> = Arc::new(ConsoleWebView::new("help"));
    agent.register(&checkout);
    agent.register(&help);
    println!();

    // Step 3: Both pages ask for a token at once
    println!("3. Pages request tokens concurrently...");
    agent.subscribe(|event| println!("   observer: {} ({})", event.result, event.fetch_id));
    agent.on_scripted_fetch_requested(&checkout, "onToken", "onTokenFailed");
    agent.on_scripted_fetch_requested(&help, "help.tokenReady", "help.tokenError");
    agent.fetch();
    tokio::time::sleep(Duration::from_millis(300)).await;
    println!(
        "   attestation calls made: {}\n",
        attester.calls.load(Ordering::SeqCst)
    );

    // Step 4: Outgoing request headers
    println!("4. Augmenting an outgoing request...");
    let mut headers = Headers::new();
    headers.insert("Accept".to_string(), "application/json".to_string());
    agent.augment(&mut headers, &checkout);
    for (key, value) in &headers {
        println!("   {}: {}", key, value);
    }
    println!();

    // Step 5: Teardown
    println!("5. Shutting down...");
    agent.shutdown();
    drop(agent);
    ui_thread.abort();
    println!("\nCurrent token is never persisted; the next launch attests again.");

    Ok(())
}
