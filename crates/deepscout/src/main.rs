use anyhow::Result;
use clap::{Parser, Subcommand};

use std::sync::Arc;
use std::time::Duration;

use deepscout_local::{LlmGateway, PageReader, ReaderFetcher, Researcher, SerperClient};

#[derive(Parser, Debug)]
#[command(name = "deepscout")]
#[command(about = "Research tools for LLM agents (MCP stdio server)", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as an MCP stdio server (for Cursor / MCP clients).
    #[cfg(feature = "stdio")]
    McpStdio,
    /// Run one research question end-to-end and print the report.
    Research(ResearchCmd),
    /// Diagnose configuration/launch issues (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version(VersionCmd),
}

#[derive(clap::Args, Debug)]
struct ResearchCmd {
    /// The research question.
    question: String,
    /// Maximum search rounds (clamped to 1..=10).
    #[arg(long, default_value_t = 3)]
    max_rounds: usize,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    /// Also spawn `deepscout mcp-stdio` as a child process and probe the MCP
    /// handshake (lists tools).
    #[arg(long, action = clap::ArgAction::Set, default_value_t = false)]
    check_stdio: bool,
    /// Timeout for the stdio probe (ms).
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
}

#[derive(clap::Args, Debug)]
struct VersionCmd {
    /// Output format. Allowed: json, text
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

/// All live components, wired once at startup and shared behind Arcs.
struct Components {
    llm: Arc<LlmGateway>,
    search: Arc<SerperClient>,
    reader: Arc<PageReader<LlmGateway>>,
    researcher: Researcher<LlmGateway, SerperClient, PageReader<LlmGateway>>,
}

fn build_components() -> deepscout_core::Result<Components> {
    // Separate clients: page fetches tolerate slower handshakes than chat
    // calls, and their pools should not compete.
    let fetch_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(20))
        .user_agent(concat!("deepscout/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| deepscout_core::Error::Transport(e.to_string()))?;
    let llm_client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| deepscout_core::Error::Transport(e.to_string()))?;

    let llm = Arc::new(LlmGateway::from_env(llm_client)?);
    let search = Arc::new(SerperClient::from_env(fetch_client.clone())?);
    let fetcher = Arc::new(ReaderFetcher::from_env(fetch_client)?);
    let reader = Arc::new(PageReader::new(llm.clone(), fetcher));
    let researcher = Researcher::new(llm.clone(), search.clone(), reader.clone());

    Ok(Components {
        llm,
        search,
        reader,
        researcher,
    })
}

fn has_env(k: &str) -> bool {
    std::env::var(k).ok().is_some_and(|v| !v.trim().is_empty())
}

/// Env presence only (booleans; never values).
fn doctor_env_checks() -> serde_json::Value {
    let serper_configured = has_env("DEEPSCOUT_SERPER_API_KEY") || has_env("SERPER_API_KEY");
    let reader_configured = has_env("DEEPSCOUT_READER_API_KEY") || has_env("JINA_API_KEY");
    let llm_configured = has_env("DEEPSCOUT_LLM_API_KEY") || has_env("LLM_API_KEY");
    let summary_llm_configured =
        has_env("DEEPSCOUT_SUMMARY_LLM_API_KEY") || has_env("SUMMARY_LLM_API_KEY");

    serde_json::json!({
        "serper_configured": serper_configured,
        "reader_configured": reader_configured,
        "llm_configured": llm_configured,
        "summary_llm_configured": summary_llm_configured,
    })
}

#[cfg(feature = "stdio")]
mod mcp {
    use super::*;
    use deepscout_core::{Reader, SearchKind};
    use rmcp::{
        handler::server::router::tool::ToolRouter as RmcpToolRouter,
        handler::server::wrapper::Parameters,
        model::{CallToolResult, Content, ServerCapabilities, ServerInfo},
        tool, tool_handler, tool_router,
        transport::stdio,
        ErrorData as McpError, ServiceExt,
    };
    use schemars::JsonSchema;
    use serde::Deserialize;

    fn text_result(msg: impl Into<String>) -> CallToolResult {
        CallToolResult::success(vec![Content::text(msg.into())])
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct WebSearchArgs {
        /// Search query (required).
        #[serde(default)]
        query: Option<String>,
        /// How many results to return (default: 10; max: 20).
        #[serde(default)]
        num_results: Option<usize>,
        /// "search" (default) for general results or "news" for the last week.
        #[serde(default)]
        search_type: Option<String>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct WebReadArgs {
        /// URL to read (required).
        #[serde(default)]
        url: Option<String>,
        /// What to look for on the page; omitted means a general extraction.
        #[serde(default)]
        query: Option<String>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct WebSummarizeArgs {
        /// Text to condense (required).
        #[serde(default)]
        content: Option<String>,
        /// How to condense it; omitted means a plain summary.
        #[serde(default)]
        instruction: Option<String>,
    }

    #[derive(Debug, Deserialize, JsonSchema, Default)]
    struct WebResearchArgs {
        /// The research question (required).
        #[serde(default)]
        question: Option<String>,
        /// Maximum search rounds (default: 3; clamped to 1..=10).
        #[serde(default)]
        max_rounds: Option<usize>,
    }

    #[derive(Clone)]
    pub(crate) struct DeepscoutMcp {
        tool_router: RmcpToolRouter<Self>,
        search: Arc<SerperClient>,
        reader: Arc<PageReader<LlmGateway>>,
        llm: Arc<LlmGateway>,
        researcher: Researcher<LlmGateway, SerperClient, PageReader<LlmGateway>>,
    }

    #[tool_router]
    impl DeepscoutMcp {
        pub(crate) fn new() -> Result<Self, McpError> {
            let c = super::build_components()
                .map_err(|e| McpError::internal_error(e.to_string(), None))?;
            Ok(Self {
                tool_router: Self::tool_router(),
                search: c.search,
                reader: c.reader,
                llm: c.llm,
                researcher: c.researcher,
            })
        }

        #[tool(description = "Search the web by keyword; returns numbered results with links")]
        async fn web_search(
            &self,
            params: Parameters<Option<WebSearchArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let query = args.query.unwrap_or_default();
            if query.trim().is_empty() {
                return Ok(text_result("Error: query must be non-empty"));
            }
            let num_results = args.num_results.unwrap_or(10).clamp(1, 20);
            let kind = match args.search_type.as_deref() {
                Some("news") => SearchKind::News,
                _ => SearchKind::Web,
            };

            match self.search.search(&query, num_results, kind).await {
                Ok(text) => Ok(text_result(text)),
                Err(e) => Ok(text_result(format!("Error: {e}"))),
            }
        }

        #[tool(
            description = "Read a web page as text; with a focus query, extracts the relevant parts"
        )]
        async fn web_read(
            &self,
            params: Parameters<Option<WebReadArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let url = args.url.unwrap_or_default();
            if url.trim().is_empty() {
                return Ok(text_result("Error: url must be non-empty"));
            }
            let focus = args.query.as_deref().filter(|f| !f.trim().is_empty());

            match self.reader.read(&url, focus).await {
                Ok(text) => Ok(text_result(text)),
                Err(e) => Ok(text_result(format!("Error: {e}"))),
            }
        }

        #[tool(description = "Condense provided text, optionally following an instruction")]
        async fn web_summarize(
            &self,
            params: Parameters<Option<WebSummarizeArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let content = args.content.unwrap_or_default();
            if content.trim().is_empty() {
                return Ok(text_result("Error: content must be non-empty"));
            }
            let instruction = args
                .instruction
                .as_deref()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(deepscout_local::summarize::DEFAULT_INSTRUCTION);

            match deepscout_local::summarize::summarize(self.llm.as_ref(), &content, instruction)
                .await
            {
                Ok(text) => Ok(text_result(text)),
                Err(e) => Ok(text_result(format!("Error: {e}"))),
            }
        }

        #[tool(
            description = "Autonomous multi-round web research: plans queries, reads sources, returns a cited report"
        )]
        async fn web_research(
            &self,
            params: Parameters<Option<WebResearchArgs>>,
        ) -> Result<CallToolResult, McpError> {
            let args = params.0.unwrap_or_default();
            let question = args.question.unwrap_or_default();
            if question.trim().is_empty() {
                return Ok(text_result("Error: question must be non-empty"));
            }
            let max_rounds = args.max_rounds.unwrap_or(3).clamp(1, 10);

            match self.researcher.run(&question, max_rounds).await {
                Ok(report) => Ok(text_result(report)),
                Err(e) => Ok(text_result(format!("Error: {e}"))),
            }
        }
    }

    #[tool_handler]
    impl rmcp::ServerHandler for DeepscoutMcp {
        fn get_info(&self) -> ServerInfo {
            ServerInfo {
                instructions: Some(
                    "Research tools: keyword search, focused page reading, summarization, and autonomous multi-round research."
                        .to_string(),
                ),
                capabilities: ServerCapabilities::builder().enable_tools().build(),
                ..Default::default()
            }
        }
    }

    pub(crate) async fn serve_stdio() -> Result<(), McpError> {
        let svc = DeepscoutMcp::new()?;
        let running = svc
            .serve(stdio())
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        // Keep the stdio server alive until the client closes.
        running
            .waiting()
            .await
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(())
    }

}

#[tokio::main]
async fn main() -> Result<()> {
    // Optional env-file loader (opt-in). MCP server environments often are
    // not interactive shells; a single file keeps keys in one place. Sets
    // vars only when unset, never logs values.
    if let Ok(p) = std::env::var("DEEPSCOUT_ENV_FILE") {
        let p = p.trim();
        if !p.is_empty() {
            if let Ok(txt) = std::fs::read_to_string(p) {
                for raw in txt.lines() {
                    let s = raw.trim();
                    if s.is_empty() || s.starts_with('#') {
                        continue;
                    }
                    let Some((k, v)) = s.split_once('=') else {
                        continue;
                    };
                    let k = k.trim();
                    let v = v.trim();
                    if k.is_empty() {
                        continue;
                    }
                    if std::env::var_os(k).is_none() {
                        std::env::set_var(k, v);
                    }
                }
            }
        }
    }

    // Logs go to stderr: stdout is the MCP transport.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        #[cfg(feature = "stdio")]
        Commands::McpStdio => {
            tracing::info!(version = env!("CARGO_PKG_VERSION"), "serving MCP over stdio");
            mcp::serve_stdio()
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        Commands::Research(args) => {
            let c = build_components().map_err(|e| anyhow::anyhow!(e.to_string()))?;
            let max_rounds = args.max_rounds.clamp(1, 10);
            let report = c
                .researcher
                .run(&args.question, max_rounds)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            println!("{report}");
        }
        Commands::Doctor(args) => {
            let mut payload = serde_json::json!({
                "schema_version": 1,
                "kind": "doctor",
                "ok": true,
                "env": doctor_env_checks(),
            });

            #[cfg(feature = "stdio")]
            if args.check_stdio {
                use rmcp::service::ServiceExt;
                use rmcp::transport::{ConfigureCommandExt, TokioChildProcess};
                use tokio::process::Command;

                let exe = std::env::current_exe()
                    .unwrap_or_else(|_| std::path::PathBuf::from("deepscout"));
                let child = TokioChildProcess::new(Command::new(exe).configure(|cmd| {
                    cmd.args(["mcp-stdio"]);
                    cmd.env("RUST_LOG", "error");
                }))?;

                let t0 = std::time::Instant::now();
                let probe = async {
                    let service = ().serve(child).await?;
                    let tools = tokio::time::timeout(
                        Duration::from_millis(args.timeout_ms),
                        service.list_tools(Default::default()),
                    )
                    .await??;
                    anyhow::Ok(tools.tools.len())
                }
                .await;

                match probe {
                    Ok(n) => {
                        payload["stdio"] = serde_json::json!({
                            "ok": true,
                            "tool_count": n,
                            "elapsed_ms": t0.elapsed().as_millis() as u64,
                        });
                    }
                    Err(e) => {
                        payload["ok"] = serde_json::json!(false);
                        payload["stdio"] = serde_json::json!({
                            "ok": false,
                            "error": e.to_string(),
                            "hint": "Set the search/reader/LLM keys before launching the server.",
                        });
                    }
                }
            }
            #[cfg(not(feature = "stdio"))]
            let _ = args;

            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Version(args) => {
            if args.output == "text" {
                println!("deepscout {}", env!("CARGO_PKG_VERSION"));
            } else {
                let v = serde_json::json!({
                    "schema_version": 1,
                    "kind": "version",
                    "ok": true,
                    "name": "deepscout",
                    "version": env!("CARGO_PKG_VERSION"),
                });
                println!("{}", serde_json::to_string_pretty(&v)?);
            }
        }
    }

    Ok(())
}
