//! mcpproxy: the daemon and its control CLI in one binary

use std::collections::HashMap;
use std::io::Write;
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use serde_json::{json, Value};

mod cli;
mod client;
mod serve;

use cli::{AuthCommands, Cli, Commands, ToolsCommands, UpstreamCommands};
use client::{ApiClient, CliError, CliResult, EXIT_GENERAL, EXIT_OK};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let code = match cli.command {
        Commands::Serve {
            listen,
            log_level,
            config,
        } => match serve::run(listen, log_level, config).await {
            Ok(()) => EXIT_OK,
            Err(e) => {
                eprintln!("{} {:#}", "error:".red().bold(), e);
                EXIT_GENERAL
            }
        },
        command => {
            let api = ApiClient::new(cli.api_url, cli.api_key);
            match dispatch(command, &api).await {
                Ok(()) => EXIT_OK,
                Err(e) => {
                    eprintln!("{} {}", "error:".red().bold(), e.message);
                    if let Some(suggestion) = &e.suggestion {
                        eprintln!("{} {}", "hint:".yellow().bold(), suggestion);
                    }
                    if let Some(hint) = &e.debug_hint {
                        eprintln!("{} {}", "debug:".dimmed(), hint);
                    }
                    e.exit_code
                }
            }
        }
    };

    ExitCode::from(code)
}

async fn dispatch(command: Commands, api: &ApiClient) -> CliResult<()> {
    match command {
        Commands::Serve { .. } => unreachable!("handled in main"),
        Commands::Upstream { command } => upstream(command, api).await,
        Commands::Auth { command } => auth(command, api).await,
        Commands::Tools { command } => tools(command, api).await,
        Commands::Doctor { output } => doctor(&output, api).await,
    }
}

async fn upstream(command: UpstreamCommands, api: &ApiClient) -> CliResult<()> {
    match command {
        UpstreamCommands::List => {
            let servers = api.get("/api/v1/servers").await?;
            print_server_table(servers.as_array().cloned().unwrap_or_default());
            Ok(())
        }
        UpstreamCommands::Add(args) => {
            let config = build_add_config(&args)?;
            let name = config["name"].as_str().unwrap_or_default().to_string();

            let result = api.post("/api/v1/servers", Some(&config)).await;
            match result {
                Ok(_) => {
                    println!(
                        "{} added '{}' (quarantined; approve with: mcpproxy upstream unquarantine {})",
                        "ok:".green().bold(),
                        name,
                        name
                    );
                    Ok(())
                }
                Err(e) if args.if_not_exists && e.message.contains("already exists") => {
                    println!("'{}' already exists, nothing to do", name);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        UpstreamCommands::AddJson { name, json: body } => {
            let mut config: Value = serde_json::from_str(&body)
                .map_err(|e| CliError::validation(format!("invalid JSON: {}", e)))?;
            config["name"] = Value::String(name.clone());
            api.post("/api/v1/servers", Some(&config)).await?;
            println!("{} added '{}'", "ok:".green().bold(), name);
            Ok(())
        }
        UpstreamCommands::Remove {
            name,
            yes,
            if_exists,
        } => {
            if !yes && !confirm(&format!("Remove server '{}'?", name)) {
                println!("aborted");
                return Ok(());
            }
            match api.delete(&format!("/api/v1/servers/{}", name)).await {
                Ok(_) => {
                    println!("{} removed '{}'", "ok:".green().bold(), name);
                    Ok(())
                }
                Err(e) if if_exists && e.message.contains("not found") => {
                    println!("'{}' does not exist, nothing to do", name);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        }
        UpstreamCommands::Enable { name } => verb(api, &name, "enable").await,
        UpstreamCommands::Disable { name } => verb(api, &name, "disable").await,
        UpstreamCommands::Restart { name } => verb(api, &name, "restart").await,
        UpstreamCommands::Quarantine { name } => verb(api, &name, "quarantine").await,
        UpstreamCommands::Unquarantine { name } => verb(api, &name, "unquarantine").await,
        UpstreamCommands::Logs { name } => {
            let lines = api
                .get(&format!("/api/v1/servers/{}/logs", name))
                .await?;
            for line in lines.as_array().cloned().unwrap_or_default() {
                println!("{}", line.as_str().unwrap_or_default());
            }
            Ok(())
        }
    }
}

async fn verb(api: &ApiClient, name: &str, action: &str) -> CliResult<()> {
    api.post(&format!("/api/v1/servers/{}/{}", name, action), None)
        .await?;
    println!("{} {} '{}'", "ok:".green().bold(), action, name);
    Ok(())
}

/// Build the server config JSON from the add arguments, auto-detecting
/// the transport: a URL means HTTP, a `--` command means stdio.
fn build_add_config(args: &cli::AddArgs) -> CliResult<Value> {
    let mut env = HashMap::new();
    for pair in &args.env {
        let (key, value) = cli::parse_env_pair(pair).map_err(CliError::validation)?;
        env.insert(key, value);
    }
    let mut headers = HashMap::new();
    for pair in &args.header {
        let (name, value) = cli::parse_header_pair(pair).map_err(CliError::validation)?;
        headers.insert(name, value);
    }

    let mut config = json!({ "name": args.name });

    match (&args.url, args.command.is_empty()) {
        (Some(url), true) => {
            config["url"] = json!(url);
            if !headers.is_empty() {
                config["headers"] = json!(headers);
            }
        }
        (None, false) => {
            config["protocol"] = json!("stdio");
            config["command"] = json!(args.command[0]);
            if args.command.len() > 1 {
                config["args"] = json!(args.command[1..]);
            }
            if let Some(dir) = &args.working_dir {
                config["working_dir"] = json!(dir);
            }
        }
        (Some(_), false) => {
            return Err(CliError::validation(
                "give either a URL or '-- command', not both",
            ));
        }
        (None, true) => {
            return Err(CliError::validation(
                "give a URL for HTTP servers or '-- command [args...]' for stdio servers",
            ));
        }
    }

    if !env.is_empty() {
        config["env"] = json!(env);
    }
    if let Some(transport) = &args.transport {
        config["protocol"] = json!(transport);
    }

    Ok(config)
}

async fn auth(command: AuthCommands, api: &ApiClient) -> CliResult<()> {
    match command {
        AuthCommands::Login { server } => {
            let response = api
                .mcp_login(&server)
                .await?;
            let correlation = response["correlation_id"].as_str().unwrap_or_default();
            if response["browser_opened"].as_bool().unwrap_or(false) {
                println!(
                    "{} browser opened; finish the login there (flow {})",
                    "ok:".green().bold(),
                    correlation
                );
            } else {
                println!("Open this URL to authorize '{}':", server);
                println!("\n  {}\n", response["auth_url"].as_str().unwrap_or_default());
                if let Some(err) = response["browser_error"].as_str() {
                    println!("({})", err.dimmed());
                }
            }
            Ok(())
        }
        AuthCommands::Logout { server } => {
            api.post(&format!("/api/v1/servers/{}/logout", server), None)
                .await?;
            println!("{} logged out '{}'", "ok:".green().bold(), server);
            Ok(())
        }
        AuthCommands::Status => {
            let servers = api.get("/api/v1/servers").await?;
            for server in servers.as_array().cloned().unwrap_or_default() {
                let name = server["name"].as_str().unwrap_or_default();
                let status = server["oauth_status"].as_str().unwrap_or("—");
                let expires = server["token_expires_at"].as_str().unwrap_or("");
                println!("{:<24} {:<16} {}", name, status, expires);
            }
            Ok(())
        }
    }
}

async fn tools(command: ToolsCommands, api: &ApiClient) -> CliResult<()> {
    match command {
        ToolsCommands::List => {
            let tools = api.get("/api/v1/tools").await?;
            for tool in tools.as_array().cloned().unwrap_or_default() {
                println!(
                    "{:<40} {}",
                    tool["name"].as_str().unwrap_or_default().bold(),
                    tool["description"].as_str().unwrap_or_default()
                );
            }
            Ok(())
        }
        ToolsCommands::Call { name, args } => {
            let parsed: Value = serde_json::from_str(&args)
                .map_err(|e| CliError::validation(format!("invalid --args JSON: {}", e)))?;
            let response = api
                .mcp(&json!({
                    "jsonrpc": "2.0",
                    "id": 1,
                    "method": "tools/call",
                    "params": { "name": "call_tool", "arguments": { "name": name, "args": parsed } }
                }))
                .await?;

            if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
                return Err(CliError::validation(
                    error["data"]
                        .as_str()
                        .or(error["message"].as_str())
                        .unwrap_or("tool call failed")
                        .to_string(),
                ));
            }
            println!(
                "{}",
                serde_json::to_string_pretty(&response["result"]).unwrap_or_default()
            );
            Ok(())
        }
    }
}

async fn doctor(output: &str, api: &ApiClient) -> CliResult<()> {
    let report = api.get("/api/v1/diagnostics").await?;

    if output == "json" {
        println!("{}", serde_json::to_string_pretty(&report).unwrap_or_default());
        return Ok(());
    }

    let oauth = report["oauth_required"].as_array().cloned().unwrap_or_default();
    let errors = report["upstream_errors"].as_array().cloned().unwrap_or_default();
    let secrets = report["missing_secrets"].as_object().cloned().unwrap_or_default();

    if oauth.is_empty() && errors.is_empty() && secrets.is_empty() {
        println!("{} all servers healthy", "ok:".green().bold());
        return Ok(());
    }

    if !oauth.is_empty() {
        println!("{}", "OAuth Required".yellow().bold());
        for server in &oauth {
            let name = server.as_str().unwrap_or_default();
            println!("  {}  (mcpproxy auth login --server={})", name, name);
        }
    }
    if !secrets.is_empty() {
        println!("{}", "Missing Secrets".yellow().bold());
        for (secret, servers) in &secrets {
            println!("  {}  needed by {:?}", secret, servers);
        }
    }
    if !errors.is_empty() {
        println!("{}", "Upstream Errors".red().bold());
        for problem in &errors {
            println!(
                "  {:<24} {}",
                problem["server"].as_str().unwrap_or_default(),
                problem["summary"].as_str().unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn print_server_table(servers: Vec<Value>) {
    println!(
        "{:<24} {:<18} {:<10} {:<8} {}",
        "NAME".bold(),
        "PROTOCOL".bold(),
        "TOOLS".bold(),
        "STATE".bold(),
        "HEALTH".bold()
    );
    for server in servers {
        let health = &server["health"];
        let level = health["level"].as_str().unwrap_or_default();
        let colored_level = match level {
            "healthy" => level.green(),
            "degraded" => level.yellow(),
            _ => level.red(),
        };
        println!(
            "{:<24} {:<18} {:<10} {:<8} {} — {}",
            server["name"].as_str().unwrap_or_default(),
            server["protocol"].as_str().unwrap_or_default(),
            server["tool_count"].as_u64().unwrap_or(0),
            if server["enabled"].as_bool().unwrap_or(false) { "on" } else { "off" },
            colored_level,
            health["summary"].as_str().unwrap_or_default()
        );
    }
}

fn confirm(prompt: &str) -> bool {
    print!("{} [y/N] ", prompt);
    std::io::stdout().flush().ok();
    let mut answer = String::new();
    std::io::stdin().read_line(&mut answer).ok();
    matches!(answer.trim().to_lowercase().as_str(), "y" | "yes")
}

impl ApiClient {
    /// `POST /servers/{name}/login`, which answers outside the envelope
    async fn mcp_login(&self, server: &str) -> CliResult<Value> {
        let response = self
            .post_raw(&format!("/api/v1/servers/{}/login", server))
            .await?;
        if response.get("success").and_then(Value::as_bool) == Some(true) {
            Ok(response)
        } else {
            Err(CliError {
                message: response["message"]
                    .as_str()
                    .unwrap_or("login failed")
                    .to_string(),
                suggestion: response["suggestion"].as_str().map(String::from),
                debug_hint: response["debug_hint"].as_str().map(String::from),
                exit_code: client::EXIT_VALIDATION,
            })
        }
    }
}
