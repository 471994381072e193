//! Command-line interface definitions

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "mcpproxy", about = "Aggregating MCP proxy daemon", version)]
pub struct Cli {
    /// Core API base URL for client commands
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
    pub api_url: String,

    /// API key (falls back to MCPPROXY_API_KEY)
    #[arg(long, global = true)]
    pub api_key: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the proxy daemon
    Serve {
        /// Listen address override
        #[arg(long)]
        listen: Option<String>,

        /// Log level override (trace|debug|info|warn|error)
        #[arg(long)]
        log_level: Option<String>,

        /// Config file path (defaults to ~/.mcpproxy/mcp_config.json)
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Manage upstream servers
    Upstream {
        #[command(subcommand)]
        command: UpstreamCommands,
    },

    /// OAuth login, logout and status
    Auth {
        #[command(subcommand)]
        command: AuthCommands,
    },

    /// Inspect and invoke aggregated tools
    Tools {
        #[command(subcommand)]
        command: ToolsCommands,
    },

    /// Aggregate health diagnostics
    Doctor {
        /// Output format
        #[arg(long, default_value = "text", value_parser = ["text", "json"])]
        output: String,
    },
}

#[derive(Subcommand)]
pub enum UpstreamCommands {
    /// List configured servers
    List,

    /// Add a server: a URL for HTTP, or `-- <command> [args...]` for stdio
    Add(AddArgs),

    /// Add a server from a full JSON object
    AddJson {
        name: String,

        /// The server configuration as JSON
        json: String,
    },

    /// Remove a server
    Remove {
        name: String,

        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,

        /// Succeed even when the server does not exist
        #[arg(long)]
        if_exists: bool,
    },

    /// Enable a server
    Enable { name: String },

    /// Disable a server
    Disable { name: String },

    /// Restart a server's connection
    Restart { name: String },

    /// Lift a server's quarantine
    Unquarantine { name: String },

    /// Quarantine a server
    Quarantine { name: String },

    /// Tail captured child output
    Logs { name: String },
}

#[derive(Args)]
pub struct AddArgs {
    pub name: String,

    /// Endpoint URL (HTTP-family transports)
    pub url: Option<String>,

    /// Transport override (stdio|http|sse|streamable-http)
    #[arg(long)]
    pub transport: Option<String>,

    /// Environment variable KEY=value (repeatable; first '=' separates)
    #[arg(long = "env")]
    pub env: Vec<String>,

    /// HTTP header "Name: value" (repeatable)
    #[arg(long = "header")]
    pub header: Vec<String>,

    /// Working directory for stdio servers
    #[arg(long)]
    pub working_dir: Option<String>,

    /// Succeed without changes when the server already exists
    #[arg(long)]
    pub if_not_exists: bool,

    /// Command and arguments for stdio servers
    #[arg(last = true)]
    pub command: Vec<String>,
}

#[derive(Subcommand)]
pub enum AuthCommands {
    /// Start the OAuth login flow for a server
    Login {
        #[arg(long)]
        server: String,
    },

    /// Drop a server's stored token
    Logout {
        #[arg(long)]
        server: String,
    },

    /// Show token status for every server
    Status,
}

#[derive(Subcommand)]
pub enum ToolsCommands {
    /// List the aggregated tool catalog
    List,

    /// Call a tool by its qualified name
    Call {
        name: String,

        /// Tool arguments as JSON
        #[arg(long, default_value = "{}")]
        args: String,
    },
}

/// Split `KEY=value` on the first `=`
pub fn parse_env_pair(pair: &str) -> Result<(String, String), String> {
    match pair.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("invalid --env '{}', expected KEY=value", pair)),
    }
}

/// Split `"Name: value"` on the first `:`
pub fn parse_header_pair(pair: &str) -> Result<(String, String), String> {
    match pair.split_once(':') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(format!("invalid --header '{}', expected 'Name: value'", pair)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_env_pair_parsing() {
        assert_eq!(
            parse_env_pair("KEY=value").unwrap(),
            ("KEY".to_string(), "value".to_string())
        );
        // first '=' is the separator
        assert_eq!(
            parse_env_pair("KEY=a=b=c").unwrap(),
            ("KEY".to_string(), "a=b=c".to_string())
        );
        assert!(parse_env_pair("novalue").is_err());
        assert!(parse_env_pair("=orphan").is_err());
    }

    #[test]
    fn test_header_pair_parsing() {
        assert_eq!(
            parse_header_pair("Authorization: Bearer x").unwrap(),
            ("Authorization".to_string(), "Bearer x".to_string())
        );
        assert!(parse_header_pair("nocolon").is_err());
    }

    #[test]
    fn test_stdio_add_after_double_dash() {
        let cli = Cli::parse_from([
            "mcpproxy", "upstream", "add", "everything", "--env", "TOKEN=x", "--",
            "npx", "-y", "@modelcontextprotocol/server-everything",
        ]);
        match cli.command {
            Commands::Upstream {
                command: UpstreamCommands::Add(args),
            } => {
                assert_eq!(args.name, "everything");
                assert_eq!(args.url, None);
                assert_eq!(args.command[0], "npx");
                assert_eq!(args.env, vec!["TOKEN=x"]);
            }
            _ => panic!("parsed into the wrong command"),
        }
    }

    #[test]
    fn test_http_add_with_url() {
        let cli = Cli::parse_from([
            "mcpproxy", "upstream", "add", "gh", "https://api.github.com/mcp",
        ]);
        match cli.command {
            Commands::Upstream {
                command: UpstreamCommands::Add(args),
            } => {
                assert_eq!(args.url.as_deref(), Some("https://api.github.com/mcp"));
                assert!(args.command.is_empty());
            }
            _ => panic!("parsed into the wrong command"),
        }
    }
}
