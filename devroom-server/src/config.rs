use std::path::PathBuf;

use clap::Parser;
use devroom_sdk::CommandSpec;

/// devroom server configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "devroom-server", about = "Collaborative project rooms with an AI teammate")]
pub struct ServerConfig {
    /// HTTP/WebSocket listen address.
    #[arg(long, env = "DEVROOM_LISTEN", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Shared secret for HS256 session tokens.
    #[arg(long, env = "DEVROOM_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,

    /// Gemini API key. Without it every AI turn fails.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    pub gemini_api_key: Option<String>,

    /// Generative model name.
    #[arg(long, default_value = devroom_agent::persona::DEFAULT_MODEL)]
    pub model: String,

    /// Sampling temperature for the model.
    #[arg(long, default_value_t = devroom_agent::persona::DEFAULT_TEMPERATURE)]
    pub temperature: f32,

    /// Only forward messages containing this mention (e.g. "@ai") to the model.
    /// Unset: every human message is a prompt.
    #[arg(long, env = "DEVROOM_AI_MENTION")]
    pub ai_mention: Option<String>,

    /// Directory holding one sandbox directory per project.
    #[arg(long, env = "DEVROOM_SANDBOX_ROOT", default_value = "/tmp/devroom-sandboxes")]
    pub sandbox_root: PathBuf,

    /// Host used in preview URLs.
    #[arg(long, default_value = "127.0.0.1")]
    pub preview_host: String,

    /// SQLite database for file trees. Unset keeps trees in memory.
    #[arg(long, env = "DEVROOM_DB")]
    pub db_path: Option<PathBuf>,

    /// Per-connection outbound queue capacity.
    #[arg(long, default_value_t = 256)]
    pub outbound_queue: usize,

    /// Messages kept in each channel's in-memory log.
    #[arg(long, default_value_t = 100)]
    pub history_limit: usize,

    /// Build command used when neither the request nor the last directive has one.
    #[arg(long, default_value = "npm install")]
    pub default_build: String,

    /// Start command used when neither the request nor the last directive has one.
    #[arg(long, default_value = "npm start")]
    pub default_start: String,

    /// Recent sandbox output lines kept per project.
    #[arg(long, default_value_t = 200)]
    pub output_buffer_lines: usize,

    /// Browser origins allowed to call the API with credentials.
    #[arg(
        long,
        env = "DEVROOM_CORS_ORIGINS",
        value_delimiter = ',',
        default_value = "http://localhost:5173,http://127.0.0.1:5173"
    )]
    pub cors_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            jwt_secret: String::new(),
            gemini_api_key: None,
            model: devroom_agent::persona::DEFAULT_MODEL.to_string(),
            temperature: devroom_agent::persona::DEFAULT_TEMPERATURE,
            ai_mention: None,
            sandbox_root: PathBuf::from("/tmp/devroom-sandboxes"),
            preview_host: "127.0.0.1".to_string(),
            db_path: None,
            outbound_queue: 256,
            history_limit: 100,
            default_build: "npm install".to_string(),
            default_start: "npm start".to_string(),
            output_buffer_lines: 200,
            cors_origins: vec![
                "http://localhost:5173".to_string(),
                "http://127.0.0.1:5173".to_string(),
            ],
        }
    }
}

impl ServerConfig {
    pub fn default_build_command(&self) -> Option<CommandSpec> {
        parse_command_line(&self.default_build)
    }

    pub fn default_start_command(&self) -> Option<CommandSpec> {
        parse_command_line(&self.default_start)
    }
}

/// Split a whitespace-separated command line. Empty input means "no command".
pub fn parse_command_line(line: &str) -> Option<CommandSpec> {
    let mut parts = line.split_whitespace();
    let executable = parts.next()?;
    Some(CommandSpec::new(executable, parts))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_cli_defaults() {
        let parsed = ServerConfig::parse_from(["devroom-server", "--jwt-secret", "s"]);
        let default = ServerConfig {
            jwt_secret: "s".to_string(),
            ..Default::default()
        };
        assert_eq!(parsed.listen_addr, default.listen_addr);
        assert_eq!(parsed.model, default.model);
        assert_eq!(parsed.temperature, default.temperature);
        assert_eq!(parsed.history_limit, default.history_limit);
        assert_eq!(parsed.default_start, default.default_start);
        assert_eq!(parsed.cors_origins, default.cors_origins);
    }

    #[test]
    fn command_line_parsing() {
        assert_eq!(
            parse_command_line("npm install --silent"),
            Some(CommandSpec::new("npm", ["install", "--silent"]))
        );
        assert_eq!(parse_command_line("   "), None);
        assert_eq!(
            ServerConfig::default().default_start_command(),
            Some(CommandSpec::new("npm", ["start"]))
        );
    }
}
