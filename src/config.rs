//! Corefile parsing

use crate::plugin::{create_plugin, SharedState, Plugin};
use crate::plugin::prometheus::PLUGIN_ENABLED;
use crate::zones::{normalize_key, port_of_key};
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone, Debug, Default)]
pub struct PluginConfig {
    pub name: String,
    pub args: Vec<String>,
    pub block: Vec<PluginConfig>,
    /// Normalised keys of the enclosing server block.
    pub zones: Vec<String>,
}

pub struct Config {
    pub blocks: Vec<ServerBlock>,
}

/// One server block: its keys share one set of plugin instances.
pub struct ServerBlock {
    pub keys: Vec<String>,
    pub plugins: Vec<Box<dyn Plugin>>,
}

impl ServerBlock {
    /// (zone, port) for every key; keys without a port use `default_port`.
    pub fn listeners(&self, default_port: u16) -> Vec<(String, u16)> {
        self.keys
            .iter()
            .map(|k| (normalize_key(k), port_of_key(k).unwrap_or(default_port)))
            .collect()
    }
}

#[derive(Debug, PartialEq)]
enum Token { Text(String), OpenBrace, CloseBrace, Newline }

struct RawBlock { keys: Vec<String>, plugins: Vec<PluginConfig> }

impl Config {
    /// Load configuration from a file path
    pub fn load(path: &str, shared: Arc<SharedState>) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path, e))?;
        Self::parse(&content, shared)
    }

    pub fn parse(content: &str, shared: Arc<SharedState>) -> Result<Self> {
        let tokens = Self::lex(content);
        let raw_blocks = Self::parse_tokens(&tokens)?;
        let mut blocks = Vec::new();

        for raw in raw_blocks {
            let zones: Vec<String> = raw.keys.iter().map(|k| normalize_key(k)).collect();
            let mut seen = HashSet::new();
            let mut plugins = Vec::new();
            for p_cfg in &raw.plugins {
                if !seen.insert(p_cfg.name.as_str()) {
                    anyhow::bail!("plugin '{}' appears more than once in server block {:?}", p_cfg.name, raw.keys);
                }
                let p_cfg = PluginConfig { zones: zones.clone(), ..p_cfg.clone() };
                let plugin = create_plugin(&p_cfg, shared.clone())
                    .with_context(|| format!("server block {:?}", raw.keys))?;
                for key in &raw.keys {
                    let server = format!("dns://:{}", port_of_key(key).unwrap_or(53));
                    PLUGIN_ENABLED.with_label_values(&[&p_cfg.name, &server, &normalize_key(key)]).set(1.0);
                }
                plugins.push(plugin);
            }

            // 执行顺序由插件优先级决定，与 Corefile 书写顺序无关（从大到小）
            plugins.sort_by(|a, b| b.priority().cmp(&a.priority()));

            blocks.push(ServerBlock { keys: raw.keys, plugins });
        }
        Ok(Config { blocks })
    }

    pub fn plugins(&self) -> impl Iterator<Item = &Box<dyn Plugin>> {
        self.blocks.iter().flat_map(|b| b.plugins.iter())
    }

    fn lex(input: &str) -> Vec<Token> {
        let mut tokens = Vec::new();
        let mut chars = input.chars().peekable();
        while let Some(&c) = chars.peek() {
            if c == '\n' { tokens.push(Token::Newline); chars.next(); }
            else if c.is_whitespace() { chars.next(); }
            else if c == '#' { while let Some(&c) = chars.peek() { if c == '\n' { break; } chars.next(); } }
            else if c == '{' { tokens.push(Token::OpenBrace); chars.next(); }
            else if c == '}' { tokens.push(Token::CloseBrace); chars.next(); }
            else if c == '"' {
                chars.next();
                let mut s = String::new();
                while let Some(&c) = chars.peek() { if c == '"' { chars.next(); break; } s.push(c); chars.next(); }
                tokens.push(Token::Text(s));
            } else {
                let mut s = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || c == '#' || c == '{' || c == '}' || c == '"' { break; }
                    s.push(c); chars.next();
                }
                tokens.push(Token::Text(s));
            }
        }
        tokens
    }

    fn parse_tokens(tokens: &[Token]) -> Result<Vec<RawBlock>> {
        let mut i = 0;
        let mut blocks = Vec::new();
        let mut keys = Vec::new();
        while i < tokens.len() {
            match &tokens[i] {
                Token::Text(s) => { keys.push(s.clone()); i += 1; }
                Token::OpenBrace => {
                    if keys.is_empty() {
                        anyhow::bail!("server block without keys");
                    }
                    i += 1;
                    let (plugins, next_i) = Self::parse_block(tokens, i)?;
                    i = next_i;
                    blocks.push(RawBlock { keys: std::mem::take(&mut keys), plugins });
                }
                // 允许 key 分多行书写，如 "a.org \n b.org {"
                Token::Newline => { i += 1; }
                Token::CloseBrace => anyhow::bail!("unexpected '}}'"),
            }
        }
        if !keys.is_empty() {
            anyhow::bail!("server block {:?} has no body", keys);
        }
        Ok(blocks)
    }

    /// Parse a configuration block starting at position i
    fn parse_block(tokens: &[Token], mut i: usize) -> Result<(Vec<PluginConfig>, usize)> {
        let mut plugins = Vec::new();
        while i < tokens.len() {
            match &tokens[i] {
                Token::Newline => { i += 1; }
                Token::CloseBrace => { i += 1; return Ok((plugins, i)); }
                Token::Text(name) => {
                    let plugin_name = name.clone(); i += 1;
                    let mut args = Vec::new();
                    let mut block = Vec::new();
                    while i < tokens.len() {
                        match &tokens[i] {
                            Token::Text(arg) => { args.push(arg.clone()); i += 1; }
                            Token::OpenBrace => {
                                i += 1;
                                let (sub_block, next_i) = Self::parse_block(tokens, i)?;
                                block = sub_block; i = next_i; break;
                            }
                            Token::Newline | Token::CloseBrace => { break; }
                        }
                    }
                    plugins.push(PluginConfig { name: plugin_name, args, block, zones: Vec::new() });
                }
                Token::OpenBrace => anyhow::bail!("unexpected '{{'"),
            }
        }
        anyhow::bail!("unterminated block")
    }
}

/// "500ms", "5s", "2m", "1h".
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if let Some(stripped) = s.strip_suffix("ms") { Ok(Duration::from_millis(stripped.parse()?)) }
    else if let Some(stripped) = s.strip_suffix('s') { Ok(Duration::from_secs(stripped.parse()?)) }
    else if let Some(stripped) = s.strip_suffix('m') { Ok(Duration::from_secs(stripped.parse::<u64>()? * 60)) }
    else if let Some(stripped) = s.strip_suffix('h') { Ok(Duration::from_secs(stripped.parse::<u64>()? * 3600)) }
    else { anyhow::bail!("invalid duration '{}'", s) }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared() -> Arc<SharedState> {
        Arc::new(SharedState::new("Corefile".to_string()))
    }

    #[test]
    fn lexer_and_blocks() {
        let raw = Config::parse_tokens(&Config::lex(
            "# comment\ncluster.local in-addr.arpa:1053 {\n  kubepods {\n    names \"ip\"\n  }\n  log\n}\n",
        ))
        .unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].keys, vec!["cluster.local", "in-addr.arpa:1053"]);
        assert_eq!(raw[0].plugins.len(), 2);
        assert_eq!(raw[0].plugins[0].block[0].name, "names");
        assert_eq!(raw[0].plugins[0].block[0].args, vec!["ip"]);
    }

    #[test]
    fn malformed_corefiles() {
        for input in ["cluster.local {\n log\n", "{\n log\n}\n", "}\n", "cluster.local\n"] {
            assert!(Config::parse_tokens(&Config::lex(input)).is_err(), "{:?}", input);
        }
    }

    #[tokio::test]
    async fn builds_plugins_in_priority_order() {
        let cfg = Config::parse("cluster.local:1053 {\n kubepods {\n names echo-ip\n }\n log\n}\n", shared()).unwrap();
        let block = &cfg.blocks[0];
        let names: Vec<&str> = block.plugins.iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["log", "kubepods"]);
        assert_eq!(block.listeners(53), vec![("cluster.local.".to_string(), 1053)]);
    }

    #[tokio::test]
    async fn plugin_errors_fail_the_load() {
        assert!(Config::parse(". {\n kubepods {\n ttl 9999\n }\n}\n", shared()).is_err());
        assert!(Config::parse(". {\n nosuchplugin\n}\n", shared()).is_err());
        assert!(Config::parse(". {\n log\n log\n}\n", shared()).is_err());
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert!(parse_duration("soon").is_err());
    }
}
