//! The structured answer the AI persona must produce.
//!
//! Wire shape:
//!
//! ```json
//! { "text": "...",
//!   "fileTree":     { "app.js": { "file": { "contents": "..." } } },
//!   "buildCommand": { "mainItem": "npm",  "commands": ["install"] },
//!   "startCommand": { "mainItem": "node", "commands": ["app.js"] } }
//! ```

use serde::{Deserialize, Serialize};

use crate::tree::FileTree;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Directive {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_tree: Option<FileTree>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_command: Option<CommandSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_command: Option<CommandSpec>,
}

/// An executable plus its ordered arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandSpec {
    #[serde(rename = "mainItem")]
    pub executable: String,
    #[serde(rename = "commands", default)]
    pub arguments: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(executable: impl Into<String>, arguments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            executable: executable.into(),
            arguments: arguments.into_iter().map(Into::into).collect(),
        }
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.executable)?;
        for arg in &self.arguments {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl Directive {
    /// A text-only directive.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            file_tree: None,
            build_command: None,
            start_command: None,
        }
    }

    /// Serialise as the single JSON blob carried in an AI message payload.
    pub fn to_payload(&self) -> String {
        // A Directive only holds strings, maps and vectors; serialisation cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_payload(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_directive() {
        let json = r#"{
            "text": "Here is an express app",
            "fileTree": {
                "app.js": { "file": { "contents": "require('express')" } },
                "package.json": { "file": { "contents": "{}" } }
            },
            "buildCommand": { "mainItem": "npm", "commands": ["install"] },
            "startCommand": { "mainItem": "node", "commands": ["app.js"] }
        }"#;
        let d = Directive::from_payload(json).unwrap();
        assert_eq!(d.text, "Here is an express app");
        assert_eq!(d.file_tree.as_ref().unwrap().file_count(), 2);
        assert_eq!(d.build_command, Some(CommandSpec::new("npm", ["install"])));
        assert_eq!(d.start_command.as_ref().unwrap().to_string(), "node app.js");
    }

    #[test]
    fn text_only_directive_omits_optional_keys() {
        let payload = Directive::text("Hello").to_payload();
        assert_eq!(payload, r#"{"text":"Hello"}"#);
    }

    #[test]
    fn rejects_unknown_keys_and_missing_text() {
        assert!(Directive::from_payload(r#"{"text":"x","extra":1}"#).is_err());
        assert!(Directive::from_payload(r#"{"fileTree":{}}"#).is_err());
        assert!(
            Directive::from_payload(r#"{"text":"x","startCommand":{"mainItem":"node","args":[]}}"#)
                .is_err()
        );
    }
}
