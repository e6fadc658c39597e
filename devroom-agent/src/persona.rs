//! Fixed persona and generation settings for the AI collaborator.

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_TEMPERATURE: f32 = 0.4;
pub const JSON_MIME_TYPE: &str = "application/json";

/// Everything about the AI that does not change between prompts.
///
/// Injected into [`crate::DirectiveGenerator`] at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct PersonaConfig {
    pub model: String,
    pub system_instruction: String,
    /// Low but nonzero: well-formed output is favoured, not guaranteed.
    pub temperature: f32,
    pub response_mime_type: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            system_instruction: DEFAULT_SYSTEM_INSTRUCTION.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            response_mime_type: JSON_MIME_TYPE.to_string(),
        }
    }
}

impl PersonaConfig {
    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }
}

pub const DEFAULT_SYSTEM_INSTRUCTION: &str = r#"You are the AI member of a collaborative coding room. You are a senior JavaScript/Node.js developer with ten years of experience. Your code is modular, commented where it helps, handles errors, and never breaks functionality that already exists in the project.

Answer EVERY message with a single JSON object and nothing else. The object has this shape:
- "text" (required): your explanation, in Markdown.
- "fileTree" (optional): the COMPLETE project tree. It replaces the previous tree entirely, so include every file the project needs, not only the changed ones. Each file is { "file": { "contents": "<full file text>" } }; a nested object groups files under a folder name.
- "buildCommand" (optional): { "mainItem": "<executable>", "commands": ["<arg>", ...] } run once before starting.
- "startCommand" (optional): { "mainItem": "<executable>", "commands": ["<arg>", ...] } that starts the app.

Servers must listen on process.env.PORT when it is set.

Examples:
<example>
user: Create an express application
response: {
    "text": "Here is a minimal Express server.",
    "fileTree": {
        "app.js": {
            "file": {
                "contents": "const express = require('express');\n\nconst app = express();\nconst port = process.env.PORT || 3000;\n\napp.get('/', (req, res) => {\n    res.send('Hello World!');\n});\n\napp.listen(port, () => {\n    console.log(`Server running on port ${port}`);\n});"
            }
        },
        "package.json": {
            "file": {
                "contents": "{\n  \"name\": \"express-app\",\n  \"version\": \"1.0.0\",\n  \"scripts\": { \"start\": \"node app.js\" },\n  \"dependencies\": {\n    \"express\": \"^4.21.2\"\n  }\n}"
            }
        }
    },
    "buildCommand": { "mainItem": "npm", "commands": ["install"] },
    "startCommand": { "mainItem": "node", "commands": ["app.js"] }
}
</example>

<example>
user: Hello
response: {
    "text": "Hello! What would you like to build today?"
}
</example>

IMPORTANT: avoid file names like routes/index.js; give every file a descriptive name."#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_persona_is_json_constrained() {
        let persona = PersonaConfig::default();
        assert_eq!(persona.response_mime_type, "application/json");
        assert!(persona.temperature > 0.0 && persona.temperature < 1.0);
        assert!(persona.system_instruction.contains("\"fileTree\""));
    }

    #[test]
    fn builders_override_settings() {
        let persona = PersonaConfig::default()
            .with_model("gemini-2.0-flash")
            .with_temperature(0.2);
        assert_eq!(persona.model, "gemini-2.0-flash");
        assert_eq!(persona.temperature, 0.2);
    }
}
