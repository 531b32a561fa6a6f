//! Chat formatting driven by the Jinja template shipped in a model's
//! `tokenizer_config.json`.
//!
//! Templates are rendered with `minijinja` configured the way the Hugging Face
//! tokenizers render them (`trim_blocks`, `lstrip_blocks`, a
//! `raise_exception` helper). When a repository ships no template the Mistral
//! instruct format is used.

use std::path::Path;

use minijinja::{context, Environment, ErrorKind};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{InferenceError, Result};

/// Mistral-7B-Instruct chat format.
pub const MISTRAL_INSTRUCT_TEMPLATE: &str = "{{ bos_token }}{% for message in messages %}{% if (message['role'] == 'user') != (loop.index0 % 2 == 0) %}{{ raise_exception('Conversation roles must alternate user/assistant/user/assistant/...') }}{% endif %}{% if message['role'] == 'user' %}{{ '[INST] ' + message['content'] + ' [/INST]' }}{% elif message['role'] == 'assistant' %}{{ message['content'] + eos_token }}{% else %}{{ raise_exception('Only user and assistant roles are supported!') }}{% endif %}{% endfor %}";

const TEMPLATE_NAME: &str = "chat";
const MAX_RECURSION_DEPTH: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// `bos_token` and friends are either plain strings or added-token objects.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TokenField {
    Plain(String),
    Added { content: String },
}

impl TokenField {
    fn into_content(self) -> String {
        match self {
            TokenField::Plain(s) => s,
            TokenField::Added { content } => content,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct NamedTemplate {
    name: String,
    template: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TemplateField {
    Single(String),
    Named(Vec<NamedTemplate>),
}

#[derive(Debug, Deserialize)]
struct TokenizerConfig {
    #[serde(default)]
    chat_template: Option<TemplateField>,
    #[serde(default)]
    bos_token: Option<TokenField>,
    #[serde(default)]
    eos_token: Option<TokenField>,
}

pub struct ChatTemplate {
    env: Environment<'static>,
    bos_token: String,
    eos_token: String,
}

impl std::fmt::Debug for ChatTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatTemplate")
            .field("bos_token", &self.bos_token)
            .field("eos_token", &self.eos_token)
            .finish_non_exhaustive()
    }
}

impl ChatTemplate {
    pub fn new(source: String, bos_token: String, eos_token: String) -> Result<Self> {
        let mut env = Environment::new();
        env.set_recursion_limit(MAX_RECURSION_DEPTH);
        env.set_trim_blocks(true);
        env.set_lstrip_blocks(true);
        env.add_function(
            "raise_exception",
            |message: String| -> std::result::Result<String, minijinja::Error> {
                Err(minijinja::Error::new(ErrorKind::InvalidOperation, message))
            },
        );
        env.add_template_owned(TEMPLATE_NAME, source)
            .map_err(|e| InferenceError::Template(format!("invalid template syntax: {e}")))?;

        Ok(Self {
            env,
            bos_token,
            eos_token,
        })
    }

    pub fn mistral_instruct() -> Result<Self> {
        Self::new(
            MISTRAL_INSTRUCT_TEMPLATE.to_string(),
            "<s>".to_string(),
            "</s>".to_string(),
        )
    }

    /// Build from `tokenizer_config.json` content.
    pub fn from_tokenizer_config(json: &str) -> Result<Self> {
        let config: TokenizerConfig = serde_json::from_str(json)?;

        let bos_token = config
            .bos_token
            .map(TokenField::into_content)
            .unwrap_or_else(|| "<s>".to_string());
        let eos_token = config
            .eos_token
            .map(TokenField::into_content)
            .unwrap_or_else(|| "</s>".to_string());

        let source = match config.chat_template {
            Some(TemplateField::Single(source)) => source,
            Some(TemplateField::Named(templates)) => templates
                .iter()
                .find(|t| t.name == "default")
                .or_else(|| templates.first())
                .map(|t| t.template.clone())
                .ok_or_else(|| {
                    InferenceError::Template("empty chat_template list".to_string())
                })?,
            None => {
                info!("No chat_template in tokenizer config, using Mistral instruct format");
                MISTRAL_INSTRUCT_TEMPLATE.to_string()
            }
        };

        Self::new(source, bos_token, eos_token)
    }

    /// Load from an optional `tokenizer_config.json` path.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => {
                info!("Loading chat template from {:?}", path);
                let json = std::fs::read_to_string(path)?;
                Self::from_tokenizer_config(&json)
            }
            None => {
                info!("No tokenizer_config.json, using Mistral instruct format");
                Self::mistral_instruct()
            }
        }
    }

    pub fn apply(&self, messages: &[ChatMessage]) -> Result<String> {
        let template = self
            .env
            .get_template(TEMPLATE_NAME)
            .map_err(|e| InferenceError::Template(e.to_string()))?;

        let rendered = template
            .render(context!(
                messages => messages,
                add_generation_prompt => true,
                bos_token => &self.bos_token,
                eos_token => &self.eos_token
            ))
            .map_err(|e| InferenceError::Template(format!("render failed: {e}")))?;

        debug!("Rendered chat prompt: {:?}", rendered);
        Ok(rendered)
    }

    /// Wrap a bare prompt as a single user turn.
    pub fn user_prompt(&self, prompt: &str) -> Result<String> {
        self.apply(&[ChatMessage::user(prompt)])
    }
}
