use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

/// Supported AI providers. Stored lowercase; parsing accepts any casing
/// because rows written before the enum existed may carry uppercase names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Claude,
    Gemini,
    Perplexity,
    Grok,
}

impl Provider {
    pub const ALL: [Provider; 5] = [
        Provider::OpenAi,
        Provider::Claude,
        Provider::Gemini,
        Provider::Perplexity,
        Provider::Grok,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Claude => "claude",
            Provider::Gemini => "gemini",
            Provider::Perplexity => "perplexity",
            Provider::Grok => "grok",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = UnknownProvider;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Provider::OpenAi),
            "claude" => Ok(Provider::Claude),
            "gemini" => Ok(Provider::Gemini),
            "perplexity" => Ok(Provider::Perplexity),
            "grok" => Ok(Provider::Grok),
            _ => Err(UnknownProvider(value.trim().to_string())),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("unknown provider {0:?}")]
pub struct UnknownProvider(pub String);
