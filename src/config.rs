use crate::{provider::Provider, tiers::Plan};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub aggregation: AggregationConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl AppConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            Self::from_file(path)?
        } else {
            let default_path = PathBuf::from("cost-guardian.toml");
            if default_path.exists() {
                Self::from_file(&default_path)?
            } else {
                Self::default()
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self =
            toml::from_str(&contents).with_context(|| "failed to parse configuration TOML")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = env::var("COST_GUARDIAN_LISTEN_ADDR") {
            self.server.listen_addr = addr;
        }
        if let Ok(db_path) = env::var("COST_GUARDIAN_DB_PATH") {
            self.storage.database_path = PathBuf::from(db_path);
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AggregationConfig {
    /// Number of entries in organization-scope top-user rankings.
    #[serde(default = "default_top_users")]
    pub top_users: usize,
    /// Upper bound applied to recent-usage `limit` parameters.
    #[serde(default = "default_recent_limit_max")]
    pub recent_limit_max: usize,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            top_users: default_top_users(),
            recent_limit_max: default_recent_limit_max(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PricingConfig {
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default = "default_input_rate", alias = "default_input_per_1k")]
    pub default_input_per_1m: f64,
    #[serde(default = "default_output_rate", alias = "default_output_per_1k")]
    pub default_output_per_1m: f64,
    #[serde(default = "default_provider_pricing")]
    pub providers: HashMap<Provider, ModelPricing>,
    #[serde(default = "default_model_pricing")]
    pub models: HashMap<String, ModelPricing>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            currency: default_currency(),
            default_input_per_1m: default_input_rate(),
            default_output_per_1m: default_output_rate(),
            providers: default_provider_pricing(),
            models: default_model_pricing(),
        }
    }
}

/// Token rates in USD per one million tokens. Accepts per-1K aliases in
/// config files because published price sheets quote either unit.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(from = "ModelPricingInput")]
pub struct ModelPricing {
    pub input_per_1m: f64,
    pub output_per_1m: f64,
}

#[derive(Debug, Deserialize)]
struct ModelPricingInput {
    input_per_1m: Option<f64>,
    output_per_1m: Option<f64>,
    input_per_1k: Option<f64>,
    output_per_1k: Option<f64>,
}

impl From<ModelPricingInput> for ModelPricing {
    fn from(input: ModelPricingInput) -> Self {
        let input_per_1m = input
            .input_per_1m
            .or(input.input_per_1k.map(|value| value * 1000.0))
            .unwrap_or(0.0);
        let output_per_1m = input
            .output_per_1m
            .or(input.output_per_1k.map(|value| value * 1000.0))
            .unwrap_or(0.0);

        Self {
            input_per_1m,
            output_per_1m,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct AuthConfig {
    #[serde(default)]
    pub tokens: Vec<ApiToken>,
}

/// One entry of the static bearer-token registry standing in for the
/// external authentication subsystem.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiToken {
    pub token: String,
    pub user_id: String,
    pub organization_id: String,
    #[serde(default)]
    pub plan: Plan,
}

fn default_listen_addr() -> String {
    "127.0.0.1:4810".to_string()
}

fn default_database_path() -> PathBuf {
    PathBuf::from("usage.db")
}

fn default_top_users() -> usize {
    5
}

fn default_recent_limit_max() -> usize {
    100
}

fn default_currency() -> String {
    "USD".to_string()
}

fn default_input_rate() -> f64 {
    1.0
}

fn default_output_rate() -> f64 {
    2.0
}

fn default_provider_pricing() -> HashMap<Provider, ModelPricing> {
    let mut providers = HashMap::new();

    providers.insert(
        Provider::OpenAi,
        ModelPricing {
            input_per_1m: 2.5,
            output_per_1m: 10.0,
        },
    );
    providers.insert(
        Provider::Claude,
        ModelPricing {
            input_per_1m: 3.0,
            output_per_1m: 15.0,
        },
    );
    providers.insert(
        Provider::Gemini,
        ModelPricing {
            input_per_1m: 1.25,
            output_per_1m: 5.0,
        },
    );
    providers.insert(
        Provider::Perplexity,
        ModelPricing {
            input_per_1m: 1.0,
            output_per_1m: 1.0,
        },
    );
    providers.insert(
        Provider::Grok,
        ModelPricing {
            input_per_1m: 2.0,
            output_per_1m: 10.0,
        },
    );

    providers
}

fn default_model_pricing() -> HashMap<String, ModelPricing> {
    let mut models = HashMap::new();

    models.insert(
        "gpt-4o".to_string(),
        ModelPricing {
            input_per_1m: 2.5,
            output_per_1m: 10.0,
        },
    );
    models.insert(
        "gpt-4o-mini".to_string(),
        ModelPricing {
            input_per_1m: 0.15,
            output_per_1m: 0.6,
        },
    );
    models.insert(
        "gpt-4-turbo".to_string(),
        ModelPricing {
            input_per_1m: 10.0,
            output_per_1m: 30.0,
        },
    );
    models.insert(
        "gpt-3.5-turbo".to_string(),
        ModelPricing {
            input_per_1m: 0.5,
            output_per_1m: 1.5,
        },
    );
    models.insert(
        "claude-3-opus".to_string(),
        ModelPricing {
            input_per_1m: 15.0,
            output_per_1m: 75.0,
        },
    );
    models.insert(
        "claude-3-5-sonnet".to_string(),
        ModelPricing {
            input_per_1m: 3.0,
            output_per_1m: 15.0,
        },
    );
    models.insert(
        "claude-3-haiku".to_string(),
        ModelPricing {
            input_per_1m: 0.25,
            output_per_1m: 1.25,
        },
    );
    models.insert(
        "gemini-1.5-pro".to_string(),
        ModelPricing {
            input_per_1m: 1.25,
            output_per_1m: 5.0,
        },
    );
    models.insert(
        "gemini-1.5-flash".to_string(),
        ModelPricing {
            input_per_1m: 0.075,
            output_per_1m: 0.3,
        },
    );
    models.insert(
        "sonar-pro".to_string(),
        ModelPricing {
            input_per_1m: 3.0,
            output_per_1m: 15.0,
        },
    );
    models.insert(
        "grok-2".to_string(),
        ModelPricing {
            input_per_1m: 2.0,
            output_per_1m: 10.0,
        },
    );

    models
}
