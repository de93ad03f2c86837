use crate::{
    config::{ModelPricing, PricingConfig},
    provider::Provider,
    usage::CostBreakdown,
};
use std::collections::HashMap;

/// Rate table used when pricing newly ingested records. Historical rows keep
/// the cost they were stored with; a rate change never rewrites them.
#[derive(Debug, Clone)]
pub struct PriceBook {
    currency: String,
    default_rate: ModelPricing,
    provider_rates: HashMap<Provider, ModelPricing>,
    model_rates: HashMap<String, ModelPricing>,
}

impl PriceBook {
    pub fn from_config(config: &PricingConfig) -> Self {
        Self {
            currency: config.currency.clone(),
            default_rate: ModelPricing {
                input_per_1m: config.default_input_per_1m,
                output_per_1m: config.default_output_per_1m,
            },
            provider_rates: config.providers.clone(),
            model_rates: config.models.clone(),
        }
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Most specific rate wins: model override, then provider default, then
    /// the global fallback.
    pub fn rate_for(&self, provider: Provider, model: &str) -> ModelPricing {
        if let Some(rate) = self.model_rates.get(model) {
            return *rate;
        }
        if let Some(rate) = self.provider_rates.get(&provider) {
            return *rate;
        }
        self.default_rate
    }

    pub fn breakdown(
        &self,
        provider: Provider,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
    ) -> CostBreakdown {
        let rate = self.rate_for(provider, model);
        let input_cost = round_micro(input_tokens as f64 / 1_000_000.0 * rate.input_per_1m);
        let output_cost = round_micro(output_tokens as f64 / 1_000_000.0 * rate.output_per_1m);

        CostBreakdown {
            input_tokens,
            output_tokens,
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
        }
    }
}

/// Round to micro-dollar precision, matching what gets persisted.
fn round_micro(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}
