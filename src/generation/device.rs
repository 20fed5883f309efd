use serde::{Deserialize, Serialize};

/// Compute backend the generation adapter runs on.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTier {
    #[serde(rename = "webgpu")]
    WebGpu,
    Wasm,
    #[default]
    Cpu,
}

impl DeviceTier {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceTier::WebGpu => "webgpu",
            DeviceTier::Wasm => "wasm",
            DeviceTier::Cpu => "cpu",
        }
    }
}

impl std::str::FromStr for DeviceTier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "webgpu" | "gpu" => Ok(DeviceTier::WebGpu),
            "wasm" => Ok(DeviceTier::Wasm),
            "cpu" => Ok(DeviceTier::Cpu),
            other => Err(format!("unknown device tier '{}'", other)),
        }
    }
}

/// Scheduling cadence and generation budget for a device tier.
///
/// Slower tiers get smaller token budgets and longer debounce so they
/// degrade instead of falling behind.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct DeviceTierPolicy {
    pub tier: DeviceTier,
    pub token_cap: u32,
    /// Minimum gap between two generation runs.
    pub cooldown_ms: u64,
    /// Multiplier applied to the pause debounce.
    pub debounce_scale: f64,
}

impl DeviceTierPolicy {
    pub fn for_tier(tier: DeviceTier) -> Self {
        match tier {
            DeviceTier::WebGpu => Self {
                tier,
                token_cap: 64,
                cooldown_ms: 60,
                debounce_scale: 1.0,
            },
            DeviceTier::Wasm => Self {
                tier,
                token_cap: 32,
                cooldown_ms: 120,
                debounce_scale: 1.25,
            },
            DeviceTier::Cpu => Self {
                tier,
                token_cap: 24,
                cooldown_ms: 200,
                debounce_scale: 1.5,
            },
        }
    }

    pub fn scale_debounce(&self, delay_ms: u64) -> u64 {
        (delay_ms as f64 * self.debounce_scale).round() as u64
    }

    /// Token budget for a stage, given a token count estimate for the span.
    pub fn token_budget(&self, wanted: u32) -> u32 {
        wanted.clamp(1, self.token_cap)
    }
}

impl Default for DeviceTierPolicy {
    fn default() -> Self {
        Self::for_tier(DeviceTier::default())
    }
}

/// Rough token estimate for `text`, used to size stage budgets.
pub fn estimate_tokens(text: &str) -> u32 {
    // ~4 bytes per token for English, plus headroom for the rewrite
    ((text.len() as f64 / 4.0).ceil() as u32).saturating_mul(2).max(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slower_tiers_get_smaller_budgets() {
        let gpu = DeviceTierPolicy::for_tier(DeviceTier::WebGpu);
        let wasm = DeviceTierPolicy::for_tier(DeviceTier::Wasm);
        let cpu = DeviceTierPolicy::for_tier(DeviceTier::Cpu);
        assert!(gpu.token_cap > wasm.token_cap && wasm.token_cap > cpu.token_cap);
        assert!(gpu.cooldown_ms < wasm.cooldown_ms && wasm.cooldown_ms < cpu.cooldown_ms);
        assert_eq!(cpu.scale_debounce(600), 900);
        assert_eq!(gpu.scale_debounce(600), 600);
    }

    #[test]
    fn budget_is_capped() {
        let cpu = DeviceTierPolicy::for_tier(DeviceTier::Cpu);
        assert_eq!(cpu.token_budget(500), 24);
        assert_eq!(cpu.token_budget(0), 1);
        assert_eq!(estimate_tokens(""), 8);
    }

    #[test]
    fn tier_parses_and_serializes() {
        assert_eq!("WebGPU".parse::<DeviceTier>(), Ok(DeviceTier::WebGpu));
        assert!("tpu".parse::<DeviceTier>().is_err());
        assert_eq!(serde_json::to_string(&DeviceTier::WebGpu).unwrap(), "\"webgpu\"");
        assert_eq!(DeviceTier::Wasm.as_str(), "wasm");
    }
}
