//! Environment-variable lookup for the last-resort step of §4.6.4 selection order.
//! Each provider declares the well-known variable names it accepts; the first
//! non-empty value wins. Injectable for testability via `EnvLookup`.

use std::collections::HashMap;

/// Indirection over `std::env::var`, so selector tests can inject a fixed map
/// instead of touching the real process environment (spec §9, "the environment-
/// variable reader... must be injectable for testability").
pub trait EnvLookup: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

pub struct ProcessEnv;

impl EnvLookup for ProcessEnv {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok().filter(|v| !v.trim().is_empty())
    }
}

pub struct FixedEnv(pub HashMap<String, String>);

impl EnvLookup for FixedEnv {
    fn get(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned().filter(|v| !v.trim().is_empty())
    }
}

/// Well-known environment variable names accepted per provider, first match wins.
pub fn well_known_env_vars(provider: &str) -> &'static [&'static str] {
    match provider {
        "anthropic" | "anthropic-setup-token" => &["ANTHROPIC_API_KEY"],
        "openai" => &["OPENAI_API_KEY"],
        "google" | "gemini" => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        "xai" | "grok" => &["XAI_API_KEY"],
        "openrouter" => &["OPENROUTER_API_KEY"],
        "deepseek" => &["DEEPSEEK_API_KEY"],
        "groq" => &["GROQ_API_KEY"],
        "together" | "together-ai" => &["TOGETHER_API_KEY"],
        "mistral" => &["MISTRAL_API_KEY"],
        "moonshot" | "kimi" => &["MOONSHOT_API_KEY"],
        "minimax-code" | "minimax-code-cn" | "minimax" => &["MINIMAX_API_KEY"],
        "qianfan" | "baidu" => &["QIANFAN_API_KEY"],
        "qwen" | "dashscope" => &["DASHSCOPE_API_KEY"],
        "huggingface" => &["HUGGINGFACE_HUB_TOKEN", "HF_TOKEN"],
        "venice" => &["VENICE_API_KEY"],
        "github-copilot" => &["GITHUB_COPILOT_API_KEY"],
        "openai-codex" => &[],
        _ => &[],
    }
}

/// Run the §4.6.4 step 4 lookup for `provider` using `env`, returning the first
/// non-empty hit among its well-known variable names.
pub fn lookup(env: &dyn EnvLookup, provider: &str) -> Option<String> {
    well_known_env_vars(provider).iter().find_map(|name| env.get(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_non_empty_wins() {
        let mut map = HashMap::new();
        map.insert("HUGGINGFACE_HUB_TOKEN".to_string(), String::new());
        map.insert("HF_TOKEN".to_string(), "tok".to_string());
        let env = FixedEnv(map);
        assert_eq!(lookup(&env, "huggingface"), Some("tok".to_string()));
    }

    #[test]
    fn unknown_provider_yields_none() {
        let env = FixedEnv(HashMap::new());
        assert_eq!(lookup(&env, "made-up-provider"), None);
    }
}
