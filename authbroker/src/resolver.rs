//! The config-value resolver (spec §4.6.3/§4.6.4 step 2): turns an `ApiKeyCredential.key`
//! string into the literal key to use, possibly by reading an environment variable or
//! running an external command. This is an injected collaborator — the selector never
//! hardcodes how a provider's config values are dereferenced.

use async_trait::async_trait;

#[async_trait]
pub trait ConfigValueResolver: Send + Sync {
    /// Resolve `raw` (the literal content of `ApiKeyCredential.key`) to the value to
    /// actually send as the API key. Any failure (command exits nonzero, env var
    /// unset) is "no key" for this step — selection continues (spec §7).
    async fn resolve(&self, raw: &str) -> Option<String>;
}

/// A reasonable default: `!cmd` runs `cmd` through the shell and takes trimmed
/// stdout; an all-caps identifier that matches a set environment variable is
/// dereferenced; anything else is returned as a literal.
pub struct DefaultConfigValueResolver;

fn looks_like_env_var_name(s: &str) -> bool {
    !s.is_empty()
        && s.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
        && s.chars().next().map(|c| c.is_ascii_alphabetic()).unwrap_or(false)
}

#[async_trait]
impl ConfigValueResolver for DefaultConfigValueResolver {
    async fn resolve(&self, raw: &str) -> Option<String> {
        if let Some(cmd) = raw.strip_prefix('!') {
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .output()
                .await
                .ok()?;
            if !output.status.success() {
                return None;
            }
            let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
            return if text.is_empty() { None } else { Some(text) };
        }

        if looks_like_env_var_name(raw) {
            if let Ok(value) = std::env::var(raw) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    return Some(trimmed.to_string());
                }
            }
        }

        Some(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn literal_passes_through() {
        let r = DefaultConfigValueResolver;
        assert_eq!(r.resolve("sk-literal-123").await, Some("sk-literal-123".to_string()));
    }

    #[tokio::test]
    async fn command_prefix_runs_shell() {
        let r = DefaultConfigValueResolver;
        assert_eq!(r.resolve("!echo hello").await, Some("hello".to_string()));
    }

    #[tokio::test]
    async fn failing_command_yields_none() {
        let r = DefaultConfigValueResolver;
        assert_eq!(r.resolve("!exit 1").await, None);
    }

    #[tokio::test]
    async fn env_var_name_is_dereferenced() {
        // SAFETY (test-only, single-threaded effect on process env): set then restore.
        unsafe { std::env::set_var("AUTHBROKER_TEST_KEY", "from-env") };
        let r = DefaultConfigValueResolver;
        assert_eq!(r.resolve("AUTHBROKER_TEST_KEY").await, Some("from-env".to_string()));
        unsafe { std::env::remove_var("AUTHBROKER_TEST_KEY") };
    }
}
