pub mod cache;
pub mod credential;
pub mod env;
pub mod error;
pub mod fnv;
pub mod identity;
pub mod probers;
pub mod ranking;
pub mod rankings;
pub mod refresher;
pub mod refreshers;
pub mod resolver;
pub mod selector;
pub mod store;
pub mod usage;

// Re-exports for convenience
pub use cache::UsageCache;
pub use credential::{ApiKeyCredential, Credential, CredentialType, OAuthCredential, StoredCredential};
pub use env::{EnvLookup, FixedEnv, ProcessEnv};
pub use error::AuthBrokerError;
pub use identity::{email_only_dedup, identifiers_for};
pub use ranking::{RankingRegistry, RankingStrategy, WindowDefaults, WindowLimits};
pub use refresher::{classify_refresh_error, OAuthRefresher, RefreshFailureKind, RefresherRegistry};
pub use resolver::{ConfigValueResolver, DefaultConfigValueResolver};
pub use selector::{
    BrokerConfig, BrokerSnapshot, CredentialBroker, CredentialBrokerBuilder, FallbackResolver,
    FetchUsageReportsOpts, GetApiKeyOpts, LoginResult, MarkUsageLimitOpts,
};
pub use store::CredentialStore;
pub use usage::{
    LimitAmount, LimitScope, LimitStatus, LimitUnit, LimitWindow, ProbeDeps, ProbeParams, ProberRegistry,
    UsageLimit, UsageProber, UsageReport,
};
