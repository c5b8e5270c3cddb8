use crate::{
    api::{
        self, AppState, CsrfConfig,
        cookies::{CookiePolicy, StaticAllowlist},
    },
    cli::{
        commands::{session, tenancy, tokens},
        telemetry,
    },
    issuer::{IssuerMode, IssuerResolver},
    oauth::{
        TokenService,
        codes::{AuthorizationCodeStore, MemoryCodeStore, PgCodeStore},
        service::TokenConfig,
        signer::{JwtSigner, TokenSigner},
    },
    session::{
        SessionManager,
        cache::{MemorySessionCache, PgSessionCache, SessionCache},
    },
    store::{StoreHandle, postgres::apply_schema},
    tenancy::{PgTenantManager, StaticControlPlane, StoreSelector, TenantCache},
};
use anyhow::{Context, Result, anyhow};
use chrono::Duration;
use secrecy::{ExposeSecret, SecretString};
use sqlx::{PgPool, postgres::PgPoolOptions};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: Option<SecretString>,
    pub issuer_mode: IssuerMode,
    pub issuer_base: String,
    pub tokens: tokens::Options,
    pub session: session::Options,
    pub tenancy: tenancy::Options,
}

/// Execute the server action.
/// # Errors
/// Returns an error if a database is unreachable, the signing key cannot be
/// loaded, or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let pool = match &args.dsn {
        Some(dsn) => Some(connect(dsn).await?),
        None => {
            warn!("No --dsn given: stores, sessions and codes are kept in memory");
            None
        }
    };

    let global = pool
        .as_ref()
        .map_or_else(StoreHandle::memory, |pool| StoreHandle::postgres(pool.clone()));

    let mut selector = StoreSelector::new(global);
    if !args.tenancy.tenant_dsns.is_empty() {
        let manager = PgTenantManager::new(args.tenancy.tenant_dsns.clone());
        info!("Tenant databases configured: {}", manager.slugs().join(", "));
        selector = selector.with_manager(Arc::new(manager));
    }
    if let Some(data_root) = &args.tenancy.data_root {
        let control_plane = StaticControlPlane::load(data_root).await?;
        selector = selector.with_control_plane(Arc::new(TenantCache::new(Arc::new(control_plane))));
    }

    let issuer = IssuerResolver::new(args.issuer_mode, &args.issuer_base)
        .context("invalid --issuer-base")?;

    let signer: Arc<dyn TokenSigner> = Arc::new(load_signer(&args.tokens)?);

    let (codes, cache): (Arc<dyn AuthorizationCodeStore>, Arc<dyn SessionCache>) = match &pool {
        Some(pool) => (
            Arc::new(PgCodeStore::new(pool.clone())),
            Arc::new(PgSessionCache::new(pool.clone())),
        ),
        None => (
            Arc::new(MemoryCodeStore::new()),
            Arc::new(MemorySessionCache::new()),
        ),
    };

    let config = TokenConfig::new()
        .with_access_ttl(seconds(args.tokens.access_ttl_seconds)?)
        .with_refresh_ttl(seconds(args.tokens.refresh_ttl_seconds)?)
        .with_auth_code_ttl(seconds(args.tokens.auth_code_ttl_seconds)?)
        .with_deadline(std::time::Duration::from_millis(args.tokens.deadline_ms))
        .with_fs_admin_enabled(args.tokens.fs_admin_enabled);
    if args.tokens.fs_admin_enabled {
        warn!("Admin stateless refresh enabled: admin refresh tokens cannot be revoked");
    }

    let tokens = TokenService::new(selector, issuer, signer, codes, config);

    let session_ttl = seconds(args.session.ttl_seconds)?;
    let idle_ttl = args.session.idle_ttl_seconds.map(seconds).transpose()?;
    let sessions = SessionManager::new(cache, session_ttl).with_idle_ttl(idle_ttl);

    let session_cookie = CookiePolicy::new(&args.session.cookie_name, session_ttl)
        .with_domain(args.session.cookie_domain.clone())
        .with_same_site(args.session.same_site)
        .with_secure(args.session.secure);

    let csrf = CsrfConfig::new(
        &args.session.csrf_cookie_name,
        seconds(args.session.csrf_ttl_seconds)?,
    )
    .with_enforced(args.session.csrf_enforced);
    if !args.session.csrf_enforced {
        warn!("CSRF enforcement disabled");
    }

    let allowlist = StaticAllowlist::new(args.session.logout_allowlist.iter());

    let state = AppState::new(tokens, sessions)
        .with_session_cookie(session_cookie)
        .with_csrf(csrf)
        .with_allowlist(Arc::new(allowlist))
        .with_revoke_require_client_auth(args.tokens.revoke_require_client_auth);

    let result = api::new(args.port, Arc::new(state)).await;

    telemetry::shutdown_tracer();

    result
}

async fn connect(dsn: &SecretString) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(std::time::Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn.expose_secret())
        .await
        .context("Failed to connect to database")?;

    apply_schema(&pool).await?;

    Ok(pool)
}

fn load_signer(opts: &tokens::Options) -> Result<JwtSigner> {
    let kid = opts.signing_key_id.as_deref();
    match &opts.signing_key_path {
        Some(path) => JwtSigner::from_file(path, kid),
        None => {
            warn!("No --signing-key-path given: using an ephemeral signing key");
            JwtSigner::generate(kid)
        }
    }
}

fn seconds(value: u64) -> Result<Duration> {
    i64::try_from(value)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| anyhow!("duration out of range: {value}s"))
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        (
            "dsn",
            args.dsn.as_ref().map_or_else(
                || "memory".to_string(),
                |dsn| redact_dsn(dsn.expose_secret()),
            ),
        ),
        ("issuer_mode", args.issuer_mode.to_string()),
        ("issuer_base", args.issuer_base.clone()),
        ("tenant_dbs", args.tenancy.tenant_dsns.len().to_string()),
        (
            "data_root",
            args.tenancy
                .data_root
                .as_ref()
                .map_or_else(|| "none".to_string(), |p| p.display().to_string()),
        ),
        ("access_token_ttl", format!("{}s", args.tokens.access_ttl_seconds)),
        ("refresh_token_ttl", format!("{}s", args.tokens.refresh_ttl_seconds)),
        ("session_ttl", format!("{}s", args.session.ttl_seconds)),
        ("session_cookie", args.session.cookie_name.clone()),
        ("csrf_enforced", args.session.csrf_enforced.to_string()),
        ("fs_admin_enable", args.tokens.fs_admin_enabled.to_string()),
        (
            "signing_key",
            args.tokens
                .signing_key_path
                .as_ref()
                .map_or_else(|| "ephemeral".to_string(), |p| p.display().to_string()),
        ),
    ];
    log_entries("Startup configuration", &entries);
}

fn redact_dsn(dsn: &str) -> String {
    match Url::parse(dsn) {
        Ok(mut parsed) => {
            if parsed.password().is_some() {
                let _ = parsed.set_password(Some("REDACTED"));
            }
            parsed.to_string()
        }
        Err(_) => "invalid-dsn".to_string(),
    }
}

fn log_entries(title: &str, entries: &[(&str, String)]) {
    let max_key_len = entries.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    let mut message = format!(
        "tessera {} - {}\n\n{title}:",
        env!("CARGO_PKG_VERSION"),
        short_commit(crate::GIT_COMMIT_HASH)
    );
    for (key, value) in entries {
        let padding = " ".repeat(max_key_len.saturating_sub(key.len()));
        let _ =
            std::fmt::Write::write_fmt(&mut message, format_args!("\n  {key}:{padding} {value}"));
    }
    info!("{message}");
}

fn short_commit(hash: &str) -> &str {
    let trimmed = hash.trim();
    trimmed.get(..7).unwrap_or(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redact_dsn_hides_password() {
        assert_eq!(
            redact_dsn("postgres://tessera:hunter2@db:5432/tessera"),
            "postgres://tessera:REDACTED@db:5432/tessera"
        );
        assert_eq!(
            redact_dsn("postgres://tessera@db/tessera"),
            "postgres://tessera@db/tessera"
        );
        assert_eq!(redact_dsn("not a url"), "invalid-dsn");
    }

    #[test]
    fn short_commit_truncates() {
        assert_eq!(short_commit("0123456789abcdef"), "0123456");
        assert_eq!(short_commit("abc"), "abc");
    }

    #[test]
    fn seconds_converts() {
        assert!(matches!(seconds(90), Ok(d) if d == Duration::seconds(90)));
        assert!(seconds(u64::MAX).is_err());
    }

    #[test]
    fn ephemeral_signer_without_path() {
        let opts = tokens::Options {
            access_ttl_seconds: 600,
            refresh_ttl_seconds: 3600,
            auth_code_ttl_seconds: 60,
            deadline_ms: 3000,
            signing_key_path: None,
            signing_key_id: Some("test-kid".to_string()),
            fs_admin_enabled: false,
            revoke_require_client_auth: false,
        };
        let signer = load_signer(&opts);
        assert!(signer.is_ok());
        if let Ok(signer) = signer {
            assert_eq!(signer.kid(), "test-kid");
        }
    }
}
