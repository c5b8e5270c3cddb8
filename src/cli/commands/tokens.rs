use clap::{Arg, ArgMatches, Command};
use std::path::PathBuf;

use super::{flag, read_flag, read_secs, validator_duration};

pub const ARG_ACCESS_TOKEN_TTL: &str = "access-token-ttl";
pub const ARG_REFRESH_TOKEN_TTL: &str = "refresh-token-ttl";
pub const ARG_AUTH_CODE_TTL: &str = "auth-code-ttl";
pub const ARG_TOKEN_DEADLINE_MS: &str = "token-deadline-ms";
pub const ARG_SIGNING_KEY_PATH: &str = "signing-key-path";
pub const ARG_SIGNING_KEY_ID: &str = "signing-key-id";
pub const ARG_FS_ADMIN_ENABLE: &str = "fs-admin-enable";
pub const ARG_REVOKE_REQUIRE_CLIENT_AUTH: &str = "revoke-require-client-auth";

#[derive(Debug, Clone)]
pub struct Options {
    pub access_ttl_seconds: u64,
    pub refresh_ttl_seconds: u64,
    pub auth_code_ttl_seconds: u64,
    pub deadline_ms: u64,
    pub signing_key_path: Option<PathBuf>,
    pub signing_key_id: Option<String>,
    pub fs_admin_enabled: bool,
    pub revoke_require_client_auth: bool,
}

impl Options {
    /// Parse token arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a TTL or the deadline is zero.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let deadline_ms = matches
            .get_one::<u64>(ARG_TOKEN_DEADLINE_MS)
            .copied()
            .unwrap_or(3000);
        if deadline_ms == 0 {
            anyhow::bail!("--{ARG_TOKEN_DEADLINE_MS} must be greater than zero");
        }

        Ok(Self {
            access_ttl_seconds: read_secs(matches, ARG_ACCESS_TOKEN_TTL)?,
            refresh_ttl_seconds: read_secs(matches, ARG_REFRESH_TOKEN_TTL)?,
            auth_code_ttl_seconds: read_secs(matches, ARG_AUTH_CODE_TTL)?,
            deadline_ms,
            signing_key_path: matches
                .get_one::<String>(ARG_SIGNING_KEY_PATH)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            signing_key_id: matches
                .get_one::<String>(ARG_SIGNING_KEY_ID)
                .cloned()
                .filter(|v| !v.trim().is_empty()),
            fs_admin_enabled: read_flag(matches, ARG_FS_ADMIN_ENABLE),
            revoke_require_client_auth: read_flag(matches, ARG_REVOKE_REQUIRE_CLIENT_AUTH),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_TTL)
                .long(ARG_ACCESS_TOKEN_TTL)
                .help("Access token TTL (seconds, or with s/m/h/d suffix)")
                .env("ACCESS_TOKEN_TTL")
                .default_value("600")
                .value_parser(validator_duration()),
        )
        .arg(
            Arg::new(ARG_REFRESH_TOKEN_TTL)
                .long(ARG_REFRESH_TOKEN_TTL)
                .help("Refresh token TTL (seconds, or with s/m/h/d suffix)")
                .env("REFRESH_TOKEN_TTL")
                .default_value("30d")
                .value_parser(validator_duration()),
        )
        .arg(
            Arg::new(ARG_AUTH_CODE_TTL)
                .long(ARG_AUTH_CODE_TTL)
                .help("Authorization code TTL, capped at 60 seconds")
                .env("AUTH_CODE_TTL")
                .default_value("60")
                .value_parser(validator_duration()),
        )
        .arg(
            Arg::new(ARG_TOKEN_DEADLINE_MS)
                .long(ARG_TOKEN_DEADLINE_MS)
                .help("Token endpoint deadline in milliseconds")
                .env("TOKEN_DEADLINE_MS")
                .default_value("3000")
                .value_parser(clap::value_parser!(u64)),
        )
        .arg(
            Arg::new(ARG_SIGNING_KEY_PATH)
                .long(ARG_SIGNING_KEY_PATH)
                .help("File with a base64url Ed25519 seed; an ephemeral key is generated when absent")
                .env("SIGNING_KEY_PATH"),
        )
        .arg(
            Arg::new(ARG_SIGNING_KEY_ID)
                .long(ARG_SIGNING_KEY_ID)
                .help("JWT kid header, derived from the public key when absent")
                .env("SIGNING_KEY_ID"),
        )
        .arg(flag(
            ARG_FS_ADMIN_ENABLE,
            "FS_ADMIN_ENABLE",
            "false",
            "Accept admin refresh JWTs and re-mint them statelessly",
        ))
        .arg(flag(
            ARG_REVOKE_REQUIRE_CLIENT_AUTH,
            "REVOKE_REQUIRE_CLIENT_AUTH",
            "false",
            "Require confidential client authentication on /v1/oauth/revoke",
        ))
}
