use clap::{Arg, ArgAction, ArgMatches, Command, builder::PossibleValuesParser};

use super::{flag, read_flag, read_secs, validator_duration};
use crate::api::cookies::{SameSite, SecureMode};

pub const ARG_SESSION_COOKIE_NAME: &str = "session-cookie-name";
pub const ARG_SESSION_COOKIE_DOMAIN: &str = "session-cookie-domain";
pub const ARG_SESSION_SAMESITE: &str = "session-samesite";
pub const ARG_SESSION_SECURE: &str = "session-secure";
pub const ARG_SESSION_TTL: &str = "session-ttl";
pub const ARG_SESSION_IDLE_TTL: &str = "session-idle-ttl";
pub const ARG_CSRF_COOKIE_NAME: &str = "csrf-cookie-name";
pub const ARG_CSRF_COOKIE_ENFORCED: &str = "csrf-cookie-enforced";
pub const ARG_CSRF_TTL: &str = "csrf-ttl";
pub const ARG_LOGOUT_REDIRECT_ALLOWLIST: &str = "logout-redirect-allowlist";

#[derive(Debug, Clone)]
pub struct Options {
    pub cookie_name: String,
    pub cookie_domain: Option<String>,
    pub same_site: SameSite,
    pub secure: SecureMode,
    pub ttl_seconds: u64,
    pub idle_ttl_seconds: Option<u64>,
    pub csrf_cookie_name: String,
    pub csrf_enforced: bool,
    pub csrf_ttl_seconds: u64,
    pub logout_allowlist: Vec<String>,
}

impl Options {
    /// Parse session and CSRF cookie arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a cookie name is empty or a duration is zero.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let cookie_name = required_name(matches, ARG_SESSION_COOKIE_NAME)?;
        let csrf_cookie_name = required_name(matches, ARG_CSRF_COOKIE_NAME)?;

        let same_site = matches
            .get_one::<String>(ARG_SESSION_SAMESITE)
            .map_or(Ok(SameSite::Lax), |value| value.parse())?;
        let secure = matches
            .get_one::<String>(ARG_SESSION_SECURE)
            .map_or(Ok(SecureMode::Auto), |value| value.parse())?;

        let idle_ttl_seconds = match matches.get_one::<u64>(ARG_SESSION_IDLE_TTL).copied() {
            Some(0) => anyhow::bail!("--{ARG_SESSION_IDLE_TTL} must be greater than zero"),
            other => other,
        };

        let logout_allowlist = matches
            .get_many::<String>(ARG_LOGOUT_REDIRECT_ALLOWLIST)
            .map(|values| {
                values
                    .map(|host| host.trim().to_string())
                    .filter(|host| !host.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            cookie_name,
            cookie_domain: matches
                .get_one::<String>(ARG_SESSION_COOKIE_DOMAIN)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            same_site,
            secure,
            ttl_seconds: read_secs(matches, ARG_SESSION_TTL)?,
            idle_ttl_seconds,
            csrf_cookie_name,
            csrf_enforced: read_flag(matches, ARG_CSRF_COOKIE_ENFORCED),
            csrf_ttl_seconds: read_secs(matches, ARG_CSRF_TTL)?,
            logout_allowlist,
        })
    }
}

fn required_name(matches: &ArgMatches, id: &str) -> anyhow::Result<String> {
    matches
        .get_one::<String>(id)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing required argument: --{id}"))
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_session_cookie_args(command);
    with_csrf_args(command)
}

fn with_session_cookie_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_SESSION_COOKIE_NAME)
                .long(ARG_SESSION_COOKIE_NAME)
                .help("Session cookie name")
                .env("SESSION_COOKIE_NAME")
                .default_value("sid"),
        )
        .arg(
            Arg::new(ARG_SESSION_COOKIE_DOMAIN)
                .long(ARG_SESSION_COOKIE_DOMAIN)
                .help("Session cookie Domain attribute (host-only when absent)")
                .env("SESSION_COOKIE_DOMAIN"),
        )
        .arg(
            Arg::new(ARG_SESSION_SAMESITE)
                .long(ARG_SESSION_SAMESITE)
                .help("Session cookie SameSite attribute; none forces Secure")
                .env("SESSION_SAMESITE")
                .default_value("lax")
                .value_parser(PossibleValuesParser::new(["lax", "strict", "none"])),
        )
        .arg(
            Arg::new(ARG_SESSION_SECURE)
                .long(ARG_SESSION_SECURE)
                .help("Secure attribute: auto follows the request scheme or X-Forwarded-Proto")
                .env("SESSION_SECURE")
                .default_value("auto")
                .value_parser(PossibleValuesParser::new([
                    "auto", "always", "never", "true", "false",
                ])),
        )
        .arg(
            Arg::new(ARG_SESSION_TTL)
                .long(ARG_SESSION_TTL)
                .help("Absolute session lifetime (seconds, or with s/m/h/d suffix)")
                .env("SESSION_TTL")
                .default_value("12h")
                .value_parser(validator_duration()),
        )
        .arg(
            Arg::new(ARG_SESSION_IDLE_TTL)
                .long(ARG_SESSION_IDLE_TTL)
                .help("Idle timeout refreshed on every session read")
                .env("SESSION_IDLE_TTL")
                .value_parser(validator_duration()),
        )
        .arg(
            Arg::new(ARG_LOGOUT_REDIRECT_ALLOWLIST)
                .long(ARG_LOGOUT_REDIRECT_ALLOWLIST)
                .help("Comma separated hosts accepted as logout return_to targets")
                .env("LOGOUT_REDIRECT_ALLOWLIST")
                .action(ArgAction::Append)
                .value_delimiter(','),
        )
}

fn with_csrf_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_CSRF_COOKIE_NAME)
                .long(ARG_CSRF_COOKIE_NAME)
                .help("Double-submit CSRF cookie name")
                .env("CSRF_COOKIE_NAME")
                .default_value("csrf_token"),
        )
        .arg(flag(
            ARG_CSRF_COOKIE_ENFORCED,
            "CSRF_COOKIE_ENFORCED",
            "true",
            "Require a matching X-CSRF-Token header on cookie-authenticated writes",
        ))
        .arg(
            Arg::new(ARG_CSRF_TTL)
                .long(ARG_CSRF_TTL)
                .help("CSRF cookie lifetime")
                .env("CSRF_TTL")
                .default_value("30m")
                .value_parser(validator_duration()),
        )
}
