//! Map parsed CLI arguments to the action they select.

use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{issuer, session, tenancy, tokens};
use anyhow::Result;
use secrecy::SecretString;

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if an argument group is missing values or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .filter(|v| !v.trim().is_empty())
        .map(|v| SecretString::from(v.clone()));

    let issuer_opts = issuer::Options::parse(matches)?;
    let token_opts = tokens::Options::parse(matches)?;
    let session_opts = session::Options::parse(matches)?;
    let tenancy_opts = tenancy::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        issuer_mode: issuer_opts.mode,
        issuer_base: issuer_opts.base,
        tokens: token_opts,
        session: session_opts,
        tenancy: tenancy_opts,
    }))
}
