use clap::{Arg, ArgMatches, Command, builder::PossibleValuesParser};

use crate::issuer::IssuerMode;

pub const ARG_ISSUER_MODE: &str = "issuer-mode";
pub const ARG_ISSUER_BASE: &str = "issuer-base";

#[derive(Debug, Clone)]
pub struct Options {
    pub mode: IssuerMode,
    pub base: String,
}

impl Options {
    /// Parse issuer arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the mode is unknown or the base is empty.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let mode = matches
            .get_one::<String>(ARG_ISSUER_MODE)
            .map_or(Ok(IssuerMode::Global), |mode| mode.parse())?;
        let base = matches
            .get_one::<String>(ARG_ISSUER_BASE)
            .cloned()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_ISSUER_BASE}"))?;
        Ok(Self { mode, base })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_ISSUER_MODE)
                .long(ARG_ISSUER_MODE)
                .help("Issuer resolution: global, path (base + /slug) or domain (slug.base host)")
                .env("ISSUER_MODE")
                .default_value("global")
                .value_parser(PossibleValuesParser::new(["global", "path", "domain"])),
        )
        .arg(
            Arg::new(ARG_ISSUER_BASE)
                .long(ARG_ISSUER_BASE)
                .help("Base issuer URL")
                .env("ISSUER_BASE")
                .default_value("http://localhost:8080"),
        )
}
