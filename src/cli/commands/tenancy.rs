use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;
use std::{collections::HashMap, path::PathBuf};

use crate::tenancy::parse_tenant_dsn;

pub const ARG_TENANT_DSN: &str = "tenant-dsn";
pub const ARG_DATA_ROOT: &str = "data-root";

#[derive(Debug, Clone, Default)]
pub struct Options {
    pub tenant_dsns: HashMap<String, SecretString>,
    pub data_root: Option<PathBuf>,
}

impl Options {
    /// Parse tenant database and control plane arguments.
    ///
    /// # Errors
    /// Returns an error if a `slug=dsn` pair is malformed or a slug repeats.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let mut tenant_dsns = HashMap::new();
        for value in matches
            .get_many::<String>(ARG_TENANT_DSN)
            .into_iter()
            .flatten()
            .filter(|v| !v.trim().is_empty())
        {
            let (slug, dsn) = parse_tenant_dsn(value)
                .map_err(|err| anyhow::anyhow!("invalid --{ARG_TENANT_DSN}: {err}"))?;
            if tenant_dsns.insert(slug.clone(), dsn).is_some() {
                anyhow::bail!("duplicate --{ARG_TENANT_DSN} for tenant {slug}");
            }
        }

        Ok(Self {
            tenant_dsns,
            data_root: matches
                .get_one::<String>(ARG_DATA_ROOT)
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TENANT_DSN)
                .long(ARG_TENANT_DSN)
                .help("Tenant database as slug=dsn; repeat or comma separate for several tenants")
                .env("TESSERA_TENANT_DSNS")
                .action(ArgAction::Append)
                .value_delimiter(','),
        )
        .arg(
            Arg::new(ARG_DATA_ROOT)
                .long(ARG_DATA_ROOT)
                .help("Directory holding tenants/*.json control plane documents")
                .env("DATA_ROOT"),
        )
}
