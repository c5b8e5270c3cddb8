pub mod issuer;
pub mod logging;
pub mod session;
pub mod tenancy;
pub mod tokens;

use clap::{
    Arg, ArgMatches, ColorChoice, Command,
    builder::{
        BoolishValueParser, ValueParser,
        styling::{AnsiColor, Effects, Styles},
    },
};

/// Durations accept plain seconds or a single `s`, `m`, `h` or `d` suffix.
#[must_use]
pub fn validator_duration() -> ValueParser {
    ValueParser::from(move |value: &str| -> std::result::Result<u64, String> {
        parse_duration_secs(value)
    })
}

fn parse_duration_secs(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim();
    let (digits, unit) = match value.char_indices().last() {
        Some((idx, 's')) => (&value[..idx], 1),
        Some((idx, 'm')) => (&value[..idx], 60),
        Some((idx, 'h')) => (&value[..idx], 3600),
        Some((idx, 'd')) => (&value[..idx], 86_400),
        _ => (value, 1),
    };
    let amount = digits
        .trim()
        .parse::<u64>()
        .map_err(|_| format!("invalid duration: {value}"))?;
    amount
        .checked_mul(unit)
        .ok_or_else(|| format!("duration out of range: {value}"))
}

/// A boolean option that also works as a bare flag (`--name` means true).
pub(crate) fn flag(
    id: &'static str,
    env: &'static str,
    default: &'static str,
    help: &'static str,
) -> Arg {
    Arg::new(id)
        .long(id)
        .help(help)
        .env(env)
        .num_args(0..=1)
        .default_value(default)
        .default_missing_value("true")
        .value_parser(BoolishValueParser::new())
}

pub(crate) fn read_flag(matches: &ArgMatches, id: &str) -> bool {
    matches.get_one::<bool>(id).copied().unwrap_or(false)
}

pub(crate) fn read_secs(matches: &ArgMatches, id: &str) -> anyhow::Result<u64> {
    match matches.get_one::<u64>(id).copied() {
        Some(0) => anyhow::bail!("--{id} must be greater than zero"),
        Some(secs) => Ok(secs),
        None => anyhow::bail!("missing required argument: --{id}"),
    }
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    let command = Command::new("tessera")
        .about("Multi-tenant OAuth2/OIDC token service")
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8080")
                .env("TESSERA_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("dsn")
                .short('d')
                .long("dsn")
                .help("Global database connection string")
                .long_help(
                    "Global database connection string. Without it every store, the session cache and the code store live in memory.",
                )
                .env("TESSERA_DSN"),
        );

    let command = issuer::with_args(command);
    let command = tokens::with_args(command);
    let command = session::with_args(command);
    let command = tenancy::with_args(command);
    logging::with_args(command)
}
