//!
//! cli.rs
//! Command-line surface for the three roles: one options struct per
//! role, each filled in by its own `clap` subcommand. Non-interactive
//! subcommands are friendlier to scripting and to the integration
//! tests in `tests/` than an interactive role-selection prompt.
//!
use clap::{App, Arg, ArgMatches, SubCommand};

pub const DEFAULT_COORDINATOR_PORT: u16 = 8005;
pub const DEFAULT_FAILSAFE_PORT: u16 = 8006;
pub const DEFAULT_FAILSAFE_LOCAL_PORT: u16 = 9000;
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_PROTOCOL_DELAY_SECS: u64 = 3;

pub enum Role {
    Coordinator(CoordinatorOpts),
    FailSafe(FailSafeOpts),
    Participant(ParticipantOpts),
}

pub struct CoordinatorOpts {
    pub participants: u32,
    pub failsafe_host: String,
    pub failsafe_port: u16,
    pub listen_port: u16,
    pub protocol_delay_secs: u64,
    pub round_timeout_secs: Option<u64>,
    pub log_path: String,
    pub verbosity: usize,
}

pub struct FailSafeOpts {
    pub participants: u32,
    pub listen_port: u16,
    pub decision_file: Option<String>,
    pub log_path: String,
    pub verbosity: usize,
}

pub struct ParticipantOpts {
    pub coordinator_host: String,
    pub coordinator_port: u16,
    pub failsafe_host: String,
    pub failsafe_port: u16,
    pub timeout_secs: u64,
    pub fail_insert: bool,
    pub log_path: String,
    pub verbosity: usize,
}

fn verbosity_of(matches: &ArgMatches) -> usize {
    matches.occurrences_of("verbose") as usize
}

fn log_path_of(matches: &ArgMatches) -> String {
    let raw = matches.value_of("log-path").unwrap_or("./logs");
    shellexpand::tilde(raw).into_owned()
}

/// parse()
/// Parses `std::env::args()` into a `Role`. Exits the process with
/// clap's usage message on a malformed invocation.
pub fn parse() -> Role {
    let matches = App::new("two_phase_commit")
        .about("Three-role two-phase-commit protocol: primary coordinator, fail-safe coordinator, participant")
        .subcommand(
            SubCommand::with_name("coordinator")
                .about("Runs the primary coordinator")
                .arg(Arg::with_name("participants").long("participants").takes_value(true).required(true))
                .arg(Arg::with_name("failsafe-host").long("failsafe-host").takes_value(true).required(true))
                .arg(Arg::with_name("failsafe-port").long("failsafe-port").takes_value(true))
                .arg(Arg::with_name("listen-port").long("listen-port").takes_value(true))
                .arg(Arg::with_name("protocol-delay").long("protocol-delay").takes_value(true))
                .arg(Arg::with_name("round-timeout").long("round-timeout").takes_value(true))
                .arg(Arg::with_name("log-path").long("log-path").takes_value(true))
                .arg(Arg::with_name("verbose").short("v").multiple(true)),
        )
        .subcommand(
            SubCommand::with_name("failsafe")
                .about("Runs the fail-safe coordinator")
                .arg(Arg::with_name("participants").long("participants").takes_value(true).required(true))
                .arg(Arg::with_name("listen-port").long("listen-port").takes_value(true))
                .arg(Arg::with_name("decision-file").long("decision-file").takes_value(true))
                .arg(Arg::with_name("log-path").long("log-path").takes_value(true))
                .arg(Arg::with_name("verbose").short("v").multiple(true)),
        )
        .subcommand(
            SubCommand::with_name("participant")
                .about("Runs a participant")
                .arg(Arg::with_name("coordinator-host").long("coordinator-host").takes_value(true).required(true))
                .arg(Arg::with_name("coordinator-port").long("coordinator-port").takes_value(true))
                .arg(Arg::with_name("failsafe-host").long("failsafe-host").takes_value(true).required(true))
                .arg(Arg::with_name("failsafe-port").long("failsafe-port").takes_value(true))
                .arg(Arg::with_name("timeout").long("timeout").takes_value(true))
                .arg(Arg::with_name("fail-insert").long("fail-insert"))
                .arg(Arg::with_name("log-path").long("log-path").takes_value(true))
                .arg(Arg::with_name("verbose").short("v").multiple(true)),
        )
        .get_matches();

    match matches.subcommand() {
        ("coordinator", Some(m)) => Role::Coordinator(CoordinatorOpts {
            participants: m.value_of("participants").unwrap().parse().expect("--participants must be a number"),
            failsafe_host: m.value_of("failsafe-host").unwrap().to_string(),
            failsafe_port: m
                .value_of("failsafe-port")
                .map(|v| v.parse().expect("--failsafe-port must be a number"))
                .unwrap_or(DEFAULT_FAILSAFE_PORT),
            listen_port: m
                .value_of("listen-port")
                .map(|v| v.parse().expect("--listen-port must be a number"))
                .unwrap_or(DEFAULT_COORDINATOR_PORT),
            protocol_delay_secs: m
                .value_of("protocol-delay")
                .map(|v| v.parse().expect("--protocol-delay must be a number"))
                .unwrap_or(DEFAULT_PROTOCOL_DELAY_SECS),
            round_timeout_secs: m
                .value_of("round-timeout")
                .map(|v| v.parse().expect("--round-timeout must be a number")),
            log_path: log_path_of(m),
            verbosity: verbosity_of(m),
        }),
        ("failsafe", Some(m)) => Role::FailSafe(FailSafeOpts {
            participants: m.value_of("participants").unwrap().parse().expect("--participants must be a number"),
            listen_port: m
                .value_of("listen-port")
                .map(|v| v.parse().expect("--listen-port must be a number"))
                .unwrap_or(DEFAULT_FAILSAFE_PORT),
            decision_file: m.value_of("decision-file").map(|v| shellexpand::tilde(v).into_owned()),
            log_path: log_path_of(m),
            verbosity: verbosity_of(m),
        }),
        ("participant", Some(m)) => Role::Participant(ParticipantOpts {
            coordinator_host: m.value_of("coordinator-host").unwrap().to_string(),
            coordinator_port: m
                .value_of("coordinator-port")
                .map(|v| v.parse().expect("--coordinator-port must be a number"))
                .unwrap_or(DEFAULT_COORDINATOR_PORT),
            failsafe_host: m.value_of("failsafe-host").unwrap().to_string(),
            failsafe_port: m
                .value_of("failsafe-port")
                .map(|v| v.parse().expect("--failsafe-port must be a number"))
                .unwrap_or(DEFAULT_FAILSAFE_PORT),
            timeout_secs: m
                .value_of("timeout")
                .map(|v| v.parse().expect("--timeout must be a number"))
                .unwrap_or(DEFAULT_TIMEOUT_SECS),
            fail_insert: m.is_present("fail-insert"),
            log_path: log_path_of(m),
            verbosity: verbosity_of(m),
        }),
        _ => {
            eprintln!("Unknown or missing subcommand; run with --help.");
            std::process::exit(2);
        }
    }
}
