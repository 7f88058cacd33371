use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{error, info};

use two_phase_commit::cli::{self, CoordinatorOpts, FailSafeOpts, Role};
use two_phase_commit::coordinator;
use two_phase_commit::failsafe;
use two_phase_commit::oplog::OpLog;
use two_phase_commit::participant;
use two_phase_commit::resource_manager::InMemoryResourceManager;

fn open_log(log_dir: &str, file_name: &str) -> OpLog {
    if let Err(e) = fs::create_dir_all(log_dir) {
        error!("Failed to create log_path: \"{:?}\". Error \"{:?}\"", log_dir, e);
    }
    let path: PathBuf = Path::new(log_dir).join(file_name);
    match OpLog::new(&path) {
        Ok(log) => log,
        Err(e) => {
            eprintln!("Failed to open oplog at {:?}: {}", path, e);
            process::exit(1);
        }
    }
}

fn run_coordinator(opts: CoordinatorOpts, running: Arc<AtomicBool>) {
    info!(
        "coordinator: dialing fail-safe coordinator at {}:{}",
        opts.failsafe_host, opts.failsafe_port
    );
    let failsafe_stream = match coordinator::Coordinator::connect_to_failsafe(
        &opts.failsafe_host,
        opts.failsafe_port,
        cli::DEFAULT_FAILSAFE_LOCAL_PORT,
    ) {
        Ok(stream) => stream,
        Err(e) => {
            // Fatal at startup: the primary coordinator has nothing to
            // hand its commit decision to without the fail-safe
            // coordinator in place.
            error!("coordinator: could not reach fail-safe coordinator: {}", e);
            process::exit(1);
        }
    };

    let transaction = match coordinator::prompt_transaction_sql() {
        Ok(sql) => sql,
        Err(e) => {
            error!("coordinator: failed to read transaction from stdin: {}", e);
            process::exit(1);
        }
    };

    let listener = match TcpListener::bind(("0.0.0.0", opts.listen_port)) {
        Ok(l) => l,
        Err(e) => {
            error!("coordinator: failed to bind listen port {}: {}", opts.listen_port, e);
            process::exit(1);
        }
    };
    info!("coordinator: listening on {}", opts.listen_port);

    let log = open_log(&opts.log_path, "coordinator.log");
    let coordinator = Arc::new(coordinator::Coordinator::with_round_deadline(
        opts.participants,
        failsafe_stream,
        transaction,
        log,
        Duration::from_secs(opts.protocol_delay_secs),
        opts.round_timeout_secs.map(Duration::from_secs),
    ));

    if let Err(e) = coordinator.run(listener, running) {
        error!("coordinator: accept loop exited: {}", e);
        process::exit(1);
    }
}

fn run_failsafe(opts: FailSafeOpts, running: Arc<AtomicBool>) {
    let listener = match TcpListener::bind(("0.0.0.0", opts.listen_port)) {
        Ok(l) => l,
        Err(e) => {
            error!("failsafe: failed to bind listen port {}: {}", opts.listen_port, e);
            process::exit(1);
        }
    };
    info!("failsafe: listening on {}", opts.listen_port);

    let log = open_log(&opts.log_path, "failsafe.log");
    let decision_file = opts.decision_file.map(PathBuf::from);
    let failsafe = match failsafe::FailSafe::new(opts.participants, decision_file, log) {
        Ok(f) => Arc::new(f),
        Err(e) => {
            error!("failsafe: failed to load decision file: {}", e);
            process::exit(1);
        }
    };

    if let Err(e) = failsafe.run(listener, running) {
        error!("failsafe: accept loop exited: {}", e);
        process::exit(1);
    }
}

fn run_participant(opts: cli::ParticipantOpts) {
    let mut db = InMemoryResourceManager::new();
    if opts.fail_insert {
        db = db.with_forced_abort();
    }
    let mut log = open_log(&opts.log_path, "participant.log");

    let participant_opts = participant::ParticipantOpts {
        coordinator_host: opts.coordinator_host,
        coordinator_port: opts.coordinator_port,
        failsafe_host: opts.failsafe_host,
        failsafe_port: opts.failsafe_port,
        timeout: Duration::from_secs(opts.timeout_secs),
    };

    match participant::run(&participant_opts, &mut db, &mut log) {
        Ok(()) => info!("participant: round complete"),
        Err(e) => {
            error!("participant: terminal error: {}", e);
            process::exit(1);
        }
    }
}

fn main() {
    let role = cli::parse();
    let verbosity = match &role {
        Role::Coordinator(o) => o.verbosity,
        Role::FailSafe(o) => o.verbosity,
        Role::Participant(o) => o.verbosity,
    };
    stderrlog::new()
        .module(module_path!())
        .quiet(false)
        .timestamp(stderrlog::Timestamp::Millisecond)
        .verbosity(verbosity)
        .init()
        .unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("Ctrl+C signal received, setting running flag to false.");
        r.store(false, Ordering::SeqCst);
    })
    .expect("Error setting signal handler!");

    match role {
        Role::Coordinator(opts) => run_coordinator(opts, running),
        Role::FailSafe(opts) => run_failsafe(opts, running),
        Role::Participant(opts) => run_participant(opts),
    }
}
