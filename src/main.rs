//! txcore - transaction manager demo
//!
//! Runs the demo scenarios against an in-memory store and prints what each
//! one left behind.

use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::Level;

use txcore::config::TxConfig;
use txcore::service::{RecordService, ServiceError};
use txcore::session::{MemoryStore, Record};
use txcore::transaction::{IsolationLevel, TransactionManager};

const SCENARIOS: &[&str] = &["create", "fail", "reject", "recover", "list", "lock"];

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().collect();

    // Parse simple command line args.
    let mut verbose = false;
    let mut config = TxConfig::new();
    let mut workers = 2usize;
    let mut scenario = String::from("all");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-v" | "--verbose" => {
                verbose = true;
            }
            "--lock-timeout" => {
                i += 1;
                match args.get(i).map(|s| s.parse::<u64>()) {
                    Some(Ok(ms)) => config = config.lock_wait_timeout(Duration::from_millis(ms)),
                    _ => {
                        eprintln!("--lock-timeout expects milliseconds");
                        return ExitCode::FAILURE;
                    }
                }
            }
            "--isolation" => {
                i += 1;
                match args.get(i).map(|s| s.parse::<IsolationLevel>()) {
                    Some(Ok(level)) => config = config.default_isolation(level),
                    Some(Err(e)) => {
                        eprintln!("{}", e);
                        return ExitCode::FAILURE;
                    }
                    None => {
                        eprintln!("--isolation expects a level");
                        return ExitCode::FAILURE;
                    }
                }
            }
            "--workers" => {
                i += 1;
                match args.get(i).map(|s| s.parse::<usize>()) {
                    Some(Ok(n)) if n > 0 => workers = n,
                    _ => {
                        eprintln!("--workers expects a positive number");
                        return ExitCode::FAILURE;
                    }
                }
            }
            "-h" | "--help" => {
                print_help();
                return ExitCode::SUCCESS;
            }
            "--version" => {
                println!("txcore v{}", env!("CARGO_PKG_VERSION"));
                return ExitCode::SUCCESS;
            }
            arg => {
                if arg == "all" || SCENARIOS.contains(&arg) {
                    scenario = arg.to_string();
                } else {
                    eprintln!("Unknown option: {}", arg);
                    return ExitCode::FAILURE;
                }
            }
        }
        i += 1;
    }

    tracing_subscriber::fmt()
        .with_max_level(if verbose { Level::DEBUG } else { Level::INFO })
        .with_thread_names(true)
        .with_target(false)
        .init();

    let store = MemoryStore::new();
    let manager = TransactionManager::with_config(store.clone(), config.verbose(verbose));
    let service = RecordService::new(&manager).with_workers(workers);

    let selected: Vec<&str> = if scenario == "all" {
        SCENARIOS.to_vec()
    } else {
        vec![scenario.as_str()]
    };

    for name in selected {
        println!("== {} ==", name);
        if let Err(e) = run_scenario(name, &manager, &service) {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
        println!();
    }

    println!("== store ==");
    println!("commits: {}, rollbacks: {}", store.commits(), store.rollbacks());
    match store.dump_json() {
        Ok(json) => println!("{}", json),
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    }
    ExitCode::SUCCESS
}

fn print_help() {
    println!("txcore - transaction manager demo");
    println!();
    println!("Usage: txcore [OPTIONS] [SCENARIO]");
    println!();
    println!("Scenarios:");
    println!("  all        Run every scenario (default)");
    println!("  create     Save a record and commit");
    println!("  fail       Save a record, fail at runtime, roll back");
    println!("  reject     Save a record, fail with a business error, still commit");
    println!("  recover    Catch a nested failure; the outer commit is refused");
    println!("  list       Read all records and probe them from worker threads");
    println!("  lock       Concurrent updates of one record under a row lock");
    println!();
    println!("Options:");
    println!("  --isolation LEVEL      Default isolation (default: READ_COMMITTED)");
    println!("  --lock-timeout MS      Lock wait timeout in milliseconds (default: 5000)");
    println!("  --workers N            Worker threads for 'list' and 'lock' (default: 2)");
    println!("  -v, --verbose          Enable debug logging");
    println!("  -h, --help             Show this help message");
    println!("  --version              Show version");
}

fn run_scenario(
    name: &str,
    manager: &TransactionManager,
    service: &RecordService,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = manager.context();

    match name {
        "create" => {
            let saved = service.create_record(&ctx, "dummy")?;
            println!("committed {} (version {})", saved.id, saved.version);
        }
        "fail" => report_failure(service.create_record_then_fail(&ctx, "another")),
        "reject" => report_failure(service.create_record_then_reject(&ctx, "rejected")),
        "recover" => report_failure(service.create_then_recover(&ctx, "recovering")),
        "list" => {
            let report = service.list_and_touch_all(&ctx)?;
            println!(
                "{}: active={} transaction={:?} touched={}",
                report.caller_thread,
                report.caller_active,
                report.caller_transaction,
                report.touched.len()
            );
            for worker in &report.workers {
                println!(
                    "  {}: record={} active={} transaction={:?}",
                    worker.thread, worker.record, worker.active, worker.transaction
                );
            }
        }
        "lock" => run_lock_scenario(manager, service)?,
        other => return Err(format!("unknown scenario: {}", other).into()),
    }
    Ok(())
}

fn report_failure(result: Result<Record, ServiceError>) {
    match result {
        Ok(record) => println!("unexpected commit of {}", record.id),
        Err(e) => println!("failed as expected: {}", e),
    }
}

/// Several threads rename the same record; the row lock makes them take
/// turns.
fn run_lock_scenario(
    manager: &TransactionManager,
    service: &RecordService,
) -> Result<(), Box<dyn std::error::Error>> {
    let ctx = manager.context();
    let target = service.create_record(&ctx, "contended")?.id;
    let finished = Mutex::new(Vec::new());

    thread::scope(|scope| {
        for n in 0..service.workers() {
            let finished = &finished;
            let name = format!("locker-{}", n);
            let spawned = thread::Builder::new().name(name.clone()).spawn_scoped(scope, move || {
                let ctx = manager.context();
                let outcome = service.update_with_lock(&ctx, target, &name);
                finished.lock().push((name, outcome.map(|r| r.version)));
            });
            if let Err(e) = spawned {
                eprintln!("failed to spawn locker: {}", e);
            }
        }
    });

    for (name, outcome) in finished.into_inner() {
        match outcome {
            Ok(version) => println!("{} committed version {}", name, version),
            Err(e) => println!("{} failed: {}", name, e),
        }
    }
    Ok(())
}
