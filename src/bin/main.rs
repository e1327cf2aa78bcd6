use std::{
    fs,
    io::BufRead,
    os::unix::net::UnixStream,
    process,
};

use chrono::Utc;
use nix::unistd::Uid;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use warden::{
    cli::{Cli, Commands, parse_args},
    constants::EXIT_CODE_RESTART,
    daemon::{Daemon, DaemonOptions, ExitReason},
    ipc::{self, ChangeInfo, ControlCommand, ControlError, ControlResponse},
    logs::LogEntry,
    plan::CheckLevel,
    runtime::{self, RuntimeMode},
    service::ShutdownRequest,
};

fn main() {
    let args = parse_args();
    let euid = Uid::effective();

    let runtime_mode = if args.sys {
        if !euid.is_root() {
            eprintln!("--sys requires root privileges");
            process::exit(1);
        }
        RuntimeMode::System
    } else {
        RuntimeMode::User
    };

    runtime::init(runtime_mode);
    if let Some(dir) = &args.dir {
        runtime::init_with_dir(dir);
    }
    init_logging(args.log_level.as_deref());

    if euid.is_root() && runtime_mode == RuntimeMode::User && args.dir.is_none() {
        warn!("Running as root without --sys; state will be stored in userspace paths");
    }

    match args.command {
        Commands::Run => run_daemon(),
        Commands::Services { names } => {
            match send_or_fail(&ControlCommand::Services { names }) {
                ControlResponse::Services(services) => {
                    println!("{:<20} {:<10} {}", "Service", "Startup", "Current");
                    for service in services {
                        println!(
                            "{:<20} {:<10} {}",
                            service.name,
                            format!("{:?}", service.startup).to_lowercase(),
                            service.current.as_ref()
                        );
                    }
                }
                other => print_response(other),
            }
        }
        Commands::Start { names, wait } => submit(ControlCommand::Start { names }, wait),
        Commands::Stop { names, wait } => submit(ControlCommand::Stop { names }, wait),
        Commands::Restart { names, wait } => {
            submit(ControlCommand::Restart { names }, wait)
        }
        Commands::Autostart { wait } => submit(ControlCommand::Autostart, wait),
        Commands::Replan { wait } => submit(ControlCommand::Replan, wait),
        Commands::Plan => match send_or_fail(&ControlCommand::Plan) {
            ControlResponse::PlanYaml(yaml) => print!("{yaml}"),
            other => print_response(other),
        },
        Commands::AddLayer {
            label,
            file,
            combine,
        } => {
            let yaml = match fs::read_to_string(&file) {
                Ok(yaml) => yaml,
                Err(err) => {
                    eprintln!("Cannot read layer file {}: {err}", file.display());
                    process::exit(1);
                }
            };
            print_response(send_or_fail(&ControlCommand::AddLayer {
                label,
                yaml,
                combine,
            }));
        }
        Commands::Checks { level, names } => {
            let level = parse_level(level.as_deref());
            match send_or_fail(&ControlCommand::Checks { level, names }) {
                ControlResponse::Checks(checks) => {
                    println!(
                        "{:<20} {:<8} {:<6} {}",
                        "Check", "Level", "Status", "Failures"
                    );
                    for check in checks {
                        println!(
                            "{:<20} {:<8} {:<6} {}/{}",
                            check.name,
                            format!("{:?}", check.level).to_lowercase(),
                            format!("{:?}", check.status).to_lowercase(),
                            check.failures,
                            check.threshold
                        );
                    }
                }
                other => print_response(other),
            }
        }
        Commands::Health { level, names } => {
            let level = parse_level(level.as_deref());
            match send_or_fail(&ControlCommand::Health { level, names }) {
                ControlResponse::Health { healthy } => {
                    println!("healthy: {healthy}");
                    if !healthy {
                        process::exit(2);
                    }
                }
                other => print_response(other),
            }
        }
        Commands::Logs {
            services,
            n,
            follow,
        } => stream_logs(services, n, follow),
        Commands::Signal { signal, names } => {
            print_response(send_or_fail(&ControlCommand::SignalServices {
                signal,
                names,
            }));
        }
        Commands::Warnings { all } => {
            match send_or_fail(&ControlCommand::Warnings { all }) {
                ControlResponse::Warnings(warnings) => {
                    for warning in warnings {
                        println!("{}  {}", warning.last_added, warning.message);
                    }
                }
                other => print_response(other),
            }
        }
        Commands::Okay => {
            match send_or_fail(&ControlCommand::OkayWarnings {
                timestamp: Utc::now(),
            }) {
                ControlResponse::OkayedWarnings(count) => {
                    println!("Cleared {count} warning(s)");
                }
                other => print_response(other),
            }
        }
        Commands::Changes => match send_or_fail(&ControlCommand::Changes) {
            ControlResponse::Changes(changes) => {
                println!("{:<6} {:<10} {}", "ID", "Status", "Summary");
                for info in changes {
                    println!(
                        "{:<6} {:<10} {}",
                        info.change.id,
                        info.change.status.as_ref(),
                        info.change.summary
                    );
                }
            }
            other => print_response(other),
        },
        Commands::Tasks { id } => {
            match send_or_fail(&ControlCommand::Change { id }) {
                ControlResponse::Change(info) => print_change(&info),
                other => print_response(other),
            }
        }
        Commands::Abort { id } => {
            print_response(send_or_fail(&ControlCommand::Abort { id }));
        }
        Commands::Wait { id, timeout } => {
            let timeout = match timeout.as_deref().map(humantime::parse_duration) {
                None => None,
                Some(Ok(timeout)) => Some(timeout),
                Some(Err(err)) => {
                    eprintln!("Invalid --timeout value: {err}");
                    process::exit(1);
                }
            };
            match send_or_fail(&ControlCommand::WaitChange { id, timeout }) {
                ControlResponse::Change(info) => print_change(&info),
                other => print_response(other),
            }
        }
        Commands::Shutdown { restart } => {
            print_response(send_or_fail(&ControlCommand::Shutdown { restart }));
        }
    }
}

fn run_daemon() {
    let daemon = match Daemon::new(DaemonOptions { use_reaper: true }) {
        Ok(daemon) => daemon,
        Err(err) => {
            eprintln!("Cannot start daemon: {err}");
            process::exit(1);
        }
    };

    let shutdown = daemon.shutdown_sender();
    if let Err(err) = ctrlc::set_handler(move || {
        info!("Interrupt received; shutting down");
        let _ = shutdown.send(ShutdownRequest::Stop);
    }) {
        eprintln!("Cannot install signal handler: {err}");
        process::exit(1);
    }

    match daemon.run() {
        Ok(ExitReason::Stop) => {}
        Ok(ExitReason::Restart) => {
            info!("Exiting for restart handoff");
            process::exit(EXIT_CODE_RESTART);
        }
        Err(err) => {
            eprintln!("Daemon failed: {err}");
            process::exit(1);
        }
    }
}

/// Sends a command, exiting with the error's display form when the daemon
/// is unreachable or rejects it.
fn send_or_fail(command: &ControlCommand) -> ControlResponse {
    match ipc::send_command(command) {
        Ok(response) => response,
        Err(err @ ControlError::NotAvailable) => {
            eprintln!("{err}; is the warden daemon running?");
            process::exit(1);
        }
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    }
}

fn submit(command: ControlCommand, wait: bool) {
    match send_or_fail(&command) {
        ControlResponse::ChangeId(id) => {
            println!("Change {id} submitted");
            if wait {
                match send_or_fail(&ControlCommand::WaitChange { id, timeout: None }) {
                    ControlResponse::Change(info) => print_change(&info),
                    other => print_response(other),
                }
            }
        }
        other => print_response(other),
    }
}

fn stream_logs(services: Vec<String>, n: Option<i32>, follow: bool) {
    let command = ControlCommand::Logs {
        services,
        n,
        follow,
    };
    let (reader, response) = match ipc::open_command(&command) {
        Ok(opened) => opened,
        Err(err @ ControlError::NotAvailable) => {
            eprintln!("{err}; is the warden daemon running?");
            process::exit(1);
        }
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };

    match response {
        ControlResponse::Logs(entries) => {
            for entry in entries {
                print_log_entry(&entry);
            }
        }
        other => {
            print_response(other);
            return;
        }
    }

    if follow {
        follow_stream(reader);
    }
}

fn follow_stream(reader: std::io::BufReader<UnixStream>) {
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            // The daemon went away; a follow simply ends there.
            Err(_) => return,
        };
        match serde_json::from_str::<LogEntry>(&line) {
            Ok(entry) => print_log_entry(&entry),
            Err(err) => eprintln!("Bad log entry from daemon: {err}"),
        }
    }
}

fn print_log_entry(entry: &LogEntry) {
    println!("{} [{}] {}", entry.time, entry.service, entry.message);
}

fn print_change(info: &ChangeInfo) {
    println!(
        "Change {} ({}): {} - {}",
        info.change.id,
        info.change.kind,
        info.change.status.as_ref(),
        info.change.summary
    );
    for task in &info.tasks {
        println!("  Task {} ({}): {}", task.id, task.status.as_ref(), task.summary);
        for line in &task.log {
            println!("    {line}");
        }
    }
}

fn print_response(response: ControlResponse) {
    match response {
        ControlResponse::Ok => println!("OK"),
        ControlResponse::Message(message) => println!("{message}"),
        ControlResponse::Error(message) => {
            eprintln!("{message}");
            process::exit(1);
        }
        other => println!("{other:?}"),
    }
}

fn parse_level(level: Option<&str>) -> Option<CheckLevel> {
    match level {
        None => None,
        Some("alive") => Some(CheckLevel::Alive),
        Some("ready") => Some(CheckLevel::Ready),
        Some(other) => {
            eprintln!("invalid level \"{other}\" (expected alive or ready)");
            process::exit(1);
        }
    }
}

fn init_logging(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
