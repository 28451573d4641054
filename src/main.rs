mod cli;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

use sentinel_supervisor::ipc::{Cmd, Evt, Request};
use sentinel_supervisor::{Supervisor, SupervisorConfig, launcher, privilege};

fn main() {
    // Initialize logger with custom format; stdout is reserved for IPC
    env_logger::Builder::from_default_env()
        .format(|buf, record| {
            use std::io::Write;
            writeln!(
                buf,
                "[{} {} {}:{}] {}",
                buf.timestamp_millis(),
                record.level(),
                record.file().unwrap_or("unknown"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let rt = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("FATAL: Failed to create Tokio runtime: {e}");
            eprintln!("The supervisor cannot start without an async runtime.");
            std::process::exit(1);
        }
    };
    let result = rt.block_on(real_main());
    // A pending stdin read would otherwise hold the runtime open.
    rt.shutdown_timeout(Duration::from_secs(1));
    if let Err(e) = result {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn real_main() -> Result<()> {
    let args = cli::Args::parse();
    let cfg = load_config(args.config)?;

    match args.sub.unwrap_or(cli::Cmd::Serve) {
        cli::Cmd::Serve => serve(cfg).await,
        cli::Cmd::Run { user_id } => run_foreground(cfg, &user_id).await,
        cli::Cmd::Check => handle_check(&cfg),
    }
}

fn load_config(config_path: Option<String>) -> Result<SupervisorConfig> {
    let cfg_path = match config_path {
        Some(path) => PathBuf::from(path),
        None => SupervisorConfig::default_path()?,
    };
    SupervisorConfig::load_or_create(&cfg_path)
        .with_context(|| format!("Failed to load config from {}", cfg_path.display()))
}

/// Resolves on SIGINT, or SIGTERM where it exists.
async fn shutdown_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => "SIGINT",
                    _ = term.recv() => "SIGTERM",
                }
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "Ctrl-C"
    }
}

/// IPC loop: requests on stdin, status/output/exit/reply messages on stdout.
async fn serve(cfg: SupervisorConfig) -> Result<()> {
    let supervisor = Supervisor::new(cfg);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Evt>();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(evt) = out_rx.recv().await {
            let mut line = match evt.to_line() {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to serialise message: {e}");
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = stdout.write_all(line.as_bytes()).await {
                error!("stdout closed: {e}");
                break;
            }
            let _ = stdout.flush().await;
        }
    });

    let subscriptions = [
        {
            let tx = out_tx.clone();
            supervisor.subscribe_status(move |s| {
                let _ = tx.send(Evt::status(s));
            })
        },
        {
            let tx = out_tx.clone();
            supervisor.subscribe_output(move |l| {
                let _ = tx.send(Evt::output(l));
            })
        },
        {
            let tx = out_tx.clone();
            supervisor.subscribe_exit(move |r| {
                let _ = tx.send(Evt::exited(r));
            })
        },
    ];
    let _ = out_tx.send(Evt::status(&supervisor.status().await));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match Request::parse(&line) {
                    Ok(req) if req.cmd == Cmd::Shutdown => {
                        info!("shutdown requested over IPC");
                        let outcome = supervisor.shutdown().await;
                        let _ = out_tx.send(Evt::reply(req.id, outcome));
                        break;
                    }
                    Ok(req) => {
                        // Each request runs on its own so a stop can
                        // overtake a start that is still in its grace window.
                        let supervisor = supervisor.clone();
                        let tx = out_tx.clone();
                        tokio::spawn(async move {
                            let _ = tx.send(handle_request(&supervisor, req).await);
                        });
                    }
                    Err(e) => {
                        warn!("Invalid request {line:?}: {e}");
                        let _ = out_tx.send(Evt::error(None, format!("invalid request: {e}")));
                    }
                },
                Ok(None) => {
                    info!("stdin closed, shutting down");
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {e}");
                    break;
                }
            },
            sig = &mut shutdown => {
                info!("signal {sig} – orderly shutdown");
                break;
            }
        }
    }

    let outcome = supervisor.shutdown().await;
    info!("supervisor exiting ({})", outcome.message);

    for id in subscriptions {
        supervisor.unsubscribe(id);
    }
    drop(out_tx);
    let _ = writer.await;
    Ok(())
}

async fn handle_request(supervisor: &Supervisor, req: Request) -> Evt {
    match req.cmd {
        Cmd::Start => {
            let user_id = req.user_id.unwrap_or_default();
            Evt::reply(req.id, supervisor.start(&user_id).await)
        }
        Cmd::Stop => Evt::reply(req.id, supervisor.stop().await),
        Cmd::Status => {
            let status = supervisor.status().await;
            Evt::reply(
                req.id,
                sentinel_supervisor::CommandOutcome {
                    success: true,
                    message: status.status.to_string(),
                    status,
                },
            )
        }
        Cmd::Shutdown => Evt::reply(req.id, supervisor.shutdown().await),
    }
}

/// Monitor one user until interrupted, logging transitions.
async fn run_foreground(cfg: SupervisorConfig, user_id: &str) -> Result<()> {
    let supervisor = Supervisor::new(cfg);
    supervisor.subscribe_status(|s| {
        info!(
            "status → {} (pid: {:?}, lastError: {:?})",
            s.status, s.pid, s.last_error
        );
    });
    supervisor.subscribe_exit(|r| {
        info!("monitor exited (code: {:?}, signal: {:?})", r.code, r.signal);
    });

    let outcome = supervisor.start(user_id).await;
    if !outcome.success {
        anyhow::bail!("Failed to start monitor for {user_id}: {}", outcome.message);
    }
    info!("{}", outcome.message);

    let sig = shutdown_signal().await;
    info!("signal {sig} – stopping monitor");
    let outcome = supervisor.shutdown().await;
    info!("monitor {} ({})", outcome.status.status, outcome.message);
    Ok(())
}

/// Report what a start would do, without starting anything.
fn handle_check(cfg: &SupervisorConfig) -> Result<()> {
    let elevated = privilege::is_elevated();
    println!("elevated:       {elevated}");
    println!("admin required: {}", privilege::admin_required_by_policy(cfg));
    println!("build mode:     {:?}", cfg.build_mode);
    println!("project root:   {}", cfg.root().display());

    match launcher::prepare(cfg, "<user-id>", elevated) {
        Ok(invocation) => {
            println!(
                "invocation:     {} {}",
                invocation.program.display(),
                invocation.args.join(" ")
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("Monitor cannot be launched: {e}");
            std::process::exit(1);
        }
    }
}
