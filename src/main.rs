use std::{io, process::ExitCode, time::Duration};

use anyhow::{bail, Context, Result};
use backon::{BlockingRetryable, ExponentialBuilder};
use chrono::Local;
use clap::Parser;
use log::{debug, error, info, warn};

use crate::cli::{Cli, Commands};
use crate::config::models::Settings;
use crate::cups_client::client::CupsClient;
use crate::firebase::{auth::Authenticator, client::{FirestoreClient, FirestoreError}, credentials::{ConnectionToken, ServiceAccountKey}};
use crate::jobs::{documents::HttpDocumentSource, poller::{poll_once, CycleError}};
use crate::status::{board::StatusBoard, prompt::prompt_token};

mod cli;
mod config;
mod cups_client;
mod firebase;
mod jobs;
mod logging;
mod status;

fn main() -> ExitCode {
    let cli = Cli::parse();

    let settings = match crate::config::loading::load_config(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Could not load configuration: {e}");
            return ExitCode::from(2);
        }
    };

    if let Err(e) = logging::init(&settings.log) {
        eprintln!("{e:#}");
        return ExitCode::from(2);
    }

    let _sentry = settings.sentry_dsn().map(|dsn| sentry::init((dsn, sentry::ClientOptions {
        release: sentry::release_name!(),
        ..Default::default()
    })));

    match run(&cli, &settings) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            sentry::capture_message(&format!("{e:#}"), sentry::Level::Fatal);
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli, settings: &Settings) -> Result<()> {
    let cups = CupsClient::new(&settings.cups);
    let command = cli.selected_command();

    if command == Commands::Printers {
        return print_printers(&cups);
    }

    let token = resolve_token(cli, settings)?;
    let firestore = connect_firestore(settings, &token)?;

    let mut board = StatusBoard::default();
    match firestore.connect() {
        Ok(()) => board.connected(token.as_str()),
        Err(e) => {
            println!("{board}");
            return Err(e).context("Could not connect");
        }
    }

    match command {
        Commands::Connect => {
            println!("{board}");
            Ok(())
        }
        Commands::Jobs => print_pending_jobs(&firestore),
        Commands::Run | Commands::Printers => poll_forever(settings, &firestore, &cups, board),
    }
}

/// `--token`, then the configured token, then ask.
fn resolve_token(cli: &Cli, settings: &Settings) -> Result<ConnectionToken> {
    let raw = match cli.token.as_deref().or(settings.firebase.token()) {
        Some(token) => token.to_string(),
        None => match prompt_token(&mut io::stdin().lock(), &mut io::stdout())? {
            Some(token) => token,
            None => bail!("No token provided!"),
        },
    };
    Ok(ConnectionToken::new(&raw)?)
}

fn connect_firestore(settings: &Settings, token: &ConnectionToken) -> Result<FirestoreClient> {
    let firebase = &settings.firebase;

    let (auth, project_id) = if firebase.emulator {
        if firebase.project_id.is_empty() {
            bail!("firebase.projectid must be set when using the emulator");
        }
        (Authenticator::Emulator, firebase.project_id.clone())
    } else {
        let key = ServiceAccountKey::load(&firebase.credentials_file)?;
        key.validate()?;
        debug!("Loaded service account {}", key.client_email);
        let project_id = if firebase.project_id.is_empty() { key.project_id.clone() } else { firebase.project_id.clone() };
        (Authenticator::service_account(key, firebase.timeout)?, project_id)
    };

    Ok(FirestoreClient::new(firebase, &project_id, auth, token, firebase.timeout)?)
}

fn print_printers(cups: &CupsClient) -> Result<()> {
    let printers = cups.get_printers().context("Could not list printers")?;
    if printers.is_empty() {
        println!("No printers found.");
    }
    for printer in printers {
        println!("{}\t{}\t{}", printer, printer.identifier, printer.description);
    }
    Ok(())
}

fn print_pending_jobs(firestore: &FirestoreClient) -> Result<()> {
    let jobs = firestore.fetch_pending_jobs().context("Could not fetch pending jobs")?;
    if jobs.is_empty() {
        println!("No pending jobs.");
    }
    for job in jobs {
        let created = job.created_at.map(|at| at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_default();
        let document = job.document.as_ref().map(|d| d.to_string()).unwrap_or_else(|| "-".to_string());
        println!("{}\t{}\t{}\t{}", job.id, job.printer_name.as_deref().unwrap_or("(default)"), created, document);
    }
    Ok(())
}

fn poll_forever(settings: &Settings, firestore: &FirestoreClient, cups: &CupsClient, mut board: StatusBoard) -> Result<()> {
    let documents = HttpDocumentSource::new(settings.documents.timeout, settings.documents.max_bytes)?;
    let publish_printers = settings.firebase.publish_printers;
    let mut shown = String::new();

    info!("Polling {} for print jobs", firestore.account_path());
    loop {
        let cycle = (|| poll_once(firestore, cups, &documents, publish_printers))
            .retry(ExponentialBuilder::default().with_factor(4.0).with_max_times(3))
            .when(CycleError::is_transient)
            .notify(|e, wait| warn!("Polling failed, retrying in {:?}: {}", wait, e))
            .call();
        board.polled(Local::now());

        let wait = match cycle {
            Ok(report) => {
                if report.pending > 0 {
                    info!("Processed {} of {} pending job(s)", report.outcomes.len(), report.pending);
                }
                board.set_printers(report.printers);
                board.record_outcomes(&report.outcomes);
                next_poll(settings)
            }
            Err(CycleError::Jobs { source: FirestoreError::InvalidToken }) => {
                board.disconnected();
                show_board(&board, &mut shown);
                bail!("The connection token no longer matches an account");
            }
            Err(e) => {
                if let CycleError::Printers { source } = &e {
                    board.set_printer_error(source.to_string());
                }
                failure_wait(settings, &e)
            }
        };

        show_board(&board, &mut shown);
        std::thread::sleep(wait);
    }
}

fn next_poll(settings: &Settings) -> Duration {
    match settings.polling.schedule.get_duration_till_next_occurrence() {
        Ok(wait) => wait,
        Err(e) => {
            error!("{}, falling back to {:?}", e, settings.polling.failure_wait);
            settings.polling.failure_wait
        }
    }
}

fn failure_wait(settings: &Settings, e: &CycleError) -> Duration {
    error!("{}", e);
    error!("Too many failures, waiting {:?} before retrying.", settings.polling.failure_wait);
    settings.polling.failure_wait
}

fn show_board(board: &StatusBoard, shown: &mut String) {
    let summary = board.summary();
    if *shown != summary {
        println!("{board}");
        *shown = summary;
    }
}
