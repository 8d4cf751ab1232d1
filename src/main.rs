use attendface::{
    camera::CameraSource,
    common::{Config, DevMode, RegistrationError},
    core::{
        gate::{CaptureOutcome, FetchStatus, GateOutcome, GateParts, GateState, RegistrationGate},
        token, EmbeddingComparator,
    },
    service::{HttpBackend, ReferenceFetcher},
    storage::{FaceStore, ReferenceSlot},
};

use clap::{Parser, Subcommand};
use anyhow::Result;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser)]
#[command(name = "attendface")]
#[command(about = "Class attendance face registration")]
struct Cli {
    /// Enable development mode (saves data locally for testing)
    #[arg(long, global = true)]
    dev: bool,

    /// Path to the TOML config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a class token (teacher side)
    Encode {
        #[arg(short, long)]
        school_code: String,
        #[arg(short = 'n', long)]
        class_name: String,
    },
    /// Show what a class token contains
    Decode {
        token: String,
    },
    /// Register your face for a class
    Register {
        #[arg(short, long)]
        token: String,
        #[arg(short, long)]
        student_id: String,
        /// Directory relative model paths are resolved against
        #[arg(long, default_value = "./models")]
        models_dir: PathBuf,
    },
    /// Show the stored registration
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.dev);

    match cli.command {
        Commands::Encode { school_code, class_name } => {
            let token = token::encode(&school_code, &class_name)?;
            println!("{}", token);
        }
        Commands::Decode { token } => {
            let identity = token::decode(&token)?;
            println!("School code: {}", identity.school_code);
            println!("Class name:  {}", identity.class_name);
        }
        Commands::Register { token, student_id, models_dir } => {
            let config = load_config(cli.config.as_ref())?;
            let dev_mode = DevMode::new(cli.dev)?;
            register(&config, &dev_mode, &token, &student_id, &models_dir)?;
        }
        Commands::Status => {
            let config = load_config(cli.config.as_ref())?;
            let dev_mode = DevMode::new(cli.dev)?;
            let store = FaceStore::new_with_dev_mode(&config.storage.registered_face_path, &dev_mode);

            match store.load_record()? {
                Some(record) => {
                    let when = chrono::DateTime::<chrono::Utc>::from_timestamp(record.registered_at, 0)
                        .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
                        .unwrap_or_else(|| record.registered_at.to_string());
                    println!("Registered: student {} in {} / {}", record.student_id,
                             record.school_code, record.class_name);
                    println!("Image:      {} ({} bytes)", store.image_path().display(), record.image_len);
                    println!("When:       {}", when);
                }
                None => println!("No face registered yet."),
            }
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::load_from_path(path)?,
        None if PathBuf::from(attendface::common::config::DEFAULT_CONFIG_PATH).exists() => Config::load()?,
        None => {
            tracing::info!("No config file found, using defaults");
            Config::default()
        }
    };
    Ok(config)
}

fn register(config: &Config, dev_mode: &DevMode, class_token: &str, student_id: &str, models_dir: &PathBuf) -> Result<()> {
    let backend = HttpBackend::new(&config.backend).map_err(RegistrationError::from)?;
    let (reference_path, registered_path) = config.storage.resolve(dev_mode)?;
    let slot = ReferenceSlot::new(reference_path);

    let parts = GateParts {
        fetcher: ReferenceFetcher::new(Arc::new(backend), slot),
        capture: Box::new(CameraSource::new(&config.camera)),
        comparator: Box::new(EmbeddingComparator::new(&config.comparison, models_dir, dev_mode)?),
        sink: Box::new(FaceStore::new(registered_path)),
    };

    let mut gate = match RegistrationGate::new(class_token, student_id, parts) {
        Ok(gate) => gate,
        Err(e) => {
            eprintln!("❌ {}", e.user_message());
            return Err(e.into());
        }
    };

    println!("Registering student {} for {}", gate.student_id(), gate.identity());
    gate.begin()?;
    println!("Fetching your reference image in the background...");

    let stdin = io::stdin();
    let mut lines = stdin.lock().lines();

    loop {
        for notice in gate.pump() {
            println!("ℹ️  {}", notice.message());
        }
        if gate.state().is_terminal() {
            break;
        }

        print!("[c]apture  [a]dd face  [r]efetch  [q]uit > ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            gate.cancel();
            break;
        };

        match line?.trim() {
            "c" | "capture" => match gate.capture(CAPTURE_TIMEOUT) {
                Ok(CaptureOutcome::Captured { bytes }) => println!("📸 Picture taken ({} bytes)", bytes),
                Ok(CaptureOutcome::NoFrame) => println!("⚠️  The camera returned no picture. Try again."),
                Ok(CaptureOutcome::TimedOut) => println!("⚠️  The camera did not answer in time."),
                Err(e) => println!("❌ {}", e.user_message()),
            },
            "a" | "add" => {
                if *gate.fetch_status() == FetchStatus::InFlight {
                    println!("Waiting for the reference image...");
                    gate.wait_for_fetch(Duration::from_secs(config.backend.timeout_seconds));
                }
                match gate.commit() {
                    Ok(outcome @ GateOutcome::Registered) => println!("✅ {}", outcome.message()),
                    Ok(outcome) => println!("⚠️  {}", outcome.message()),
                    Err(RegistrationError::Persistence(e)) => {
                        println!("❌ {}", RegistrationError::Persistence(e).user_message());
                        retry_persist(&mut gate, &mut lines)?;
                    }
                    Err(e) => println!("❌ {}", e.user_message()),
                }
            }
            "r" | "refetch" => match gate.refetch() {
                Ok(()) => println!("Fetching your reference image again..."),
                Err(e) => println!("❌ {}", e.user_message()),
            },
            "q" | "quit" | "close" => gate.cancel(),
            "" => {}
            other => println!("Unknown command: {}", other),
        }
    }

    match gate.state() {
        GateState::Accepted { persisted: true } => Ok(()),
        GateState::Error(reason) => Err(anyhow::anyhow!("registration failed: {}", reason)),
        _ => {
            println!("Registration closed.");
            Ok(())
        }
    }
}

fn retry_persist<B: BufRead>(gate: &mut RegistrationGate, lines: &mut io::Lines<B>) -> Result<()> {
    while gate.state() == &(GateState::Accepted { persisted: false }) {
        print!("[s]ave again  [q]uit > ");
        io::stdout().flush()?;
        let Some(line) = lines.next() else {
            gate.cancel();
            break;
        };
        match line?.trim() {
            "s" | "save" => match gate.retry_persist() {
                Ok(outcome) => println!("✅ {}", outcome.message()),
                Err(e) => println!("❌ {}", e.user_message()),
            },
            "q" | "quit" => gate.cancel(),
            _ => {}
        }
    }
    Ok(())
}

fn setup_logging(dev_mode: bool) {
    if dev_mode {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }
}
