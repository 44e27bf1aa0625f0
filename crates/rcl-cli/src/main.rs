mod commands;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use commands::{StoreOptions, EXIT_FAILURE, EXIT_MANIFEST_ERROR, EXIT_STORE_ERROR};
use rcl_core::install_signal_handler;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "rcl",
    version,
    about = "Crash-consistent layered root filesystem builder for OCI images"
)]
struct Cli {
    /// Path to the store directory.
    #[arg(long, default_value = "~/.local/share/rcl", global = true)]
    root: String,

    /// Snapshotter to use instead of the one in the store config (native or overlay).
    #[arg(long, global = true)]
    snapshotter: Option<String>,

    /// Target platform, e.g. linux/arm64/v8. Defaults to the store config, then the host.
    #[arg(long, global = true)]
    platform: Option<String>,

    /// Output results as structured JSON.
    #[arg(long, default_value_t = false, global = true)]
    json: bool,

    /// Enable verbose (debug) logging output.
    #[arg(short, long, default_value_t = false, global = true)]
    verbose: bool,

    /// Enable trace-level logging (more detailed than --verbose).
    #[arg(long, default_value_t = false, global = true)]
    trace: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import images from an OCI image layout directory.
    Import {
        /// Directory holding `oci-layout`, `index.json` and `blobs/`.
        dir: PathBuf,
        /// Catalogue the whole layout under this name instead of its ref annotations.
        #[arg(long)]
        name: Option<String>,
    },
    /// Unpack an image's layers into snapshots.
    Unpack {
        /// Image name.
        image: String,
        /// Refuse images whose config platform the target does not accept.
        #[arg(long, default_value_t = false)]
        check_platform: bool,
    },
    /// Show whether an image is unpacked and where its rootfs lives.
    Status {
        /// Image name.
        image: String,
    },
    /// List catalogued images.
    Images,
    /// List snapshots.
    Snapshots,
    /// Remove a snapshot.
    Rm {
        /// Snapshot key (a chain ID for committed snapshots).
        key: String,
    },
    /// Remove an image from the catalogue. Its content is reclaimed by gc.
    Rmi {
        /// Image name.
        image: String,
    },
    /// Run garbage collection on the store.
    Gc {
        /// Only report what would be removed.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Verify store integrity.
    VerifyStore,
    /// Roll back builds abandoned by crashed processes.
    Recover,
    /// Generate shell completions for bash, zsh, fish, elvish, or powershell.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let msg = info.to_string();
        if msg.contains("Broken pipe")
            || msg.contains("broken pipe")
            || msg.contains("os error 32")
            || msg.contains("failed printing to stdout")
        {
            std::process::exit(0);
        }
        default_hook(info);
    }));

    let cli = Cli::parse();

    let default_level = if cli.trace {
        "trace"
    } else if cli.verbose {
        "debug"
    } else {
        "warn"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("RCL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .init();

    install_signal_handler();

    let opts = StoreOptions {
        root: expand_tilde(&cli.root),
        snapshotter: cli.snapshotter,
        platform: cli.platform,
    };
    let json = cli.json;

    let result = match cli.command {
        Commands::Import { dir, name } => {
            commands::import::run(&opts, &dir, name.as_deref(), json)
        }
        Commands::Unpack {
            image,
            check_platform,
        } => commands::unpack::run(&opts, &image, check_platform, json),
        Commands::Status { image } => commands::status::run(&opts, &image, json),
        Commands::Images => commands::images::run(&opts, json),
        Commands::Snapshots => commands::snapshots::run(&opts, json),
        Commands::Rm { key } => commands::rm::run(&opts, &key, json),
        Commands::Rmi { image } => commands::rmi::run(&opts, &image, json),
        Commands::Gc { dry_run } => commands::gc::run(&opts, dry_run, json),
        Commands::VerifyStore => commands::verify_store::run(&opts, json),
        Commands::Recover => commands::recover::run(&opts, json),
        Commands::Completions { shell } => commands::completions::run::<Cli>(shell),
    };

    match result {
        Ok(code) => ExitCode::from(code),
        Err(msg) => {
            eprintln!("error: {msg}");
            let code = if msg.starts_with("manifest error:")
                || msg.starts_with("failed to parse manifest")
            {
                EXIT_MANIFEST_ERROR
            } else if msg.starts_with("store error:") || msg.starts_with("store lock:") {
                EXIT_STORE_ERROR
            } else {
                EXIT_FAILURE
            };
            ExitCode::from(code)
        }
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    PathBuf::from(path)
}
