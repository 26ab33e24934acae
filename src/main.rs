use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use std::path::PathBuf;

mod commands;

/// ugcmount - mount, update and retire user-generated content packages
#[derive(Parser)]
#[command(name = "ugcmount")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Log at debug level (RUST_LOG overrides)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check an archive without mounting it
    Validate {
        /// Path to the archive
        archive: PathBuf,

        /// Content id (defaults to the manifest's, then the file name)
        #[arg(long)]
        id: Option<String>,

        /// Expected checksum (sha256:<hex>)
        #[arg(long)]
        checksum: Option<String>,
    },

    /// Validate and mount a package
    Install {
        /// Path to the archive
        archive: PathBuf,

        /// Content id (defaults to the manifest's, then the file name)
        #[arg(long)]
        id: Option<String>,

        /// Expected checksum (sha256:<hex>)
        #[arg(long)]
        checksum: Option<String>,
    },

    /// Replace a mounted package with a newer archive
    Update {
        /// Path to the new archive
        archive: PathBuf,

        /// Content id (defaults to the manifest's, then the file name)
        #[arg(long)]
        id: Option<String>,

        /// Expected checksum (sha256:<hex>)
        #[arg(long)]
        checksum: Option<String>,
    },

    /// Unmount a package and drop its assets
    Uninstall {
        /// Content id
        id: String,
    },

    /// Unmount a package but remember it so it can be enabled again
    Disable {
        /// Content id
        id: String,
    },

    /// Mount a disabled package again
    Enable {
        /// Content id
        id: String,
    },

    /// Uninstall every package
    Unload,

    /// List mounted packages
    List {
        /// Also print every asset a package owns
        #[arg(long)]
        assets: bool,
    },

    /// Mount, update and retire packages to match a side-load directory
    Sync {
        /// Directory to scan (defaults to sideload.directory)
        #[arg(long)]
        dir: Option<PathBuf>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,

    /// Print a single configuration value
    Get {
        /// Configuration key (e.g., namespace.root)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., timeouts.mount_secs)
        key: String,
        /// Configuration value (empty clears optional keys)
        value: String,
    },

    /// Print the config file location
    Path,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    ugcmount::init_logging(cli.verbose);

    let result = match cli.command {
        Commands::Validate {
            archive,
            id,
            checksum,
        } => commands::validate::run(archive, id, checksum),
        Commands::Install {
            archive,
            id,
            checksum,
        } => commands::install::run(archive, id, checksum).await,
        Commands::Update {
            archive,
            id,
            checksum,
        } => commands::update::run(archive, id, checksum).await,
        Commands::Uninstall { id } => commands::uninstall::run(id).await,
        Commands::Disable { id } => commands::enable::run(id, false).await,
        Commands::Enable { id } => commands::enable::run(id, true).await,
        Commands::Unload => commands::unload::run().await,
        Commands::List { assets } => commands::list::run(assets).await,
        Commands::Sync { dir } => commands::sync::run(dir).await,
        Commands::Config { action } => commands::config::run(&action),
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "ugcmount", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
