use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "burrow")]
#[command(about = "Moves files and other data over WebRTC", long_about = None)]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Signalling server to use
    #[arg(long, global = true, env = "SIGSERV")]
    signal: Option<String>,

    /// Bearer token for the signalling server
    #[arg(long, global = true, env = "BEARER")]
    bearer: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one or more files
    Send {
        /// Paths of the files to send
        #[arg(required = true)]
        files: Vec<String>,
        /// Use a wormhole code instead of generating one
        #[arg(long)]
        code: Option<String>,
        /// Length of generated secret in bytes
        #[arg(long, default_value_t = 2)]
        length: usize,
        /// Attempts before giving up
        #[arg(long, default_value_t = 1)]
        retry_times: u32,
    },
    /// Receive files
    Receive {
        /// Wormhole code shown by the sender (omit to create one)
        code: Option<String>,
        /// Directory to put downloaded files
        #[arg(short, long, default_value = ".")]
        dir: String,
        /// Length of generated secret in bytes, if generating
        #[arg(long, default_value_t = 2)]
        length: usize,
        /// Resume database path (empty string disables resume state)
        #[arg(long, default_value = "burrow.db")]
        db: String,
        /// Attempts before giving up
        #[arg(long, default_value_t = 1)]
        retry_times: u32,
    },
    /// Netcat-like pipe between two computers
    Pipe {
        /// Wormhole code of the other end (omit to create one)
        code: Option<String>,
        /// Length of generated secret in bytes, if generating
        #[arg(long, default_value_t = 2)]
        length: usize,
    },
    /// Run the signalling server
    Serve {
        /// HTTP listen address
        #[arg(long, default_value = "0.0.0.0:8000")]
        http: String,
        /// Comma separated list of STUN servers to tell clients to use
        #[arg(long, default_value = "stun2.l.google.com:19302")]
        stun: String,
        /// TURN server to use for relaying
        #[arg(long, default_value = "")]
        turn: String,
        /// TURN credentials, as user:password
        #[arg(long, default_value = "")]
        turn_user: String,
        /// Maximum time a client is allowed to hold a slot
        #[arg(long, default_value = "12h")]
        slot_timeout: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Configure logging based on verbose flag
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
        log::info!("Verbose logging enabled");
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    let sigserv = cli.signal.unwrap_or_default();
    let bearer = cli.bearer.unwrap_or_default();

    let result = match cli.command {
        Commands::Send {
            files,
            code,
            length,
            retry_times,
        } => {
            burrow::commands::send::run(
                files,
                code.unwrap_or_default(),
                length,
                retry_times,
                bearer,
                sigserv,
            )
            .await
        }
        Commands::Receive {
            code,
            dir,
            length,
            db,
            retry_times,
        } => {
            burrow::commands::receive::run(
                code.unwrap_or_default(),
                dir,
                length,
                retry_times,
                db,
                bearer,
                sigserv,
            )
            .await
        }
        Commands::Pipe { code, length } => {
            burrow::commands::pipe::run(code.unwrap_or_default(), length, bearer, sigserv).await
        }
        Commands::Serve {
            http,
            stun,
            turn,
            turn_user,
            slot_timeout,
        } => burrow::commands::serve::run(http, stun, turn, turn_user, bearer, slot_timeout).await,
    };

    if let Err(e) = result {
        log::error!("{}", e);
        std::process::exit(1);
    }
}
