use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "larkgpt")]
#[command(about = "Lark webhook to ChatGPT relay bot", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Write a default config file to edit before serving.
    Init {
        /// Config file path (default: LARKGPT_CONFIG_PATH or ~/.larkgpt/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the webhook server and relay messages to the ChatGPT backend.
    Serve {
        /// Config file path (default: LARKGPT_CONFIG_PATH or ~/.larkgpt/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Webhook port (default from config or 9999)
        #[arg(long, short)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("larkgpt {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Serve { config, port }) => {
            if let Err(e) = run_serve(config, port).await {
                log::error!("serve failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    lib::config::write_default_config(&path)?;
    println!("initialized configuration at {}", path.display());
    println!(
        "fill in bot.name, lark.appId, lark.appSecret, chatgpt.host and chatgpt.token before `larkgpt serve`"
    );
    Ok(())
}

async fn run_serve(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = lib::config::load_config(config_path)?;
    log::debug!("loaded config from {}", path.display());
    if let Some(p) = port {
        config.server.port = p;
    }
    log::info!(
        "starting webhook server on {}:{}",
        config.server.bind,
        config.server.port
    );
    lib::server::run_server(config).await
}
