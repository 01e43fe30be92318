use clap::{Parser, Subcommand};
use relay_gateway::config;

#[derive(Parser, Debug)]
#[command(name = "relay-gateway")]
#[command(about = "Reverse proxy fronting a pool of Anthropic-style /v1/messages upstreams", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Emit logs as newline-delimited JSON instead of human-readable text.
    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the gateway and begin proxying requests.
    Serve,
    /// Config-related commands.
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Load the config file and report whether it parses.
    Validate,
    /// Load the config file and print it back as TOML.
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    relay_gateway::logging::init_tracing(cli.json_logs);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            let cfg = config::load_config().await?;
            relay_gateway::run(cfg).await?;
        }
        Command::Config { cmd } => run_config_command(cmd).await?,
    }

    Ok(())
}

async fn run_config_command(cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Validate => {
            let path = config::config_file_path();
            match config::load_config_sync(&path) {
                Ok(cfg) => {
                    println!(
                        "config at {} is valid ({} endpoint(s))",
                        path.display(),
                        cfg.endpoints.len()
                    );
                }
                Err(err) => {
                    eprintln!("config at {} is invalid: {err:#}", path.display());
                    std::process::exit(1);
                }
            }
        }
        ConfigCommand::Show => {
            let cfg = config::load_config().await?;
            println!("{}", toml::to_string_pretty(&cfg)?);
        }
    }
    Ok(())
}
