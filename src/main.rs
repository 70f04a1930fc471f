use chat_relay::config::RelayConfig;
use chat_relay::logging::init_logging;
use chat_relay::relay::RelayState;
use chat_relay::server;
use chat_relay::session::{ChatSession, HttpTransport};
use chat_relay::terminal;
use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(
        long,
        global = true,
        default_value = "info",
        help = "Log level: error, warn, info, debug or trace"
    )]
    log_level: log::LevelFilter,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the chat relay and scoring endpoints
    Serve(ServeArgs),
    /// Chat with a running relay from the terminal
    Chat(ChatArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    #[arg(
        long,
        default_value = "127.0.0.1",
        help = "Host address to bind the server to"
    )]
    host: String,

    #[arg(long, default_value_t = 3000, help = "Port number to listen on")]
    port: u16,

    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: String,

    #[arg(long, env = "OPENAI_BASE_URL", default_value = "https://api.openai.com/v1")]
    openai_base_url: String,

    #[arg(long, default_value = "gpt-3.5-turbo", help = "Completion model")]
    model: String,

    #[arg(long, default_value_t = 0.7, help = "Sampling temperature for every turn")]
    temperature: f64,

    #[arg(
        long,
        env = "LITERAL_API_KEY",
        hide_env_values = true,
        help = "Telemetry API key; telemetry is disabled when unset"
    )]
    literal_api_key: Option<String>,

    #[arg(long, env = "LITERAL_API_URL", default_value = "https://cloud.getliteral.ai")]
    literal_url: String,

    #[arg(
        long,
        default_value = "chat-relay",
        help = "Participant identifier threads are attributed to"
    )]
    participant: String,

    #[arg(long, default_value_t = 600, help = "Upstream request timeout in seconds")]
    timeout: u64,
}

impl ServeArgs {
    fn into_config(self) -> RelayConfig {
        RelayConfig {
            host: self.host,
            port: self.port,
            openai_api_key: self.openai_api_key,
            openai_base_url: self.openai_base_url,
            model: self.model,
            temperature: self.temperature,
            literal_api_key: self.literal_api_key,
            literal_url: self.literal_url,
            participant: self.participant,
            timeout: self.timeout,
        }
    }
}

#[derive(Args, Debug)]
struct ChatArgs {
    #[arg(long, default_value = "http://127.0.0.1:3000", help = "Base URL of the relay")]
    relay_url: String,

    #[arg(long, help = "Ask for a single JSON reply instead of streamed text")]
    no_stream: bool,
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    match cli.command {
        Command::Serve(args) => {
            let config = args.into_config();
            let relay_state = RelayState::new(&config)?;
            server::startup(config, relay_state).await?;
        }
        Command::Chat(args) => {
            let transport = HttpTransport::new(reqwest::Client::new(), &args.relay_url);
            let mut session = ChatSession::new().with_streaming(!args.no_stream);
            println!("Thread {}. Type a message, /up N, /down N or /quit.", session.thread_id());
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            terminal::run(stdin, std::io::stdout(), &mut session, &transport).await?;
        }
    }
    Ok(())
}
