use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use nurture::config::{DEFAULT_BASE_URL, DEFAULT_LOGIN_URL};
use nurture::protocol::media_type_for;
use nurture::{
    ChatEvent, ChatRequest, ClientConfig, Credentials, ImageAttachment, NurtureClient, SendOutcome,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "nurture",
    version,
    about = "Chat and video analysis client for the Nurture backend"
)]
struct Cli {
    #[arg(long, env = "NURTURE_API_URL", default_value = DEFAULT_BASE_URL, global = true)]
    api_url: String,

    /// Where the access and refresh tokens are kept.
    #[arg(long, env = "NURTURE_CREDENTIALS", global = true)]
    credentials: Option<PathBuf>,

    #[arg(long, env = "NURTURE_LOGIN_URL", default_value = DEFAULT_LOGIN_URL, global = true)]
    login_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Store tokens issued by the backend.
    Login {
        #[arg(long, env = "NURTURE_ACCESS_TOKEN")]
        access_token: String,
        #[arg(long, env = "NURTURE_REFRESH_TOKEN")]
        refresh_token: Option<String>,
    },
    /// Forget stored tokens.
    Logout,
    /// Ask a question and print the answer as it streams in.
    Chat(ChatArgs),
    #[command(subcommand)]
    Conversations(ConversationCommand),
    #[command(subcommand)]
    Video(VideoCommand),
}

#[derive(Args)]
struct ChatArgs {
    message: String,

    #[arg(long, conflicts_with = "image_url")]
    image: Option<PathBuf>,

    #[arg(long)]
    image_url: Option<String>,

    /// Defaults to a guess from the file extension.
    #[arg(long)]
    image_mime: Option<String>,

    #[arg(long)]
    conversation: Option<String>,

    /// Send the stored messages of --conversation as history.
    #[arg(long, requires = "conversation")]
    with_history: bool,

    /// Print every chunk as a JSON line instead of its text.
    #[arg(long)]
    raw: bool,
}

#[derive(Subcommand)]
enum ConversationCommand {
    List,
    Create { title: String },
    Rename { id: String, title: String },
    Delete { id: String },
    Messages { id: String },
}

#[derive(Subcommand)]
enum VideoCommand {
    Upload {
        path: PathBuf,
        #[arg(long)]
        conversation: Option<String>,
    },
    Status {
        id: String,
    },
    /// Upload, transcribe and analyze, reporting progress on stderr.
    Process {
        path: PathBuf,
        #[arg(long)]
        conversation: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("nurture=info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::new(&cli.api_url).with_login_url(cli.login_url);
    if let Some(path) = cli.credentials {
        config = config.with_credentials_path(path);
    }
    let client = NurtureClient::new(config);

    match cli.command {
        Command::Login {
            access_token,
            refresh_token,
        } => {
            client.login(&Credentials::new(access_token, refresh_token))?;
            eprintln!(
                "credentials stored at {}",
                client.config().credentials_path.display()
            );
        }
        Command::Logout => client.logout()?,
        Command::Chat(args) => run_chat(&client, args).await?,
        Command::Conversations(command) => run_conversations(&client, command).await?,
        Command::Video(command) => run_video(&client, command).await?,
    }

    Ok(())
}

async fn run_chat(client: &NurtureClient, args: ChatArgs) -> Result<()> {
    let mut request = ChatRequest::new(args.message);

    if let Some(url) = args.image_url {
        let mime = args
            .image_mime
            .clone()
            .unwrap_or_else(|| media_type_for(Path::new(&url)).to_string());
        request = request.with_image_url(url, mime);
    } else if let Some(path) = args.image {
        let data = tokio::fs::read(&path)
            .await
            .with_context(|| format!("reading image {}", path.display()))?;
        request = request.with_image(ImageAttachment {
            data,
            file_name: path
                .file_name()
                .and_then(|name| name.to_str())
                .unwrap_or("image")
                .to_string(),
            mime_type: args
                .image_mime
                .unwrap_or_else(|| media_type_for(&path).to_string()),
        });
    }

    if let Some(id) = args.conversation {
        if args.with_history {
            request = request.with_history(client.conversations().history(&id).await?);
        }
        request = request.with_conversation(id);
    }

    let chat = Arc::clone(client.chat());
    let mut stream = chat.spawn_send(request);
    let mut stdout = std::io::stdout();
    let mut failure = None;

    loop {
        tokio::select! {
            event = stream.next() => match event {
                Some(ChatEvent::Chunk(chunk)) => {
                    if args.raw {
                        match &chunk {
                            nurture::Chunk::Json(value) => writeln!(stdout, "{}", value)?,
                            nurture::Chunk::Text(text) => {
                                writeln!(stdout, "{}", serde_json::Value::from(text.as_str()))?
                            }
                        }
                    } else if let Some(text) = chunk.text() {
                        write!(stdout, "{}", text)?;
                    }
                    stdout.flush()?;
                }
                Some(ChatEvent::Complete) => {
                    if !args.raw {
                        writeln!(stdout)?;
                    }
                }
                Some(ChatEvent::Error(err)) => failure = Some(err),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => chat.abort_stream(),
        }
    }

    if stream.outcome().await == SendOutcome::SessionExpired {
        bail!("session expired; run `nurture login` again");
    }
    if let Some(err) = failure {
        return Err(err.into());
    }
    Ok(())
}

async fn run_conversations(client: &NurtureClient, command: ConversationCommand) -> Result<()> {
    let conversations = client.conversations();
    match command {
        ConversationCommand::List => {
            for conversation in conversations.list().await? {
                println!("{}\t{}", conversation.id, conversation.title);
            }
        }
        ConversationCommand::Create { title } => {
            let conversation = conversations.create(&title).await?;
            println!("{}", conversation.id);
        }
        ConversationCommand::Rename { id, title } => {
            conversations.rename(&id, &title).await?;
        }
        ConversationCommand::Delete { id } => conversations.delete(&id).await?,
        ConversationCommand::Messages { id } => {
            for message in conversations.messages(&id).await? {
                println!("{}: {}", message.role, message.content);
            }
        }
    }
    Ok(())
}

async fn run_video(client: &NurtureClient, command: VideoCommand) -> Result<()> {
    let videos = client.videos();
    match command {
        VideoCommand::Upload { path, conversation } => {
            let upload = videos.upload(&path, conversation.as_deref()).await?;
            println!("{}", upload.video_id);
        }
        VideoCommand::Status { id } => {
            let status = videos.status(&id).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        VideoCommand::Process { path, conversation } => {
            let status = videos
                .process(&path, conversation.as_deref(), |status| {
                    match status.progress {
                        Some(progress) => eprintln!("{:?} {}%", status.status, progress),
                        None => eprintln!("{:?}", status.status),
                    }
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
    }
    Ok(())
}
