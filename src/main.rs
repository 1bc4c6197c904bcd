use anyhow::{anyhow, Result};
use clap::Parser;
use log::{debug, error, info, warn, LevelFilter};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

mod utils;

use xchat::clock::SystemClock;
use xchat::config::{load_config, ClientConfig};
use xchat::models::{Identity, Message, MessageKind};
use xchat::store::{to_fields, AuthUser, DocPath, MemoryStore, StaticAuth, Store};
use xchat::sync::{
    ChatDirectory, ChatFocus, ConversationSummary, DeliveryTracker, MessageStream, Session, Subscription,
    SyncEvent, TypingSignal, Visibility, USERS,
};

const WRAP_WIDTH: usize = 72;

/// Command line arguments for xchat
#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "xchat: terminal driver for the chat client core",
    long_about = "Runs the chat client against an in-process store.\n\n\
    Commands: /chats, /new <uid>, /open <chatId>, /as <uid>, /typing, /search <term>, /help, /quit.\n\
    Any other line is sent to the open conversation."
)]
struct Args {
    /// Configuration file (defaults to XCHAT_CONFIG, then the user config dir)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write logs here instead of stdout
    #[arg(long, value_name = "PATH")]
    log_file: Option<PathBuf>,

    /// Account to sign in as
    #[arg(long, default_value = "amy")]
    user: String,

    /// Create a few demo accounts first
    #[arg(long)]
    seed: bool,
}

enum FocusEvent {
    Messages(SyncEvent<Vec<Message>>),
    Typing(SyncEvent<Vec<String>>),
}

/// Everything bound to the signed-in account
struct App {
    session: Arc<Session>,
    directory: ChatDirectory,
    stream: MessageStream,
    tracker: DeliveryTracker,
    typing: TypingSignal,
    focus: ChatFocus,
    chats: Subscription<Vec<ConversationSummary>>,
    latest_chats: Vec<ConversationSummary>,
    names: HashMap<String, String>,
    printed: HashSet<String>,
    typing_raised: bool,
}

impl App {
    async fn sign_in(store: Arc<MemoryStore>, config: &ClientConfig, uid: &str) -> Result<App> {
        let auth = Arc::new(StaticAuth::signed_in(AuthUser::new(uid, &format!("{}@example.com", uid))));
        let session = Session::new(store, auth, Arc::new(SystemClock), config.clone());
        let identity = session
            .bootstrap()
            .await?
            .ok_or_else(|| anyhow!("Sign-in for {} did not produce an identity", uid))?;
        println!("Signed in as {} ({})", identity.display_name, identity.uid);

        let directory = ChatDirectory::new(session.clone());
        let chats = directory.subscribe()?;
        let mut names = HashMap::new();
        names.insert(identity.uid.clone(), identity.display_name.clone());

        Ok(App {
            stream: MessageStream::new(session.clone()),
            tracker: DeliveryTracker::new(session.clone()),
            typing: TypingSignal::new(session.clone()),
            focus: ChatFocus::new(session.clone()),
            session,
            directory,
            chats,
            latest_chats: Vec::new(),
            names,
            printed: HashSet::new(),
            typing_raised: false,
        })
    }

    async fn name_of(&mut self, uid: &str) -> String {
        if let Some(name) = self.names.get(uid) {
            return name.clone();
        }
        let name = match self.directory.profiles(&[uid.to_string()]).await {
            Ok(profiles) => profiles
                .into_iter()
                .next()
                .map(|p| p.display_name)
                .unwrap_or_else(|| uid.to_string()),
            Err(e) => {
                debug!("Profile lookup for {} failed: {}", uid, e);
                uid.to_string()
            }
        };
        self.names.insert(uid.to_string(), name.clone());
        name
    }

    async fn print_chats(&mut self) {
        if self.latest_chats.is_empty() {
            println!("No conversations yet. Start one with /new <uid>.");
            return;
        }
        let chats = self.latest_chats.clone();
        for summary in &chats {
            let mut names = Vec::new();
            for uid in &summary.others {
                names.push(self.name_of(uid).await);
            }
            println!("{}", utils::format_summary(summary, &names));
        }
    }

    async fn on_messages(&mut self, messages: Vec<Message>) {
        let conversation_id = match self.focus.conversation_id() {
            Some(id) => id.to_string(),
            None => return,
        };
        for message in &messages {
            if !self.printed.insert(message.id.clone()) {
                continue;
            }
            let sender = self.name_of(&message.sender_id).await;
            match self.stream.view(message.clone()) {
                Ok(view) => println!("{}", utils::format_message(&view, &sender, WRAP_WIDTH)),
                Err(e) => warn!("Cannot render message {}: {}", message.id, e),
            }
        }
        // The conversation is on screen, so everything in it counts as seen
        if let Err(e) = self
            .tracker
            .acknowledge(&conversation_id, &messages, Visibility::Visible)
            .await
        {
            warn!("Could not acknowledge messages in {}: {}", conversation_id, e);
        }
    }

    async fn open(&mut self, conversation_id: &str) -> Result<()> {
        self.printed.clear();
        self.typing_raised = false;
        self.focus.select(conversation_id).await?;
        println!("Opened {}", conversation_id);
        Ok(())
    }

    /// Returns false when the user asked to quit.
    async fn handle_line(&mut self, line: &str) -> Result<bool> {
        if line.is_empty() {
            return Ok(true);
        }
        let (command, rest) = match line.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (line, ""),
        };

        match command {
            "/quit" | "/exit" => return Ok(false),
            "/help" => println!(
                "/chats  /new <uid>  /open <chatId>  /as <uid>  /typing  /search <term>  /quit"
            ),
            "/chats" => self.print_chats().await,
            "/new" => {
                if rest.is_empty() {
                    println!("Usage: /new <uid>");
                    return Ok(true);
                }
                let id = match self.directory.find_direct(rest).await? {
                    Some(existing) => existing.id,
                    None => self.directory.create_conversation(&[rest]).await?,
                };
                self.open(&id).await?;
            }
            "/open" => {
                if rest.is_empty() {
                    println!("Usage: /open <chatId>");
                    return Ok(true);
                }
                self.open(rest).await?;
            }
            "/search" => {
                let found = self.directory.search_users(rest).await?;
                if found.is_empty() {
                    println!("No users match {:?}", rest);
                }
                for identity in found {
                    println!("{}  {} <{}>", identity.uid, identity.display_name, identity.email);
                }
            }
            "/typing" => match self.focus.conversation_id().map(str::to_string) {
                Some(id) => {
                    self.typing_raised = !self.typing_raised;
                    self.typing.set_typing(&id, self.typing_raised).await?;
                    println!("Typing {}", if self.typing_raised { "on" } else { "off" });
                }
                None => println!("Open a conversation first"),
            },
            _ if command.starts_with('/') => println!("Unknown command {}. Try /help.", command),
            _ => match self.focus.conversation_id().map(str::to_string) {
                Some(id) => {
                    self.stream.send(&id, line, MessageKind::Text).await?;
                    if self.typing_raised {
                        self.typing_raised = false;
                        self.typing.set_typing(&id, false).await?;
                    }
                }
                None => println!("Open a conversation first (/chats, /open <chatId>)"),
            },
        }
        Ok(true)
    }

    async fn sign_out(mut self) {
        self.focus.clear().await;
        self.chats.cancel();
        if let Err(e) = self.session.sign_out().await {
            warn!("Sign-out failed: {}", e);
        }
    }
}

async fn next_focus_event(focus: &mut ChatFocus) -> Option<FocusEvent> {
    match focus.current_mut() {
        Some(chat) => tokio::select! {
            Some(event) = chat.messages.next() => Some(FocusEvent::Messages(event)),
            Some(event) = chat.typing.next() => Some(FocusEvent::Typing(event)),
            else => None,
        },
        None => std::future::pending().await,
    }
}

async fn seed_accounts(store: &MemoryStore) -> Result<()> {
    let now = chrono::Utc::now();
    for (uid, name) in [("amy", "Amy"), ("bob", "Bob"), ("carol", "Carol")] {
        let user = AuthUser::new(uid, &format!("{}@example.com", uid)).with_display_name(name);
        let mut identity = Identity::provisional(&user, "desktop", now);
        identity.online_status = false;
        identity.status = "offline".to_string();
        let path = DocPath::new(USERS, uid);
        store.put(&path, to_fields(&path, &identity)?).await?;
    }
    info!("Seeded demo accounts");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_file = args.log_file.as_ref().and_then(|p| p.to_str());
    utils::setup_logging(log_file, LevelFilter::Info)?;
    info!("System information: {} {}", std::env::consts::OS, std::env::consts::ARCH);

    let config = load_config(args.config.as_deref())?;
    if !config.endpoint.starts_with("memory://") {
        warn!(
            "Endpoint {} is not reachable from this build; using the in-process store",
            config.endpoint
        );
    }

    let store = Arc::new(MemoryStore::new());
    if args.seed {
        seed_accounts(&store).await?;
    }

    let mut app = App::sign_in(store.clone(), &config, &args.user).await?;
    println!("Type /help for commands.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line? {
                    Some(line) => line,
                    None => break,
                };
                let line = line.trim();
                if let Some(uid) = line.strip_prefix("/as ") {
                    let uid = uid.trim();
                    match App::sign_in(store.clone(), &config, uid).await {
                        Ok(next) => {
                            let previous = std::mem::replace(&mut app, next);
                            previous.sign_out().await;
                        }
                        Err(e) => println!("Could not switch to {}: {}", uid, e),
                    }
                    continue;
                }
                match app.handle_line(line).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => {
                        error!("Command {:?} failed: {}", line, e);
                        println!("Error: {}", e);
                    }
                }
            }
            Some(event) = app.chats.next() => match event {
                SyncEvent::Snapshot(chats) => {
                    debug!("Conversation list now has {} entries", chats.len());
                    app.latest_chats = chats;
                }
                SyncEvent::Reconnecting { attempt, retry_in } => {
                    println!("Connection lost, retrying in {:?} (attempt {})", retry_in, attempt);
                }
            },
            Some(event) = next_focus_event(&mut app.focus) => match event {
                FocusEvent::Messages(SyncEvent::Snapshot(messages)) => app.on_messages(messages).await,
                FocusEvent::Typing(SyncEvent::Snapshot(typing)) if !typing.is_empty() => {
                    let mut names = Vec::new();
                    for uid in &typing {
                        names.push(app.name_of(uid).await);
                    }
                    println!("{} typing...", names.join(", "));
                }
                FocusEvent::Typing(SyncEvent::Snapshot(_)) => {}
                FocusEvent::Messages(SyncEvent::Reconnecting { attempt, .. })
                | FocusEvent::Typing(SyncEvent::Reconnecting { attempt, .. }) => {
                    debug!("Conversation feed reconnecting (attempt {})", attempt);
                }
            },
        }
    }

    app.sign_out().await;
    info!("xchat shutting down");
    Ok(())
}
