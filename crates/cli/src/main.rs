use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use feed_sync::feed_model::{CommentId, Post, PostId, UserId, UserSummary};
use feed_sync::{
    EventType, FeedConfig, FeedSession, FileStore, HttpGateway, KeyValueStore, PostDraft,
    SessionStore, Toggle,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "feed-cli")]
#[command(about = "Feed client CLI - drive a live feed session from the terminal")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Backend REST base URL
    #[arg(long, global = true, env = "FEED_API_URL")]
    api_url: Option<String>,

    /// Push channel WebSocket URL
    #[arg(long, global = true, env = "FEED_CHANNEL_URL")]
    channel_url: Option<String>,

    /// Local data directory (session, viewed posts)
    #[arg(long, global = true, env = "FEED_DATA_DIR")]
    data_dir: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Log in and store the session locally
    Login {
        username: String,

        #[arg(short, long)]
        password: String,
    },

    /// Create an account and log in
    Register {
        username: String,

        #[arg(short, long)]
        password: String,

        /// Public display name
        #[arg(long)]
        pseudoname: Option<String>,
    },

    /// Forget the stored session
    Logout,

    /// Print the feed
    Posts {
        /// Number of pages to load
        #[arg(long, default_value = "1")]
        pages: usize,

        /// Print raw JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Publish a post
    Post {
        content: String,

        /// Attach an image by URL (repeatable)
        #[arg(long = "image")]
        images: Vec<String>,
    },

    /// Delete one of your posts
    DeletePost { post_id: String },

    /// Toggle your like on a post
    Like { post_id: String },

    /// Toggle following a user
    Follow { user_id: String },

    /// List comments on a post
    Comments { post_id: String },

    /// Comment on a post
    Comment { post_id: String, content: String },

    /// Delete one of your comments
    DeleteComment { comment_id: String },

    /// Record a view of a post (once per device)
    View { post_id: String },

    /// List users and whether you follow them
    Users,

    /// Stay connected and print live events until interrupted
    Tail {
        /// Also show who is typing on this post
        #[arg(long)]
        post: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.verbose {
        "feed_cli=debug,feed_sync=debug"
    } else {
        "feed_cli=info,feed_sync=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = FeedConfig::from_env()?;
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }
    if let Some(url) = cli.channel_url {
        config.channel_url = url;
    }
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    config.validate()?;
    let storage: Arc<dyn KeyValueStore> = Arc::new(FileStore::new(&config.data_dir));

    match cli.command {
        Commands::Login { username, password } => {
            login_command(&config, storage, &username, &password).await
        }
        Commands::Register {
            username,
            password,
            pseudoname,
        } => register_command(&config, storage, &username, pseudoname.as_deref(), &password).await,
        Commands::Logout => logout_command(&config, storage),
        Commands::Posts { pages, json } => posts_command(config, storage, pages, json).await,
        Commands::Post { content, images } => post_command(config, storage, content, images).await,
        Commands::DeletePost { post_id } => delete_post_command(config, storage, post_id).await,
        Commands::Like { post_id } => like_command(config, storage, post_id).await,
        Commands::Follow { user_id } => follow_command(config, storage, user_id).await,
        Commands::Comments { post_id } => comments_command(config, storage, post_id).await,
        Commands::Comment { post_id, content } => {
            comment_command(config, storage, post_id, content).await
        }
        Commands::DeleteComment { comment_id } => {
            delete_comment_command(config, storage, comment_id).await
        }
        Commands::View { post_id } => view_command(config, storage, post_id).await,
        Commands::Users => users_command(config, storage).await,
        Commands::Tail { post } => tail_command(config, storage, post).await,
    }
}

async fn login_command(
    config: &FeedConfig,
    storage: Arc<dyn KeyValueStore>,
    username: &str,
    password: &str,
) -> Result<()> {
    let gateway = HttpGateway::new(config, SessionStore::new(storage))?;
    let auth = gateway.login(username, password).await?;
    info!("Logged in as {} ({})", auth.user.label(), auth.user.id);
    Ok(())
}

async fn register_command(
    config: &FeedConfig,
    storage: Arc<dyn KeyValueStore>,
    username: &str,
    pseudoname: Option<&str>,
    password: &str,
) -> Result<()> {
    let gateway = HttpGateway::new(config, SessionStore::new(storage))?;
    let auth = gateway.register(username, pseudoname, password).await?;
    info!("Registered and logged in as {}", auth.user.label());
    Ok(())
}

fn logout_command(config: &FeedConfig, storage: Arc<dyn KeyValueStore>) -> Result<()> {
    let gateway = HttpGateway::new(config, SessionStore::new(storage))?;
    gateway.logout()?;
    info!("Session cleared");
    Ok(())
}

/// Session for the stored login. The actor comes from the saved session,
/// falling back to asking the backend.
async fn open_session(config: FeedConfig, storage: Arc<dyn KeyValueStore>) -> Result<FeedSession> {
    let tokens = SessionStore::new(storage.clone())
        .load()?
        .ok_or_else(|| anyhow!("not logged in; run `feed-cli login` first"))?;

    let actor: UserSummary = match tokens.user {
        Some(user) => user,
        None => {
            let gateway = HttpGateway::new(&config, SessionStore::new(storage.clone()))?;
            gateway
                .current_user()
                .await
                .context("failed to resolve the logged in user")?
        }
    };

    Ok(FeedSession::with_http(config, actor, storage)?)
}

fn format_time(time: Option<DateTime<Utc>>) -> String {
    time.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn print_post(post: &Post) {
    let author = post
        .user
        .as_ref()
        .map(|u| u.label().to_string())
        .unwrap_or_else(|| "User".to_string());
    let heart = if post.is_liked() { "♥" } else { "♡" };
    println!(
        "{}  {}  {}",
        post.id,
        author,
        format_time(post.created_at)
    );
    println!("    {}", post.content);
    println!(
        "    {} {}  comments {}  views {}",
        heart,
        post.counts.likes.value(),
        post.counts.comments.value(),
        post.counts.views.value()
    );
}

async fn posts_command(
    config: FeedConfig,
    storage: Arc<dyn KeyValueStore>,
    pages: usize,
    json: bool,
) -> Result<()> {
    let session = open_session(config, storage).await?;

    for _ in 0..pages.max(1) {
        let page = session.load_next_posts().await?;
        info!("Loaded {} posts", page.inserted);
        if !page.has_more {
            break;
        }
    }

    let posts = session.posts();
    if json {
        println!("{}", serde_json::to_string_pretty(&posts)?);
    } else if posts.is_empty() {
        println!("No posts yet.");
    } else {
        for post in &posts {
            print_post(post);
        }
    }
    Ok(())
}

async fn post_command(
    config: FeedConfig,
    storage: Arc<dyn KeyValueStore>,
    content: String,
    images: Vec<String>,
) -> Result<()> {
    let session = open_session(config, storage).await?;
    let draft = images
        .into_iter()
        .fold(PostDraft::new(content), |draft, url| draft.with_image(url));
    let post = session.create_post(&draft).await?;
    info!("Published post {}", post.id);
    print_post(&post);
    Ok(())
}

async fn delete_post_command(
    config: FeedConfig,
    storage: Arc<dyn KeyValueStore>,
    post_id: String,
) -> Result<()> {
    let session = open_session(config, storage).await?;
    session.delete_post(&PostId::from(post_id.as_str())).await?;
    info!("Deleted post {}", post_id);
    Ok(())
}

async fn like_command(
    config: FeedConfig,
    storage: Arc<dyn KeyValueStore>,
    post_id: String,
) -> Result<()> {
    let session = open_session(config, storage).await?;
    let post_id = PostId::from(post_id.as_str());

    // The toggle needs the post in the store to predict against.
    let mut page = session.load_next_posts().await?;
    while session.post(&post_id).is_none() && page.has_more {
        page = session.load_next_posts().await?;
    }
    if session.post(&post_id).is_none() {
        return Err(anyhow!("post {} is not in the feed", post_id));
    }

    match session.toggle_like(&post_id).await? {
        Toggle::Confirmed(true) => info!("Liked {}", post_id),
        Toggle::Confirmed(false) => info!("Unliked {}", post_id),
        Toggle::Ignored => warn!("A like for {} is already in flight", post_id),
    }
    if let Some(post) = session.post(&post_id) {
        print_post(&post);
    }
    Ok(())
}

async fn follow_command(
    config: FeedConfig,
    storage: Arc<dyn KeyValueStore>,
    user_id: String,
) -> Result<()> {
    let session = open_session(config, storage).await?;
    let user_id = UserId::from(user_id.as_str());

    let mut page = session.load_users().await?;
    while session.user(&user_id).is_none() && page.has_more {
        page = session.load_users().await?;
    }
    if session.user(&user_id).is_none() {
        return Err(anyhow!("user {} is not in the directory", user_id));
    }

    match session.toggle_follow(&user_id).await? {
        Toggle::Confirmed(true) => info!("Following {}", user_id),
        Toggle::Confirmed(false) => info!("Unfollowed {}", user_id),
        Toggle::Ignored => warn!("A follow for {} is already in flight", user_id),
    }
    Ok(())
}

async fn comments_command(
    config: FeedConfig,
    storage: Arc<dyn KeyValueStore>,
    post_id: String,
) -> Result<()> {
    let session = open_session(config, storage).await?;
    let post_id = PostId::from(post_id.as_str());

    loop {
        let page = session.load_comments(&post_id).await?;
        if !page.has_more {
            break;
        }
    }

    let comments = session.comments(&post_id);
    if comments.is_empty() {
        println!("No comments yet.");
    }
    for comment in comments {
        let author = comment
            .user
            .as_ref()
            .map(|u| u.label().to_string())
            .unwrap_or_else(|| "User".to_string());
        println!(
            "{}  {}  {}: {}",
            comment.id,
            format_time(comment.created_at),
            author,
            comment.content
        );
    }
    Ok(())
}

async fn comment_command(
    config: FeedConfig,
    storage: Arc<dyn KeyValueStore>,
    post_id: String,
    content: String,
) -> Result<()> {
    let session = open_session(config, storage).await?;
    let post_id = PostId::from(post_id.as_str());

    match session.create_comment(&post_id, &content).await? {
        Some(comment) => info!("Commented on {} ({})", post_id, comment.id),
        None => warn!("A comment on {} is already in flight", post_id),
    }
    Ok(())
}

async fn delete_comment_command(
    config: FeedConfig,
    storage: Arc<dyn KeyValueStore>,
    comment_id: String,
) -> Result<()> {
    let session = open_session(config, storage).await?;
    session
        .delete_comment(&CommentId::from(comment_id.as_str()))
        .await?;
    info!("Deleted comment {}", comment_id);
    Ok(())
}

async fn view_command(
    config: FeedConfig,
    storage: Arc<dyn KeyValueStore>,
    post_id: String,
) -> Result<()> {
    let session = open_session(config, storage).await?;
    let post_id = PostId::from(post_id.as_str());

    if session.record_view(&post_id).await? {
        info!("View recorded for {}", post_id);
    } else {
        info!("Already viewed {}", post_id);
    }
    Ok(())
}

async fn users_command(config: FeedConfig, storage: Arc<dyn KeyValueStore>) -> Result<()> {
    let session = open_session(config, storage).await?;

    loop {
        let page = session.load_users().await?;
        if !page.has_more {
            break;
        }
    }

    let users = session.read(|state| state.store.users.items().to_vec());
    for user in users {
        let marker = if user.is_followed() { "*" } else { " " };
        println!(
            "{} {}  {}  followers {}  following {}",
            marker,
            user.id,
            user.summary().label(),
            user.counts.followers.value(),
            user.counts.following.value()
        );
    }
    Ok(())
}

async fn tail_command(
    config: FeedConfig,
    storage: Arc<dyn KeyValueStore>,
    post: Option<String>,
) -> Result<()> {
    let session = open_session(config, storage).await?;
    session.load_next_posts().await?;

    for event_type in EventType::ALL {
        session.channel().subscribe(event_type, |event| {
            info!("{} from {}", event.event_type(), event.target());
        });
    }
    session.start()?;
    info!("Listening for events; press Ctrl-C to stop");

    let watched = post.map(|id| PostId::from(id.as_str()));
    let mut ticker = tokio::time::interval(session.config().settle_window);
    let mut last_typing: Vec<String> = Vec::new();
    let mut last_unread = session.unread_count();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                if let Some(post_id) = &watched {
                    let typing = session.typing_labels(post_id);
                    if typing != last_typing {
                        if typing.is_empty() {
                            println!("(nobody is typing)");
                        } else {
                            println!("{} typing...", typing.join(", "));
                        }
                        last_typing = typing;
                    }
                }
                let unread = session.unread_count();
                if unread != last_unread {
                    println!("{} unread notifications", unread);
                    last_unread = unread;
                }
            }
        }
    }

    session.end();
    info!("Disconnected");
    Ok(())
}
