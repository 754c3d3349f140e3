use std::collections::HashMap;

use anyhow::{anyhow, Result};
use chrono::FixedOffset;
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, FeedClient, FeedEvent, FeedSnapshot, LoadOutcome, MergeDirection,
};
use shared::domain::{ChannelId, Post, PostId, PostKey, PostKind, PostStatus, UserId};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "feed_tool", about = "Drive a channel feed against a live server")]
struct Cli {
    /// Overrides the configured server URL.
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[arg(long)]
    token: Option<String>,
    /// Id of the signed-in user; their own typing events are ignored.
    #[arg(long, default_value = "me")]
    user: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Loads the newest page and prints the sectioned feed.
    Sync { channel: String },
    Older {
        channel: String,
        #[arg(long)]
        anchor: Option<String>,
    },
    Newer {
        channel: String,
        #[arg(long)]
        anchor: Option<String>,
    },
    /// Loads short pages on both sides of a post already in the local feed.
    Around { channel: String, post_id: String },
    Search { channel: String, term: String },
    Post {
        channel: String,
        message: String,
        #[arg(long)]
        reply_to: Option<String>,
    },
    /// Follows realtime events until interrupted.
    Tail { channel: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(server_url) = cli.server_url {
        settings.server_url = server_url;
    }
    if let Some(database_url) = cli.database_url {
        settings.database_url = database_url;
    }
    if let Some(token) = cli.token {
        settings.auth_token = Some(token);
    }

    let user = UserId::new(cli.user);
    let client = FeedClient::connect(settings, user.clone()).await?;

    match cli.command {
        Command::Sync { channel } => {
            let channel = activate(&client, channel);
            report(client.pagination().load_first(&channel).await?);
            print_feed(&client, &channel).await?;
        }
        Command::Older { channel, anchor } => {
            let channel = activate(&client, channel);
            report(
                client
                    .pagination()
                    .load_older(&channel, anchor.map(PostId::new))
                    .await?,
            );
            print_feed(&client, &channel).await?;
        }
        Command::Newer { channel, anchor } => {
            let channel = activate(&client, channel);
            report(
                client
                    .pagination()
                    .load_newer(&channel, anchor.map(PostId::new))
                    .await?,
            );
            print_feed(&client, &channel).await?;
        }
        Command::Around { channel, post_id } => {
            let channel = activate(&client, channel);
            let key = PostKey::Confirmed(PostId::new(post_id));
            let snapshot = client.feed().snapshot(&channel).await?;
            let anchor = snapshot
                .post(&key)
                .cloned()
                .ok_or_else(|| anyhow!("post {key} is not in the local feed; run sync or search first"))?;
            let around = client.pagination().load_around(&channel, &anchor).await?;
            report(around.older);
            report(around.newer);
            print_feed(&client, &channel).await?;
        }
        Command::Search { channel, term } => {
            let channel = ChannelId::new(channel);
            let hits = client.outbox().search(&term, &channel).await?;
            println!("{} hit(s) for '{term}'", hits.len());
            for hit in &hits {
                println!("{}", render_post(hit));
            }
        }
        Command::Post {
            channel,
            message,
            reply_to,
        } => {
            let channel = activate(&client, channel);
            let sent = client
                .outbox()
                .compose(&channel, &user, &message, Vec::new(), reply_to.map(PostId::new))
                .await?;
            println!("sent {}", sent.key);
        }
        Command::Tail { channel } => {
            let channel = activate(&client, channel);
            tail(&client, &channel).await?;
        }
    }

    Ok(())
}

fn activate(client: &FeedClient, channel: String) -> ChannelId {
    let channel = ChannelId::new(channel);
    client.pagination().set_active_channel(channel.clone());
    channel
}

fn report(outcome: LoadOutcome) {
    match outcome {
        LoadOutcome::Loaded(summary) => info!(
            channel_id = %summary.channel_id,
            direction = summary.direction.as_str(),
            received = summary.received,
            last_page = summary.is_last_page,
            has_older = summary.cursors.has_older,
            has_newer = summary.cursors.has_newer,
            "feed_tool: page loaded"
        ),
        LoadOutcome::Skipped => warn!("feed_tool: load skipped, another load is in flight"),
        LoadOutcome::Cancelled => warn!("feed_tool: load cancelled"),
    }
}

async fn tail(client: &FeedClient, channel: &ChannelId) -> Result<()> {
    let mut events = client.feed().subscribe_events();
    let listener = client.start_realtime().await?;
    info!(channel_id = %channel, "feed_tool: tailing realtime events");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(FeedEvent::Merged { channel_id, direction, changed, removed })
                    if &channel_id == channel && direction == MergeDirection::Realtime =>
                {
                    let snapshot = client.feed().snapshot(channel).await?;
                    for key in &changed {
                        if let Some(post) = snapshot.post(key) {
                            println!("{}", render_post(post));
                        }
                    }
                    for key in &removed {
                        println!("  (removed {key})");
                    }
                }
                Ok(FeedEvent::TypingChanged { channel_id, typing }) if &channel_id == channel => {
                    if !typing.is_empty() {
                        let names: Vec<&str> = typing.iter().map(UserId::as_str).collect();
                        println!("  ... {} typing", names.join(", "));
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "feed_tool: event stream lagged");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    listener.abort();
    Ok(())
}

async fn print_feed(client: &FeedClient, channel: &ChannelId) -> Result<()> {
    let snapshot = client.feed().snapshot(channel).await?;
    print_sections(&snapshot, client.settings().section_offset());
    Ok(())
}

fn print_sections(snapshot: &FeedSnapshot, offset: FixedOffset) {
    let by_key: HashMap<&PostKey, &Post> = snapshot.posts.iter().map(|p| (&p.key, p)).collect();
    for section in &snapshot.sections {
        println!("== {} ({} posts)", section.date, section.len());
        for key in section.keys() {
            if let Some(post) = by_key.get(key) {
                let time = post.created_at.with_timezone(&offset).format("%H:%M");
                println!("{time} {}", render_post(post));
            }
        }
    }
}

fn render_post(post: &Post) -> String {
    let status = match post.status {
        PostStatus::Pending => " (sending)",
        PostStatus::Failed => " (failed)",
        _ => "",
    };
    let files = if post.files.is_empty() {
        String::new()
    } else {
        format!(" [{} file(s)]", post.files.len())
    };
    match post.kind {
        PostKind::FollowUp => format!("    {}{files}{status}", post.body),
        _ => format!("{}: {}{files}{status}", post.author_id, post.body),
    }
}
