use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use server_api::{ApiConfig, ApiContext};
use shared::{
    domain::{MessageBody, UserId},
    error::ApiError,
};
use storage::Storage;

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "sqlite://./data/server.db")]
    database_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    RegisterUser {
        identity: String,
        display_name: String,
    },
    CreateChat {
        creator_user_id: i64,
        #[arg(required = true)]
        participants: Vec<i64>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        group: bool,
    },
    SendMessage {
        sender_user_id: i64,
        chat_id: i64,
        text: String,
    },
    ListChats {
        user_id: i64,
    },
    Befriend {
        user_id: i64,
        other_user_id: i64,
    },
    SweepStatuses,
    SweepTyping,
}

fn api_error(err: ApiError) -> anyhow::Error {
    anyhow!("{:?}: {}", err.code, err.message)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let storage = Storage::new(&cli.database_url).await?;
    let (api, _) = ApiContext::new(storage, ApiConfig::default());

    match cli.command {
        Command::RegisterUser {
            identity,
            display_name,
        } => {
            let profile = server_api::register_user(&api, &identity, &display_name)
                .await
                .map_err(api_error)?;
            println!("user_id={} display_name={}", profile.user_id, profile.display_name);
        }
        Command::CreateChat {
            creator_user_id,
            participants,
            name,
            group,
        } => {
            let participants: Vec<UserId> = participants.into_iter().map(UserId).collect();
            let created = server_api::create_chat(
                &api,
                UserId(creator_user_id),
                &participants,
                name.as_deref(),
                group,
            )
            .await
            .map_err(api_error)?;
            println!("chat_id={} existed={}", created.chat_id, created.exists);
        }
        Command::SendMessage {
            sender_user_id,
            chat_id,
            text,
        } => {
            let message = server_api::send_message(
                &api,
                UserId(sender_user_id),
                shared::domain::ChatId(chat_id),
                MessageBody::text(text),
                None,
            )
            .await
            .map_err(api_error)?;
            println!("message_id={}", message.message_id);
        }
        Command::ListChats { user_id } => {
            let chats = server_api::list_chats(&api, UserId(user_id))
                .await
                .map_err(api_error)?;
            println!("{}", serde_json::to_string_pretty(&chats)?);
        }
        Command::Befriend {
            user_id,
            other_user_id,
        } => {
            server_api::send_contact_request(&api, UserId(user_id), UserId(other_user_id))
                .await
                .map_err(api_error)?;
            server_api::accept_contact_request(&api, UserId(other_user_id), UserId(user_id))
                .await
                .map_err(api_error)?;
            println!("contacts: {user_id} <-> {other_user_id}");
        }
        Command::SweepStatuses => {
            let report = server_api::sweep_expired_statuses(&api, Utc::now())
                .await
                .map_err(api_error)?;
            println!("deleted {} expired statuses", report.deleted_count);
        }
        Command::SweepTyping => {
            let report = server_api::sweep_stale_typing(&api, Utc::now())
                .await
                .map_err(api_error)?;
            println!("deleted {} stale typing entries", report.deleted_count);
        }
    }

    Ok(())
}
