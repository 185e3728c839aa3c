use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

mod agents;
mod chat;
mod config;
mod error;
mod executor;
mod llm;
mod parse;
mod store;
#[cfg(test)]
mod testutil;
mod util;

use crate::agents::profiler::SemanticProfiler;
use crate::chat::{AskRequest, ChatOrchestrator};
use crate::config::{AppConfig, CliArgs, Command, SessionAction};
use crate::error::AppError;
use crate::llm::client::OpenAiChatClient;
use crate::store::sqlite::SqliteStore;
use crate::store::MetadataStore;
use crate::util::logging::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_tracing();

    // Parse command line arguments
    let args = CliArgs::parse();

    // Load configuration
    let config = match AppConfig::new(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    info!("Opening application store at {}", config.store.path);
    let store = Arc::new(SqliteStore::open(&config.store.path).await?);

    match args.command {
        Command::Ask { task, question, session, title } => {
            let orchestrator = ChatOrchestrator::new(store.clone(), store.clone());
            let mut request = AskRequest::new(task, question);
            request.session_id = session;
            request.session_title = title;

            let response = orchestrator.ask(request).await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Command::Profile { task } => {
            let record = store
                .get_task(task)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("任务ID {}", task)))?;
            let llm = store
                .get_llm_settings(record.llm_config_id)
                .await?
                .ok_or_else(|| AppError::NotFound(format!("LLM配置ID {}", record.llm_config_id)))?;
            if !llm.enabled {
                return Err(AppError::Disabled(format!("LLM配置ID {}", llm.id)).into());
            }

            let chat = OpenAiChatClient::new(&llm)?;
            let profiler = SemanticProfiler::new(&chat, llm.chat_options(), store.as_ref(), task);
            let report = profiler.run().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Harvest { conversation } => {
            let orchestrator = ChatOrchestrator::new(store.clone(), store.clone());
            let example_id = orchestrator.harvest_qa_example(conversation).await?;
            info!("Saved conversation {} as qa example {}", conversation, example_id);
        }
        Command::Feedback { conversation, is_right, description, feedback } => {
            let orchestrator = ChatOrchestrator::new(store.clone(), store.clone());
            let view = orchestrator
                .update_conversation_feedback(
                    conversation,
                    is_right,
                    description.as_deref(),
                    feedback.as_deref(),
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&view)?);
        }
        Command::Session { action } => {
            let orchestrator = ChatOrchestrator::new(store.clone(), store.clone());
            match action {
                SessionAction::Create { task, title } => {
                    let view = orchestrator.create_session(task, title.as_deref()).await?;
                    println!("{}", serde_json::to_string_pretty(&view)?);
                }
                SessionAction::Show { session } => {
                    let view = orchestrator.get_session(session).await?;
                    println!("{}", serde_json::to_string_pretty(&view)?);
                }
                SessionAction::Rename { session, title } => {
                    let view = orchestrator.rename_session(session, &title).await?;
                    println!("{}", serde_json::to_string_pretty(&view)?);
                }
                SessionAction::Delete { session } => {
                    orchestrator.delete_session(session).await?;
                    info!("Deleted session {}", session);
                }
            }
        }
    }

    Ok(())
}
