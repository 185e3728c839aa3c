use clap::{Parser, Subcommand};
use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub store: StoreConfig,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Path to the application store (overrides the config file)
    #[arg(long)]
    pub store_path: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Answer one natural-language question against a task
    Ask {
        /// Task id
        #[arg(short, long)]
        task: i64,
        /// The question to answer
        question: String,
        /// Existing chat session id
        #[arg(short, long)]
        session: Option<i64>,
        /// Title for a newly created session
        #[arg(long)]
        title: Option<String>,
    },
    /// Generate semantic profiles (tables, fields, relations) for a task
    Profile {
        /// Task id
        #[arg(short, long)]
        task: i64,
    },
    /// Store a conversation's (question, SQL) pair as a few-shot example
    Harvest {
        /// Conversation id
        #[arg(long)]
        conversation: i64,
    },
    /// Record feedback on a past conversation
    Feedback {
        /// Conversation id
        #[arg(long)]
        conversation: i64,
        /// Whether the generated SQL was correct
        #[arg(long)]
        is_right: Option<bool>,
        /// Free-text description
        #[arg(long)]
        description: Option<String>,
        /// Free-text feedback
        #[arg(long)]
        feedback: Option<String>,
    },
    /// Manage chat sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionAction {
    /// Create a session for a task
    Create {
        #[arg(short, long)]
        task: i64,
        #[arg(long)]
        title: Option<String>,
    },
    /// Show a session and its conversation count
    Show {
        #[arg(short, long)]
        session: i64,
    },
    /// Retitle a session
    Rename {
        #[arg(short, long)]
        session: i64,
        title: String,
    },
    /// Delete a session and its conversations
    Delete {
        #[arg(short, long)]
        session: i64,
    },
}

impl AppConfig {
    pub fn new(args: &CliArgs) -> Result<Self, ConfigError> {
        let mut config_builder = Config::builder().set_default("store.path", "nl-pilot.db")?;

        // Add configuration from file if specified
        if let Some(config_path) = &args.config {
            config_builder = config_builder.add_source(File::from(config_path.as_path()));
        } else {
            // Check for config in default locations
            let default_locations =
                vec!["config.toml", "config/config.toml", "/etc/nl-pilot/config.toml"];

            for location in default_locations {
                if Path::new(location).exists() {
                    config_builder =
                        config_builder.add_source(File::new(location, config::FileFormat::Toml));
                    break;
                }
            }
        }

        let mut config: AppConfig = config_builder.build()?.try_deserialize()?;

        // Override with command line args if provided
        if let Some(store_path) = &args.store_path {
            config.store.path = store_path.clone();
        }

        Ok(config)
    }
}
