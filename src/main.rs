use clap::Parser;
use std::io::Write;
use std::sync::Arc;
use tracing::{error, info};

mod config;
mod db;
mod engine;
mod error;
mod format;
mod llm;
mod prompt;
mod session;
mod sql;
mod util;
mod web;

use crate::config::{AppConfig, CliArgs};
use crate::db::build_pool;
use crate::engine::Engine;
use crate::error::AppError;
use crate::llm::ModelClient;
use crate::session::Session;
use crate::util::logging::init_tracing;
use crate::web::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_tracing();

    // Parse command line arguments
    let args = CliArgs::parse();

    if let Err(e) = run(args).await {
        error!("{}", e);
        return Err(e.into());
    }

    Ok(())
}

async fn run(args: CliArgs) -> Result<(), AppError> {
    // Load configuration
    let config = AppConfig::new(&args)?;

    info!("Initializing DuckDB connection pool");
    let pool = build_pool(&config.database, config.safety.mode)?;

    info!(
        "Initializing model client with backend: {} ({})",
        config.llm.backend, config.llm.model
    );
    let model = ModelClient::from_config(&config.llm)?;
    let engine = Engine::new(&config, pool, model)?;

    // Initialize schema cache
    info!("Initializing schema cache");
    if let Err(e) = engine.schema_manager().refresh_cache().await {
        error!("Failed to initialize schema cache: {}", e);
        // Continue anyway, the first question retries
    }

    if let Some(question) = args.ask.as_deref() {
        let mut session = Session::new(config.history.max_turns);
        let display = if config.llm.stream {
            // generation goes to stderr as it arrives, the answer to stdout
            let mut stderr = std::io::stderr();
            let display = engine
                .handle_question_streaming(&mut session, question, &mut |chunk: &str| {
                    let _ = write!(stderr, "{}", chunk);
                    let _ = stderr.flush();
                })
                .await;
            eprintln!();
            display
        } else {
            engine.handle_question(&mut session, question).await
        };
        println!("{}", display.text);
        engine.model().audit_log().flush().await;
        return Ok(());
    }

    let app_state = Arc::new(AppState::new(config.clone(), engine));

    // Start the web server
    info!("Starting querybot server on {}:{}", config.web.host, config.web.port);
    web::run_server(config.web, Arc::clone(&app_state)).await?;
    info!("Server stopped gracefully");

    app_state.engine.model().audit_log().flush().await;
    Ok(())
}
