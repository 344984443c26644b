use chrono::Utc;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::db::executor::{QueryErrorKind, QueryExecutor, SafetyPolicy};
use crate::db::introspect::SchemaIntrospector;
use crate::db::schema_manager::SchemaManager;
use crate::db::DbPool;
use crate::format::{summarize_for_history, DisplayText, ResultFormatter};
use crate::llm::models::CompletionPurpose;
use crate::llm::ModelClient;
use crate::prompt::{PromptBuilder, PromptError};
use crate::session::{ConversationTurn, PendingWrite, Session};
use crate::sql::{extract_sql, ValidationVerdict};
use crate::util::redact::redact;

pub const UNAVAILABLE_MESSAGE: &str = "The assistant is currently unavailable, please try again later.";
pub const AMBIGUOUS_MESSAGE: &str = "Could not determine a query, please rephrase.";

/// Runs one question through prompt, model, extraction, execution and
/// formatting. Shared by every session.
pub struct Engine {
    schema: SchemaManager,
    model: ModelClient,
    prompts: PromptBuilder,
    executor: QueryExecutor,
    formatter: ResultFormatter,
    policy: SafetyPolicy,
    summarize_results: bool,
}

impl Engine {
    pub fn new(config: &AppConfig, pool: DbPool, model: ModelClient) -> Result<Self, PromptError> {
        Ok(Self {
            schema: SchemaManager::new(SchemaIntrospector::new(pool.clone(), config.database.include_views)),
            model,
            prompts: PromptBuilder::new(config.history.max_prompt_chars)?,
            executor: QueryExecutor::new(pool, config.database.query_timeout()),
            formatter: ResultFormatter::new(config.display.preview_rows),
            policy: SafetyPolicy::from(&config.safety),
            summarize_results: config.llm.summarize_results,
        })
    }

    pub fn schema_manager(&self) -> &SchemaManager {
        &self.schema
    }

    pub fn model(&self) -> &ModelClient {
        &self.model
    }

    pub fn policy(&self) -> &SafetyPolicy {
        &self.policy
    }

    /// Answers `question` within `session`. Every failure ends up as display text.
    pub async fn handle_question(&self, session: &mut Session, question: &str) -> DisplayText {
        self.answer(session, question, None).await
    }

    /// Same as [`Engine::handle_question`], with the model's answer handed to
    /// `on_chunk` piece by piece while it is generated.
    pub async fn handle_question_streaming(
        &self,
        session: &mut Session,
        question: &str,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> DisplayText {
        self.answer(session, question, Some(on_chunk)).await
    }

    async fn answer(
        &self,
        session: &mut Session,
        question: &str,
        on_chunk: Option<&mut (dyn FnMut(&str) + Send)>,
    ) -> DisplayText {
        let question = question.trim();
        if question.is_empty() {
            return DisplayText::message("Please ask a question.");
        }

        if let Some(pending) = session.pending.take() {
            info!("Discarding unconfirmed {} in session {}", pending.kind.label(), session.id);
        }
        info!("Session {} asked: {}", session.id, question);

        let schema = match self.schema.schema().await {
            Ok(schema) => schema,
            Err(e) => {
                warn!("Schema unavailable: {}", e);
                let display = DisplayText::message(format!(
                    "Could not read the database schema: {}",
                    redact(&e.to_string())
                ));
                return record_turn(session, question, None, "schema unavailable", display);
            }
        };

        let prompt = match self.prompts.build_prompt(&schema, &session.history, question) {
            Ok(prompt) => prompt,
            Err(e) => {
                warn!("Could not build prompt: {}", e);
                let display = DisplayText::message(e.to_string());
                return record_turn(session, question, None, "no prompt", display);
            }
        };

        let generated = match on_chunk {
            Some(on_chunk) => {
                self.model
                    .complete_streaming(&prompt, CompletionPurpose::SqlGeneration, on_chunk)
                    .await
            }
            None => self.model.complete_with_retry(&prompt, CompletionPurpose::SqlGeneration).await,
        };
        let response = match generated {
            Ok(response) => response,
            Err(e) => {
                warn!("No answer from the model: {}", e);
                let display = DisplayText::message(UNAVAILABLE_MESSAGE);
                return record_turn(session, question, None, "assistant unavailable", display);
            }
        };

        let generated = extract_sql(&response.text);
        let sql = match (&generated.validation_verdict, generated.sql()) {
            (ValidationVerdict::Valid, Some(sql)) => sql.to_string(),
            (verdict, _) => {
                warn!("Model answer held no single statement: {:?}", verdict);
                let display = DisplayText::message(AMBIGUOUS_MESSAGE);
                return record_turn(session, question, None, "no query", display);
            }
        };

        let outcome = self.executor.execute(&sql, &self.policy).await;
        let mut display = self.formatter.format(&sql, &outcome);
        let summary = summarize_for_history(&outcome);

        match &outcome {
            Ok(result) if result.requires_confirmation => {
                session.pending = Some(PendingWrite {
                    sql: sql.clone(),
                    kind: result.statement,
                    question: question.to_string(),
                    preview: result.clone(),
                    created_at: Utc::now(),
                });
            }
            Ok(result) if self.summarize_results && result.total_rows > 0 => {
                if let Some(sentence) = self
                    .formatter
                    .gloss(&self.model, &self.prompts, question, &sql, result)
                    .await
                {
                    display.text = format!("{}\n\n{}", sentence, display.text);
                }
            }
            _ => {}
        }

        record_turn(session, question, Some(sql), summary, display)
    }

    /// Applies the write waiting in `session`.
    pub async fn confirm_pending(&self, session: &mut Session) -> DisplayText {
        let Some(pending) = session.pending.take() else {
            return DisplayText::message("There is no pending change to confirm.");
        };

        info!("Session {} confirmed {}", session.id, pending.kind.label());
        let outcome = self.executor.execute_confirmed(&pending.sql, &self.policy).await;

        // a timed out write is still running and may commit
        let outcome_unknown = matches!(&outcome, Err(e) if e.kind == QueryErrorKind::Timeout);
        if outcome_unknown || (outcome.is_ok() && pending.kind.changes_schema()) {
            self.schema.invalidate().await;
        }

        let display = self.formatter.format_applied(&pending.sql, &outcome);
        let summary = match &outcome {
            Ok(_) => format!("confirmed: {}", display.text.lines().last().unwrap_or_default()),
            Err(_) if outcome_unknown => "confirmed, outcome unknown: the change may have been applied".to_string(),
            Err(_) => summarize_for_history(&outcome),
        };
        session
            .history
            .push(ConversationTurn::assistant(&pending.question, Some(pending.sql), summary));

        display
    }

    pub fn cancel_pending(&self, session: &mut Session) -> DisplayText {
        match session.pending.take() {
            Some(pending) => {
                info!("Session {} cancelled {}", session.id, pending.kind.label());
                session.history.push(ConversationTurn::assistant(
                    &pending.question,
                    Some(pending.sql),
                    "cancelled by the user",
                ));
                DisplayText::message("Pending change discarded. Nothing was modified.")
            }
            None => DisplayText::message("There is no pending change to cancel."),
        }
    }
}

fn record_turn(
    session: &mut Session,
    question: &str,
    sql: Option<String>,
    summary: impl Into<String>,
    display: DisplayText,
) -> DisplayText {
    session.history.push(ConversationTurn::user(question));
    session.history.push(ConversationTurn::assistant(question, sql, summary));
    display
}
