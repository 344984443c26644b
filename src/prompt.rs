use minijinja::{context, Environment};
use thiserror::Error;
use tracing::debug;

use crate::db::executor::QueryResult;
use crate::db::introspect::SchemaDescription;
use crate::llm::models::PromptText;
use crate::session::{ConversationHistory, ConversationTurn, Role};

const GENERATE_SQL: &str = "generate_sql.txt";
const SUMMARIZE: &str = "summarize.txt";

/// Rows of a result shown to the model when asking for a summary
const SUMMARY_ROWS: usize = 5;

#[derive(Debug, Error)]
pub enum PromptError {
    #[error("Configuration error: the database has no tables the assistant can query")]
    EmptySchema,

    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),
}

/// Renders model prompts. Rendering is deterministic: the same schema,
/// history and question always produce the same text.
pub struct PromptBuilder {
    env: Environment<'static>,
    max_chars: usize,
}

impl PromptBuilder {
    pub fn new(max_chars: usize) -> Result<Self, PromptError> {
        let mut env = Environment::new();
        env.add_template(GENERATE_SQL, include_str!("../templates/generate_sql.txt"))?;
        env.add_template(SUMMARIZE, include_str!("../templates/summarize.txt"))?;

        Ok(Self { env, max_chars })
    }

    /// Prompt asking for the SQL answering `question`.
    ///
    /// Past the character budget the oldest turns are left out first; the
    /// schema and the most recent turn are always kept. A turn is a question
    /// together with every assistant entry answering it, and is left out whole.
    pub fn build_prompt(
        &self,
        schema: &SchemaDescription,
        history: &ConversationHistory,
        question: &str,
    ) -> Result<PromptText, PromptError> {
        if schema.is_empty() {
            return Err(PromptError::EmptySchema);
        }

        let schema_text = schema.render();
        let turns: Vec<&ConversationTurn> = history.turns().collect();

        // the first entry opens a turn even when its question was already dropped from history
        let mut starts: Vec<usize> = turns
            .iter()
            .enumerate()
            .filter(|(i, turn)| *i == 0 || turn.role == Role::User)
            .map(|(i, _)| i)
            .collect();
        let latest = starts.pop().unwrap_or(0);

        for start in starts {
            let text = self.render_sql_prompt(&schema_text, &turns[start..], question)?;
            if text.chars().count() <= self.max_chars {
                if start > 0 {
                    debug!("Left {} oldest history entries out of the prompt", start);
                }
                return Ok(PromptText::new(text));
            }
        }

        if latest > 0 {
            debug!("Prompt over budget, keeping only the latest turn");
        }
        let text = self.render_sql_prompt(&schema_text, &turns[latest..], question)?;
        Ok(PromptText::new(text))
    }

    fn render_sql_prompt(
        &self,
        schema: &str,
        history: &[&ConversationTurn],
        question: &str,
    ) -> Result<String, PromptError> {
        let template = self.env.get_template(GENERATE_SQL)?;
        Ok(template.render(context! {
            schema => schema,
            history => history,
            question => question,
        })?)
    }

    /// Prompt asking for a one-sentence answer built from a query result.
    pub fn build_summary_prompt(
        &self,
        question: &str,
        sql: &str,
        result: &QueryResult,
    ) -> Result<PromptText, PromptError> {
        let rows: Vec<Vec<String>> = result
            .rows
            .iter()
            .take(SUMMARY_ROWS)
            .map(|row| row.iter().map(ToString::to_string).collect())
            .collect();

        let template = self.env.get_template(SUMMARIZE)?;
        let text = template.render(context! {
            question => question,
            sql => sql,
            columns => &result.columns,
            rows => rows,
            total_rows => result.total_rows,
            truncated => result.truncated || result.total_rows > SUMMARY_ROWS,
        })?;

        Ok(PromptText::new(text))
    }
}
