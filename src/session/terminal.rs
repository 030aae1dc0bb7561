use anyhow::Result;
use chrono::Utc;
use colored::Colorize;
use dialoguer::{theme::ColorfulTheme, Input, MultiSelect, Select, Sort};
use std::fs;
use std::path::Path;
use tracing::info;

use super::{AnnotationSession, SessionState};
use crate::labels::{Article, Factor, Relevance, Sentiment};
use crate::storage::ObjectStore;
use crate::TARGET_SESSION;

/// Runs the annotation prompts until the user sends the batch or quits.
///
/// On quit or after sending, the accumulated annotations are written to
/// `export` when a path is given.
pub async fn run_interactive(
    session: &mut AnnotationSession,
    store: &dyn ObjectStore,
    bucket: &str,
    export: Option<&Path>,
) -> Result<()> {
    let theme = ColorfulTheme::default();

    loop {
        match session.state() {
            SessionState::Closed => break,
            SessionState::AwaitingLabels => {
                prompt_labels(session, &theme)?;
                continue;
            }
            SessionState::AwaitingRelevance => {
                if let Some(article) = session.current() {
                    show_article(article, session.cursor(), session.work_len());
                }
            }
            SessionState::Exhausted => println!("\n{}", "No more data to annotate".yellow()),
        }

        println!("{}", format!("Annotated: {}", session.annotated_count()).cyan());

        let mut actions: Vec<Action> = Vec::new();
        if session.state() == SessionState::AwaitingRelevance {
            actions.push(Action::Related);
            actions.push(Action::NotRelated);
        }
        actions.push(Action::Send);
        actions.push(Action::Review);
        actions.push(Action::Quit);

        let labels: Vec<String> = actions.iter().map(|a| a.label(&*session)).collect();
        let prompt = if session.state() == SessionState::AwaitingRelevance {
            "Is this news text related to the Rule of Law?"
        } else {
            "What next?"
        };
        let choice = Select::with_theme(&theme)
            .with_prompt(prompt)
            .items(&labels)
            .default(0)
            .interact()?;

        match actions[choice] {
            Action::Related => {
                session.answer_relevance(Relevance::Related)?;
            }
            Action::NotRelated => {
                session.answer_relevance(Relevance::NotRelated)?;
            }
            Action::Send => send(session, store, bucket).await,
            Action::Review => review(session)?,
            Action::Quit => {
                if session.annotated_count() > 0 {
                    println!(
                        "{}",
                        "Leaving without sending; unsent annotations are not stored in the cloud."
                            .yellow()
                    );
                }
                break;
            }
        }
    }

    if let Some(path) = export {
        fs::write(path, session.to_csv()?)?;
        println!("Annotations exported to {}", path.display());
        info!(target: TARGET_SESSION, "Exported {} annotations to {}", session.annotated_count(), path.display());
    }
    Ok(())
}

#[derive(Clone, Copy)]
enum Action {
    Related,
    NotRelated,
    Send,
    Review,
    Quit,
}

impl Action {
    fn label(&self, session: &AnnotationSession) -> String {
        match self {
            Action::Related => "Yes".to_string(),
            Action::NotRelated => "No".to_string(),
            Action::Send if session.can_flush() => {
                "Send annotated data to the cloud (this ends the session)".to_string()
            }
            Action::Send => format!(
                "Send annotated data to the cloud (needs {} or more annotations)",
                session.policy().min_records.max(1)
            ),
            Action::Review => "Show annotations".to_string(),
            Action::Quit => "Quit".to_string(),
        }
    }
}

fn show_article(article: &Article, index: usize, total: usize) {
    println!();
    println!("{}", format!("Article {} of {}", index + 1, total).dimmed());
    if let Some(link) = &article.link {
        println!("News source: {}", link.underline());
    }
    println!("{}", article.display_country().bold());
    println!("{}", article.display_title().bold().bright_white());
    let description = article.display_description();
    if !description.is_empty() {
        println!("\n{}", description);
    }
    let content = article.display_content();
    if !content.is_empty() {
        println!("\n{}", content.dimmed());
    }
    println!();
}

fn prompt_labels(session: &mut AnnotationSession, theme: &ColorfulTheme) -> Result<()> {
    let country = session
        .current()
        .map(Article::display_country)
        .unwrap_or_default();

    let mut options: Vec<Factor> = Factor::ALL.to_vec();
    options.sort_by_key(|f| f.label());
    let option_labels: Vec<&str> = options.iter().map(Factor::label).collect();

    let picked = MultiSelect::with_theme(theme)
        .with_prompt("Select to which factor(s) this news text belongs (space to select, enter to confirm)")
        .items(&option_labels)
        .interact()?;
    let mut factors: Vec<Factor> = picked.into_iter().map(|i| options[i]).collect();

    if factors.len() > 1 {
        let labels: Vec<&str> = factors.iter().map(Factor::label).collect();
        let order = Sort::with_theme(theme)
            .with_prompt("Order the selected factors by relevance, most relevant first")
            .items(&labels)
            .interact()?;
        factors = order.into_iter().map(|i| factors[i]).collect();
    }

    let mut sentiments: Vec<Sentiment> = Sentiment::ALL.to_vec();
    sentiments.sort_by_key(|s| s.label());
    let sentiment_labels: Vec<&str> = sentiments.iter().map(Sentiment::label).collect();
    let sentiment = Select::with_theme(theme)
        .with_prompt(format!(
            "How does this impact the Rule of Law in {} (based on the most relevant factor)?",
            country
        ))
        .items(&sentiment_labels)
        .default(0)
        .interact()?;

    let comments: String = Input::with_theme(theme)
        .with_prompt("Comments")
        .allow_empty(true)
        .interact_text()?;

    session.submit_labels(factors, sentiments[sentiment], comments)?;
    Ok(())
}

async fn send(session: &mut AnnotationSession, store: &dyn ObjectStore, bucket: &str) {
    match session.flush(store, bucket, Utc::now()).await {
        Ok(receipt) => {
            println!(
                "{}",
                format!(
                    "The annotated data has been sent ({} records). Thank you!",
                    receipt.records
                )
                .green()
            );
        }
        Err(e) => {
            println!("{} {}", "Sending failed:".red(), e);
            println!("Your annotations are still here; try sending again.");
        }
    }
}

fn review(session: &AnnotationSession) -> Result<()> {
    if session.annotated_count() == 0 {
        println!("No annotations yet.");
        return Ok(());
    }
    print!("{}", session.to_csv()?);
    Ok(())
}
