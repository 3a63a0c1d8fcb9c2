//! Source administration: add, list, remove, pause, resume.

use anyhow::Result;
use harvester_core::service::HarvestService;
use harvester_core::store::{HarvestSource, NewHarvestSource};

use crate::cli::{SourceAddArgs, SourceCommand};

pub async fn run_source_command(service: &HarvestService, command: &SourceCommand) -> Result<()> {
    match command {
        SourceCommand::Add(args) => {
            let created = service.create_source(&new_source(args)).await?;
            println!("Registered source {} ({})", created.id, created.name);
        }
        SourceCommand::List => {
            let sources = service.list_sources().await?;
            if sources.is_empty() {
                println!("No harvest sources registered. Add one with `harvester source add`.");
                return Ok(());
            }
            for source in &sources {
                println!("{}", render_source_row(source));
            }
        }
        SourceCommand::Remove { source_id } => {
            service.remove_source(*source_id).await?;
            println!("Removed source {source_id}");
        }
        SourceCommand::Pause { source_id } => {
            service.pause_source(*source_id).await?;
            println!("Paused source {source_id}");
        }
        SourceCommand::Resume { source_id } => {
            let source = service.resume_source(*source_id).await?;
            println!("Resumed source {} ({})", source.id, source.schedule);
        }
    }
    Ok(())
}

fn new_source(args: &SourceAddArgs) -> NewHarvestSource {
    NewHarvestSource {
        name: args.name.clone(),
        endpoint_url: args.endpoint.clone(),
        metadata_prefix: args.metadata_prefix.clone(),
        set_spec: args.set.clone(),
        provider_allow_list: args.providers.clone(),
        schedule: args.schedule.clone(),
        institution_id: args.institution.clone(),
    }
}

fn render_source_row(source: &HarvestSource) -> String {
    let last = source
        .last_harvested_at
        .map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d %H:%M").to_string());
    let resume = if source.resumption_token.is_some() {
        " (resumable)"
    } else {
        ""
    };
    format!(
        "{:>4}  {:<10} {:<24} {:<8} [{}] last: {}{}  {}",
        source.id,
        source.status.as_str(),
        source.name,
        source.metadata_prefix,
        source.schedule,
        last,
        resume,
        source.endpoint_url
    )
}
