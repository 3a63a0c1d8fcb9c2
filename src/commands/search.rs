//! Search command handlers: federated search and provider listing.

use anyhow::Result;
use harvester_core::search::{SearchFilters, SearchQuery, SearchResponse, SearchResult};
use harvester_core::service::HarvestService;

use crate::cli::SearchArgs;

pub async fn run_search_command(service: &HarvestService, args: &SearchArgs) -> Result<()> {
    let query = SearchQuery {
        term: args.term.clone(),
        filters: SearchFilters {
            date_from: args.from.clone(),
            date_to: args.until.clone(),
            authors: args.authors.clone(),
            journals: args.journals.clone(),
        },
        page: args.page,
        limit: args.limit,
    };
    let filter = (!args.databases.is_empty()).then_some(args.databases.as_slice());
    let response = service.search(args.user.as_deref(), &query, filter).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }
    print_response(&response);
    Ok(())
}

pub async fn run_providers_command(service: &HarvestService, institution: Option<&str>) -> Result<()> {
    let providers = service.providers(institution).await?;
    if providers.is_empty() {
        println!("No harvested records yet.");
        return Ok(());
    }
    for provider in &providers {
        println!("{:>8}  {}", provider.record_count, provider.provider);
    }
    Ok(())
}

fn print_response(response: &SearchResponse) {
    for failure in &response.errors {
        eprintln!("warning: {} unavailable ({}): {}", failure.database, failure.kind, failure.message);
    }
    if response.results.is_empty() {
        println!("No results.");
        return;
    }
    for result in &response.results {
        println!("{}", render_result_row(result));
    }
    let origin = match (response.cached, response.stale) {
        (true, true) => " [cached, refreshing]",
        (true, false) => " [cached]",
        _ => "",
    };
    println!(
        "Page {} of {} ({} results from {}){origin}",
        response.page,
        response.total_pages,
        response.total,
        response.databases_searched.join(", ")
    );
}

fn render_result_row(result: &SearchResult) -> String {
    let date = result.publication_date.as_deref().unwrap_or("n.d.");
    let authors = match result.authors.as_slice() {
        [] => String::new(),
        [only] => format!(" - {only}"),
        [first, ..] => format!(" - {first} et al."),
    };
    let locator = result
        .doi
        .as_deref()
        .map(|doi| format!("doi:{doi}"))
        .or_else(|| result.url.clone())
        .unwrap_or_default();
    format!(
        "[{}] {} ({date}){authors}  {locator}",
        result.database, result.title
    )
}
