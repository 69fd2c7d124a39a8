use crate::backend;
use colored::Colorize;
use statecraft_core::resource::SCOPE_KIND;
use statecraft_core::store::is_reserved_id;
use statecraft_core::{ResourceStatus, Scope};

pub async fn handle(root: &Scope, scope_path: Option<&str>) -> anyhow::Result<()> {
    let scope = backend::resolve_scope(root, scope_path)?;
    crate::print_scope_header(scope.chain());

    let mut records: Vec<_> = scope
        .store()
        .all()
        .await?
        .into_iter()
        .filter(|(id, _)| !is_reserved_id(id))
        .map(|(_, record)| record)
        .collect();
    records.sort_by_key(|record| record.seq);

    println!();
    if records.is_empty() {
        println!("{}", "リソースはありません".dimmed());
        return Ok(());
    }

    println!(
        "{}",
        format!(
            "{:<24} {:<28} {:<10} {:>5}  {:<20}",
            "ID", "KIND", "STATUS", "SEQ", "UPDATED"
        )
        .bold()
    );
    println!("{}", "─".repeat(92).dimmed());

    for record in &records {
        let status = format!("{:<10}", record.status.to_string());
        let status_colored = match record.status {
            ResourceStatus::Created | ResourceStatus::Updated => status.green(),
            ResourceStatus::Deleting | ResourceStatus::Deleted => status.red(),
            ResourceStatus::Creating | ResourceStatus::Updating => status.yellow(),
        };
        let kind = if record.kind == SCOPE_KIND {
            format!("{:<28}", "(scope)").cyan()
        } else {
            format!("{:<28}", record.kind).normal()
        };
        println!(
            "{:<24} {} {} {:>5}  {}",
            record.id,
            kind,
            status_colored,
            record.seq,
            record.updated_at.format("%Y-%m-%d %H:%M:%S").to_string().dimmed()
        );
    }

    println!();
    println!("{} 件", records.len());
    Ok(())
}
