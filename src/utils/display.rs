use crate::core::{AgentStatus, AgentStatusReport, Message};
use colored::*;

/// Section title underlined to its width
pub fn print_header(title: &str) {
    let rule = "=".repeat(title.chars().count());
    println!("\n{}\n{}", title.bright_cyan().bold(), rule.bright_cyan());
}

pub fn print_success(text: &str) {
    println!("{} {}", "ok".green().bold(), text.green());
}

pub fn print_error(text: &str) {
    eprintln!("{} {}", "error:".red().bold(), text.red());
}

pub fn print_info(text: &str) {
    println!("  {}", text.blue());
}

pub fn print_agent_status(report: &AgentStatusReport) {
    let status = match report.status {
        AgentStatus::Active => report.status.to_string().green().bold(),
        AgentStatus::Inactive => report.status.to_string().red().bold(),
    };
    println!("  {:<14} {}", "name:".bold(), report.name);
    println!("  {:<14} {}", "id:".bold(), report.id);
    println!("  {:<14} {}", "address:".bold(), report.address);
    println!("  {:<14} {}", "status:".bold(), status);
    println!("  {:<14} {}", "subscriptions:".bold(), report.subscriptions.join(", "));
    println!(
        "  {:<14} {}",
        "last seen:".bold(),
        report.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
    );
}

pub fn print_message(message: &Message) {
    let origin = message.origin_name.as_deref().unwrap_or("-");
    println!(
        "{} {} {}",
        message.name.yellow().bold(),
        format!("from {origin}").dimmed(),
        message.data
    );
}
