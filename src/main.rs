use agentbus::cli::{Cli, Commands};
use agentbus::core::RegistrationRequest;
use agentbus::transport::AgentTransport;
use agentbus::{handler, utils, AgentClient, AgentId, Message, OrchestratorServer, Settings, TcpAgentTransport};
use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(path) => Settings::from_path(path)
            .with_context(|| format!("loading settings from {}", path.display()))?,
        None => Settings::new().context("loading settings")?,
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve => handle_serve(settings).await,
        Commands::Listen { name, subscribe } => handle_listen(settings, name, subscribe).await,
        Commands::Publish { message, data, name } => handle_publish(settings, name, message, data).await,
        Commands::Status { agent_id } => handle_status(settings, agent_id).await,
    }
}

async fn handle_serve(settings: Settings) -> Result<()> {
    let server = OrchestratorServer::bind(&settings).await?;
    utils::print_header(&format!("Orchestrator '{}'", settings.orchestrator.name));
    utils::print_info(&format!("registration: {}", server.registration_addr()));
    utils::print_info(&format!("messages:     {}", server.message_addr()));
    utils::print_info("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    utils::print_success("Orchestrator stopped");
    Ok(())
}

async fn handle_listen(settings: Settings, name: String, subscribe: Vec<String>) -> Result<()> {
    let agent = AgentClient::connect(name, settings.agent);
    for message_name in &subscribe {
        let name = message_name.clone();
        agent.on_receive(
            message_name.as_str(),
            handler(move |data| {
                utils::print_message(&Message::new(name.clone(), data.clone()));
                Ok(())
            }),
        );
    }

    let agent_id = agent.start().await?;
    utils::print_header(&format!("Agent '{}'", agent.name()));
    utils::print_info(&format!("id: {agent_id}"));
    utils::print_info(&format!("subscriptions: {}", subscribe.join(", ")));
    utils::print_info("Press Ctrl+C to stop\n");

    tokio::signal::ctrl_c().await?;
    agent.stop().await?;
    utils::print_success("Agent stopped");
    Ok(())
}

async fn handle_publish(settings: Settings, name: String, message: String, data: String) -> Result<()> {
    let payload: serde_json::Value =
        serde_json::from_str(&data).with_context(|| format!("payload is not JSON: {data}"))?;

    let agent = AgentClient::connect(name, settings.agent);
    agent.start().await?;
    let sent = agent.send_message(Message::new(message.clone(), payload)).await;
    agent.stop().await?;
    if let Err(e) = sent {
        utils::print_error(&e.to_string());
        return Err(e.into());
    }

    utils::print_success(&format!("Sent '{message}'"));
    Ok(())
}

async fn handle_status(settings: Settings, agent_id: String) -> Result<()> {
    let transport = TcpAgentTransport::new(&settings.agent);
    let response = transport
        .request(RegistrationRequest::Status {
            agent_id: AgentId::from(agent_id),
        })
        .await?;
    transport.close().await?;

    match response.agent {
        Some(report) if response.is_success() => {
            utils::print_header("Agent status");
            utils::print_agent_status(&report);
            Ok(())
        }
        _ => {
            let reason = response.error.unwrap_or_else(|| "no status returned".to_string());
            utils::print_error(&reason);
            anyhow::bail!(reason)
        }
    }
}
