use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use turnstile_core::{AccessEvent, IdentitySummary};
use zbus::proxy;

#[proxy(
    interface = "org.turnstile.Access1",
    default_service = "org.turnstile.Access1",
    default_path = "/org/turnstile/Access1"
)]
trait Access {
    fn enroll(
        &self,
        student_id: &str,
        first_name: &str,
        last_name: &str,
        faculty: &str,
    ) -> zbus::Result<String>;
    fn confirm(&self, action: &str) -> zbus::Result<String>;
    fn list_identities(&self) -> zbus::Result<String>;
    fn remove_identity(&self, id: i64) -> zbus::Result<bool>;
    fn recent_events(&self, limit: u32) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "turnstile", about = "Turnstile access point CLI")]
struct Cli {
    /// Talk to a daemon on the session bus instead of the system bus
    #[arg(long, global = true)]
    session: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Enroll the face currently in front of the camera
    Enroll {
        #[arg(long)]
        student_id: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        faculty: String,
    },
    /// Log an entry for the recognized person
    Entry,
    /// Log an exit for the recognized person
    Exit,
    /// List enrolled identities
    List,
    /// Remove an enrolled identity
    Remove {
        /// Internal identity id (see `list`)
        id: i64,
    },
    /// Show recent access events
    Log {
        #[arg(short, long, default_value_t = 100)]
        limit: u32,
    },
    /// Show daemon status
    Status,
    /// List local V4L2 cameras (does not need the daemon)
    Cameras,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if let Commands::Cameras = cli.command {
        let devices = turnstile_hw::Camera::list_devices();
        if devices.is_empty() {
            println!("No video capture devices found");
        }
        for dev in devices {
            println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
        }
        return Ok(());
    }

    let connection = if cli.session {
        zbus::Connection::session().await
    } else {
        zbus::Connection::system().await
    }
    .context("cannot connect to D-Bus")?;
    let proxy = AccessProxy::new(&connection)
        .await
        .context("turnstiled is not reachable")?;

    match cli.command {
        Commands::Enroll {
            student_id,
            first_name,
            last_name,
            faculty,
        } => {
            println!("Look at the camera...");
            let json = proxy
                .enroll(&student_id, &first_name, &last_name, &faculty)
                .await?;
            let identity: IdentitySummary = serde_json::from_str(&json)?;
            println!(
                "Enrolled {} {} ({}) as #{}",
                identity.first_name, identity.last_name, identity.student_id, identity.id
            );
        }
        Commands::Entry => confirm(&proxy, "Entry").await?,
        Commands::Exit => confirm(&proxy, "Exit").await?,
        Commands::List => {
            let identities: Vec<IdentitySummary> =
                serde_json::from_str(&proxy.list_identities().await?)?;
            if identities.is_empty() {
                println!("No identities enrolled");
            }
            for identity in &identities {
                println!("{}", format_identity(identity));
            }
        }
        Commands::Remove { id } => {
            if proxy.remove_identity(id).await? {
                println!("Removed identity #{id}");
            } else {
                println!("No identity #{id}");
            }
        }
        Commands::Log { limit } => {
            let events: Vec<AccessEvent> =
                serde_json::from_str(&proxy.recent_events(limit).await?)?;
            if events.is_empty() {
                println!("No access events");
            }
            for event in &events {
                println!("{}", format_event(event));
            }
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Cameras => {}
    }

    Ok(())
}

async fn confirm(proxy: &AccessProxy<'_>, action: &str) -> Result<()> {
    let event: AccessEvent = serde_json::from_str(&proxy.confirm(action).await?)?;
    println!("{}", format_event(&event));
    Ok(())
}

fn format_identity(identity: &IdentitySummary) -> String {
    format!(
        "#{:<5} {:<12} {:<28} {:<20} {}",
        identity.id,
        identity.student_id,
        format!("{} {}", identity.first_name, identity.last_name),
        identity.faculty,
        identity
            .created_at
            .with_timezone(&Local)
            .format("%Y-%m-%d %H:%M"),
    )
}

fn format_event(event: &AccessEvent) -> String {
    format!(
        "{}  {:<5} {:<12} {:<28} {}",
        event.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S"),
        event.action.as_str(),
        event.student_id,
        event.display_name,
        event.location,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use clap::CommandFactory;
    use turnstile_core::Action;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_log_limit_defaults_to_100() {
        let cli = Cli::try_parse_from(["turnstile", "log"]).unwrap();
        assert!(matches!(cli.command, Commands::Log { limit: 100 }));

        let cli = Cli::try_parse_from(["turnstile", "--session", "log", "-l", "5"]).unwrap();
        assert!(cli.session);
        assert!(matches!(cli.command, Commands::Log { limit: 5 }));
    }

    #[test]
    fn test_enroll_requires_every_field() {
        assert!(Cli::try_parse_from(["turnstile", "enroll", "--student-id", "S1"]).is_err());
    }

    #[test]
    fn test_format_event_columns() {
        let event = AccessEvent {
            id: 1,
            identity_id: Some(7),
            student_id: "S1".into(),
            display_name: "Ada Lovelace".into(),
            action: Action::Exit,
            location: "Library".into(),
            timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
        };
        let line = format_event(&event);
        assert!(line.contains("Exit "));
        assert!(line.contains("Ada Lovelace"));
        assert!(line.ends_with("Library"));
    }
}
