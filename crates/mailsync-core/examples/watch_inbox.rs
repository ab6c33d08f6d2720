//! Watch an INBOX and print change events
//!
//! With a config file argument, connects to the configured server; the
//! stored secret is used as is. Without one, runs against an in-process
//! server and delivers a message to itself.
//!
//!     cargo run -p mailsync-core --example watch_inbox -- account.json

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use mailsync_core::{
    AccountConfig, ConnectionProperties, DecryptError, Envelope, FolderListener, MailAccount,
    Protocol, SessionEstablisher,
};
use mailsync_imap::{ImapConnector, MemoryServer};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

struct PrintListener;

impl FolderListener for PrintListener {
    fn messages_added(&self, messages: &[Envelope]) {
        for message in messages {
            println!(
                "+ {} from {:?}",
                message.subject.as_deref().unwrap_or("(no subject)"),
                message.from.as_deref().unwrap_or_default()
            );
        }
    }

    fn messages_removed(&self, messages: &[Envelope]) {
        for message in messages {
            println!("- UID {:?}", message.uid);
        }
    }

    fn message_changed(&self, message: &Envelope) {
        println!(
            "* UID {:?} seen={:?} flagged={:?}",
            message.uid, message.seen, message.flagged
        );
    }
}

fn plaintext(secret: &str, _password: &str) -> Result<String, DecryptError> {
    Ok(secret.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("mailsync_core=debug".parse()?))
        .init();

    let mut demo_server = None;
    let mail_account = match std::env::args().nth(1) {
        Some(path) => {
            let config = AccountConfig::load(&path).with_context(|| format!("loading {}", path))?;
            MailAccount::from_config(config, Arc::new(ImapConnector::default()), Arc::new(plaintext))
        }
        None => {
            let server = MemoryServer::new();
            server.add_user("demo", "demo");
            let properties = ConnectionProperties {
                protocol: Protocol::Imap,
                host: "localhost".to_string(),
                port: 143,
                account_identity: "demo@example.com".to_string(),
                login: "demo".to_string(),
                encrypted_secret: "demo".to_string(),
            };
            let establisher =
                SessionEstablisher::new(Arc::new(server.connector()), Arc::new(plaintext));
            demo_server = Some(server);
            MailAccount::new(properties, establisher)
        }
    };

    let password = std::env::var("MAILSYNC_PASSWORD").unwrap_or_default();
    let account = mail_account.connect(&password).await?;
    account.discover().await?;

    let inbox = account.folder("INBOX")?;
    println!(
        "INBOX: {} messages, {} unread",
        inbox.total_message_count().await?,
        inbox.unread_message_count().await?
    );
    inbox.subscribe(Arc::new(PrintListener)).await?;

    match demo_server {
        Some(server) => {
            server.deliver(
                "INBOX",
                "From: Demo <demo@example.com>\r\nSubject: Hello from mailsync\r\n\r\nHi!\r\n",
            )?;
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        None => {
            println!("Watching, press Ctrl-C to stop");
            tokio::signal::ctrl_c().await?;
        }
    }

    mail_account.close().await?;
    Ok(())
}
