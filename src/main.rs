// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cowrite::{
    client::{Client, ClientEvent},
    config::AppConfig,
    logging, server,
    types::{ClientId, DocId},
};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{debug, info};

#[derive(Parser)]
#[command(version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Verbose logging.
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the collaboration server.
    Serve {
        /// TCP port to listen on.
        #[arg(long, short, env = "COWRITE_PORT")]
        port: Option<u16>,
        /// INI file providing defaults for the flags above.
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Connect to a server and edit a shared document from the terminal.
    Client {
        /// Server address.
        #[arg(long, default_value = "127.0.0.1:8080")]
        server: String,
        /// Document to join.
        #[arg(long, default_value = "default")]
        doc: String,
        /// The name other people see.
        #[arg(long, default_value = "anonymous")]
        name: String,
        /// Stable client id, to keep an identity across reconnects.
        #[arg(long)]
        client_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_panic(info);
        std::process::exit(1);
    }));

    let cli = Cli::parse();
    logging::initialize(cli.debug);

    match cli.command {
        Commands::Serve {
            port,
            config: config_file,
        } => {
            let file_config = config_file
                .as_deref()
                .and_then(AppConfig::from_config_file);
            let app_config = AppConfig { port }.merge(file_config);

            tokio::select! {
                result = server::listen(app_config.port()) => result.context("Server failed")?,
                () = shutdown_requested() => info!("Shutting down."),
            }
        }
        Commands::Client {
            server,
            doc,
            name,
            client_id,
        } => {
            run_client(&server, doc, &name, client_id.map(ClientId::new))
                .await
                .context("Client failed")?;
        }
    }
    Ok(())
}

/// Resolves once the process is asked to stop, by Ctrl+C or SIGTERM.
async fn shutdown_requested() {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("Failed to install the SIGTERM handler");
    tokio::select! {
        _ = signal::ctrl_c() => debug!("Stopping on Ctrl+C"),
        _ = sigterm.recv() => debug!("Stopping on SIGTERM"),
    }
}

async fn run_client(
    server: &str,
    doc: String,
    name: &str,
    client_id: Option<ClientId>,
) -> Result<()> {
    let mut client = Client::connect(server, DocId::new(doc), name, client_id).await?;
    println!("Connected as {}.", client.client_id());
    println!("Commands: i <pos> <text> | d <pos> <len> | show | quit");

    let mut stdin_lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = client.next_event() => match event? {
                ClientEvent::RemoteEdit(_) => {
                    println!("-- document is now {:?}", client.content());
                }
                ClientEvent::PeerJoined { name, .. } => println!("-- {name} joined"),
                ClientEvent::PeerLeft { client_id } => println!("-- {client_id} left"),
                ClientEvent::Rejoined { lost_edits } => {
                    println!("-- reconnected, {lost_edits} unconfirmed local edits were lost");
                }
                ClientEvent::ServerError { message } => println!("-- server error: {message}"),
                ClientEvent::Acked { .. } | ClientEvent::Cursor { .. } => {}
            },
            line = stdin_lines.next_line() => {
                let Some(line) = line.context("Failed to read from stdin")? else {
                    break;
                };
                if !handle_command(&mut client, line.trim()).await? {
                    break;
                }
            }
        }
    }
    Ok(())
}

/// Returns `false` when the user wants to quit.
async fn handle_command(client: &mut Client, line: &str) -> Result<bool> {
    match line {
        "" => return Ok(true),
        "quit" => return Ok(false),
        "show" => {
            println!("{:?}", client.content());
            return Ok(true);
        }
        _ => {}
    }

    if let Some(rest) = line.strip_prefix("i ") {
        if let Some((pos, text)) = rest.split_once(' ') {
            if let Ok(pos) = pos.parse() {
                client.insert(pos, text).await?;
                return Ok(true);
            }
        }
    } else if let Some(rest) = line.strip_prefix("d ") {
        if let Some((pos, len)) = rest.split_once(' ') {
            if let (Ok(pos), Ok(len)) = (pos.parse(), len.parse()) {
                client.delete(pos, len).await?;
                return Ok(true);
            }
        }
    }

    println!("-- unknown command, try: i <pos> <text> | d <pos> <len> | show | quit");
    Ok(true)
}
