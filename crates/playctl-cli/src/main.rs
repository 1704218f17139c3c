//! playctl CLI - Playback-control daemon and client

mod cli;
mod client;
mod server;
mod settings;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{ Context, Result };
use clap::Parser;
use tokio::net::TcpListener;
use tracing::Level;

use cli::{ Args, Cmd };
use settings::Settings;

use playctl_core::{ command, Service, SimulatedPlayerFactory };


/// Resolves the address from a flag or the settings file.
fn resolve_addr( flag: Option<SocketAddr>, settings: &Settings ) -> Result<SocketAddr> {
    match flag {
        Some( addr ) => Ok( addr ),
        None => settings.listen_addr
            .parse()
            .with_context( || format!( "Invalid listen address in settings: {}", settings.listen_addr ) ),
    }
}


async fn shutdown_signal() {
    if let Err( e ) = tokio::signal::ctrl_c().await {
        tracing::warn!( "Failed to listen for Ctrl-C: {}", e );
        std::future::pending::<()>().await;
    }
}


#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut settings = Settings::load();

    let level = args.log_level
        .or_else( || settings.log_level.parse().ok() )
        .unwrap_or( Level::INFO );
    tracing_subscriber::fmt()
        .with_max_level( level )
        .with_writer( std::io::stderr )
        .init();

    match args.command {
        Cmd::Serve { listen, exit_when_idle, max_players, buffering_ms, track_length_ms } => {
            if let Some( n ) = max_players {
                settings.max_players = n;
            }
            if let Some( ms ) = buffering_ms {
                settings.buffering_ms = ms;
            }
            if let Some( ms ) = track_length_ms {
                settings.track_length_ms = ms;
            }

            let addr = resolve_addr( listen, &settings )?;
            let listener = TcpListener::bind( addr )
                .await
                .with_context( || format!( "Failed to bind {}", addr ) )?;

            let factory = Arc::new( SimulatedPlayerFactory::new( settings.simulation() ) );
            let service = Arc::new( Service::start( factory )? );

            server::serve(
                Arc::clone( &service ),
                listener,
                exit_when_idle || settings.exit_when_idle,
                shutdown_signal(),
            ).await?;

            // Joins the main-context thread
            tokio::task::spawn_blocking( move || service.shutdown() ).await?;
        }
        Cmd::Send { addr, wait_ms, commands } => {
            let addr = resolve_addr( addr, &settings )?;
            client::send( addr, &commands, Duration::from_millis( wait_ms ) ).await?;
        }
        Cmd::Commands => {
            println!( "{}", command::help_text() );
        }
        Cmd::InitConfig { force } => {
            let exists = Settings::settings_path().is_some_and( |p| p.exists() );
            if exists && !force {
                anyhow::bail!( "Settings file already exists; use --force to overwrite" );
            }
            let path = Settings::default().save()?;
            println!( "Wrote {}", path.display() );
        }
    }

    Ok(())
}
