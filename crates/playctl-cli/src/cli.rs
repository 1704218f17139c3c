//! Command-line argument parsing for playctl.

use std::net::SocketAddr;

use clap::{ Parser, Subcommand };
use tracing::Level;


/// playctl - A playback-control service for streaming players.
#[derive( Parser, Debug )]
#[command( name = "playctl" )]
#[command( version, about, long_about = None )]
pub struct Args {
    /// Log level (error, warn, info, debug, trace). Overrides the settings file.
    #[arg( long, global = true )]
    pub log_level: Option<Level>,

    #[command( subcommand )]
    pub command: Cmd,
}


#[derive( Subcommand, Debug )]
pub enum Cmd {
    /// Run the service and accept client connections.
    Serve {
        /// Address to listen on.
        #[arg( short, long )]
        listen: Option<SocketAddr>,

        /// Shut down once the last client disconnects.
        #[arg( long )]
        exit_when_idle: bool,

        /// Maximum number of live players.
        #[arg( long )]
        max_players: Option<usize>,

        /// Simulated buffering time before a track is ready.
        #[arg( long )]
        buffering_ms: Option<u64>,

        /// Length of every simulated track.
        #[arg( long )]
        track_length_ms: Option<u64>,
    },

    /// Send commands to a running service and print the events it sends back.
    Send {
        /// Address of the service.
        #[arg( short, long )]
        addr: Option<SocketAddr>,

        /// How long to print events after the last command.
        #[arg( short, long, default_value_t = 2000 )]
        wait_ms: u64,

        /// Commands to send, e.g. "prepare 3135556 <token>" "play" "seek 1:30".
        #[arg( required = true )]
        commands: Vec<String>,
    },

    /// List the commands accepted by `send`.
    Commands,

    /// Write a settings file with default values.
    InitConfig {
        /// Overwrite an existing settings file.
        #[arg( long )]
        force: bool,
    },
}
