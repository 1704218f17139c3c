//! Service settings management
//!
//! Handles persistent defaults for the daemon: listen address, idle exit and
//! simulated player timing. Command-line flags take precedence.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{ Context, Result };
use serde::{ Deserialize, Serialize };

use playctl_core::SimulationConfig;


/// Service settings.
#[derive( Debug, Clone, PartialEq, Serialize, Deserialize )]
#[serde( default )]
pub struct Settings {
    /// Address the service listens on
    pub listen_addr: String,

    /// Shut down after the last client disconnects
    pub exit_when_idle: bool,

    /// Default log level
    pub log_level: String,

    /// Players that may be alive at once
    pub max_players: usize,

    /// Simulated buffering time in milliseconds
    pub buffering_ms: u64,

    /// Simulated track length in milliseconds
    pub track_length_ms: u64,
}


impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7878".into(),
            exit_when_idle: false,
            log_level: "info".into(),
            max_players: 1,
            buffering_ms: 500,
            track_length_ms: 30_000,
        }
    }
}


impl Settings {
    /// Returns the path to the settings file.
    pub fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map( |p| p.join( "playctl" ).join( "settings.json" ) )
    }


    /// Loads settings from disk, or returns defaults if not found.
    pub fn load() -> Self {
        let path = match Self::settings_path() {
            Some( p ) => p,
            None => return Self::default(),
        };

        if !path.exists() {
            return Self::default();
        }

        match fs::read_to_string( &path ) {
            Ok( contents ) => Self::parse( &contents ),
            Err( e ) => {
                tracing::warn!( "Failed to read settings: {}", e );
                Self::default()
            }
        }
    }


    /// Parses settings JSON, falling back to defaults on error.
    pub fn parse( contents: &str ) -> Self {
        serde_json::from_str( contents ).unwrap_or_else( |e| {
            tracing::warn!( "Invalid settings file, using defaults: {}", e );
            Self::default()
        })
    }


    /// Saves settings to disk and returns where they were written.
    pub fn save( &self ) -> Result<PathBuf> {
        let path = Self::settings_path().context( "No configuration directory on this platform" )?;

        // Create parent directory if needed
        if let Some( parent ) = path.parent() {
            fs::create_dir_all( parent )
                .with_context( || format!( "Failed to create {}", parent.display() ) )?;
        }

        let json = serde_json::to_string_pretty( self )?;
        fs::write( &path, json ).with_context( || format!( "Failed to write {}", path.display() ) )?;
        Ok( path )
    }


    /// Simulated player configuration derived from these settings.
    pub fn simulation( &self ) -> SimulationConfig {
        SimulationConfig {
            max_players: self.max_players,
            buffering_delay: Duration::from_millis( self.buffering_ms ),
            track_length: Duration::from_millis( self.track_length_ms ),
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_partial_settings_use_defaults() {
        let settings = Settings::parse( r#"{ "exit_when_idle": true, "max_players": 2 }"# );
        assert!( settings.exit_when_idle );
        assert_eq!( settings.max_players, 2 );
        assert_eq!( settings.listen_addr, "127.0.0.1:7878" );
    }


    #[test]
    fn test_invalid_settings_fall_back() {
        assert_eq!( Settings::parse( "{ not json" ), Settings::default() );
    }


    #[test]
    fn test_simulation_config() {
        let settings = Settings { buffering_ms: 10, track_length_ms: 20, ..Settings::default() };
        let sim = settings.simulation();
        assert_eq!( sim.buffering_delay, Duration::from_millis( 10 ) );
        assert_eq!( sim.track_length, Duration::from_millis( 20 ) );
        assert_eq!( sim.max_players, 1 );
    }
}
