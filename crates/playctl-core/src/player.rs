//! Player adapter contract
//!
//! The streaming engine itself is external. This module defines the surface
//! the session layer drives: a factory that builds a player bound to a
//! credential, the player operations, and the listener through which the
//! engine reports asynchronous state changes and errors.

use std::fmt;

use thiserror::Error;

use crate::main_context::{ Task, TaskSender };


/// Errors reported by a player adapter.
#[derive( Debug, Clone, PartialEq, Eq, Error )]
pub enum PlayerError {
    #[error( "Too many players" )]
    TooManyPlayers,

    #[error( "Connect error: {0}" )]
    Connect( String ),

    #[error( "Operation not allowed in state {0}" )]
    InvalidState( PlayerState ),

    #[error( "Execution rejected: {0}" )]
    Rejected( String ),

    #[error( "Engine error: {0}" )]
    Engine( String ),
}


/// State of the underlying player.
#[derive( Debug, Clone, Copy, PartialEq, Eq, Hash )]
pub enum PlayerState {
    Uninitialized,
    WaitingForData,
    Ready,
    Started,
    Paused,
    Stopped,
    PlaybackCompleted,
    Released,
}


impl PlayerState {
    /// Whether `play` and `pause` may be forwarded to a player in this state.
    pub fn accepts_transport( self ) -> bool {
        !matches!( self, PlayerState::Released | PlayerState::WaitingForData | PlayerState::Stopped )
    }
}


impl fmt::Display for PlayerState {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        let name = match self {
            PlayerState::Uninitialized => "UNINITIALIZED",
            PlayerState::WaitingForData => "WAITING_FOR_DATA",
            PlayerState::Ready => "READY",
            PlayerState::Started => "STARTED",
            PlayerState::Paused => "PAUSED",
            PlayerState::Stopped => "STOPPED",
            PlayerState::PlaybackCompleted => "PLAYBACK_COMPLETED",
            PlayerState::Released => "RELEASED",
        };
        f.write_str( name )
    }
}


/// Access credential handed to the player on construction.
///
/// Opaque to this crate. `Debug` never prints the token or the secret.
#[derive( Clone, PartialEq, Eq )]
pub struct Credential {
    pub access_token: String,
    pub access_token_secret: Option<String>,
    /// Expiry as milliseconds since the Unix epoch, 0 when unknown
    pub access_token_expires: i64,
}


impl Credential {
    pub fn new( access_token: impl Into<String>, access_token_expires: i64 ) -> Self {
        Self {
            access_token: access_token.into(),
            access_token_secret: None,
            access_token_expires,
        }
    }


    pub fn with_secret( mut self, secret: impl Into<String> ) -> Self {
        self.access_token_secret = Some( secret.into() );
        self
    }


    /// Returns true if the credential carries an expiry that lies before `now_ms`.
    pub fn is_expired( &self, now_ms: i64 ) -> bool {
        self.access_token_expires > 0 && self.access_token_expires < now_ms
    }
}


impl fmt::Debug for Credential {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        f.debug_struct( "Credential" )
            .field( "access_token", &"<redacted>" )
            .field( "access_token_secret", &self.access_token_secret.as_ref().map( |_| "<redacted>" ) )
            .field( "access_token_expires", &self.access_token_expires )
            .finish()
    }
}


/// Asynchronous notifications emitted by the engine.
#[derive( Debug, Clone, PartialEq )]
pub enum PlayerNotification {
    StateChanged { state: PlayerState, time_position_ms: i64 },
    BufferError { message: String, percent: f64 },
    PlayerError { message: String, time_position_ms: i64 },
}


/// Subscription point handed to a player at construction.
///
/// The engine calls these from its own background threads. Every call is
/// posted to the main context; nothing is handled inline.
#[derive( Clone )]
pub struct PlayerListener {
    tx: TaskSender,
}


impl PlayerListener {
    pub(crate) fn new( tx: TaskSender ) -> Self {
        Self { tx }
    }


    pub fn on_state_change( &self, state: PlayerState, time_position_ms: i64 ) {
        self.notify( PlayerNotification::StateChanged { state, time_position_ms } );
    }


    pub fn on_buffer_error( &self, message: impl Into<String>, percent: f64 ) {
        self.notify( PlayerNotification::BufferError { message: message.into(), percent } );
    }


    pub fn on_player_error( &self, message: impl Into<String>, time_position_ms: i64 ) {
        self.notify( PlayerNotification::PlayerError { message: message.into(), time_position_ms } );
    }


    /// Posts a notification to the main context.
    pub fn notify( &self, notification: PlayerNotification ) {
        if self.tx.send( Task::Notification( notification ) ).is_err() {
            tracing::trace!( "Main context gone, dropping player notification" );
        }
    }
}


impl fmt::Debug for PlayerListener {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        f.debug_struct( "PlayerListener" ).finish_non_exhaustive()
    }
}


/// A live player instance.
pub trait TrackPlayer: Send {
    /// Loads the given track and starts buffering it.
    fn play_track( &mut self, track_id: &str ) -> Result<(), PlayerError>;

    fn play( &mut self ) -> Result<(), PlayerError>;

    fn pause( &mut self ) -> Result<(), PlayerError>;

    fn seek( &mut self, position_ms: i32 ) -> Result<(), PlayerError>;

    /// Frees the engine resources. Must be idempotent; the state becomes `Released`.
    fn release( &mut self );

    fn state( &self ) -> PlayerState;
}


/// Builds players bound to a credential.
pub trait PlayerFactory: Send + Sync {
    /// Creates a new player.
    ///
    /// @param credential - Credential the player authenticates with
    /// @param listener - Where the player reports asynchronous notifications
    ///
    /// @returns The player, or `TooManyPlayers` / `Connect` when it cannot be built
    fn create(
        &self,
        credential: &Credential,
        listener: PlayerListener,
    ) -> Result<Box<dyn TrackPlayer>, PlayerError>;
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_transport_guard() {
        assert!( PlayerState::Ready.accepts_transport() );
        assert!( PlayerState::Started.accepts_transport() );
        assert!( PlayerState::Paused.accepts_transport() );
        assert!( PlayerState::Uninitialized.accepts_transport() );
        assert!( !PlayerState::WaitingForData.accepts_transport() );
        assert!( !PlayerState::Stopped.accepts_transport() );
        assert!( !PlayerState::Released.accepts_transport() );
    }


    #[test]
    fn test_credential_debug_redacts_token() {
        let credential = Credential::new( "tok-abc", 42 ).with_secret( "s3cret" );
        let printed = format!( "{:?}", credential );
        assert!( !printed.contains( "tok-abc" ) );
        assert!( !printed.contains( "s3cret" ) );
        assert!( printed.contains( "42" ) );
    }


    #[test]
    fn test_credential_expiry() {
        assert!( !Credential::new( "t", 0 ).is_expired( 1_000 ) );
        assert!( Credential::new( "t", 500 ).is_expired( 1_000 ) );
        assert!( !Credential::new( "t", 2_000 ).is_expired( 1_000 ) );
    }
}
