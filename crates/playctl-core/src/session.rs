//! Player session management
//!
//! The session owns at most one player instance and gates every transport
//! command on the player's state. Commands that touch the player run under
//! one session-wide lock, so two playback transitions never overlap even when
//! they come from different clients.

use std::sync::{ Arc, Mutex, MutexGuard, PoisonError };
use std::time::{ SystemTime, UNIX_EPOCH };

use crate::broadcast::Broadcaster;
use crate::event::Event;
use crate::player::{
    Credential, PlayerError, PlayerFactory, PlayerListener, PlayerNotification, PlayerState,
    TrackPlayer,
};


/// Message broadcast when the underlying seek fails.
pub const SEEK_ERROR_MESSAGE: &str = "Error while seeking";

/// Message broadcast on engine buffering errors.
pub const BUFFER_ERROR_MESSAGE: &str = "Error while buffering";


/// Current time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since( UNIX_EPOCH )
        .map( |d| d.as_millis() as i64 )
        .unwrap_or( 0 )
}


/// State guarded by the session lock.
#[derive( Default )]
struct Session {
    player: Option<Box<dyn TrackPlayer>>,
    prepared_uri: Option<String>,
    credential: Option<Credential>,
    closed: bool,
}


impl Session {
    /// Returns the player unless it is absent or released.
    fn live_player( &mut self ) -> Option<&mut Box<dyn TrackPlayer>> {
        self.player.as_mut().filter( |p| p.state() != PlayerState::Released )
    }
}


/// Drives the player on behalf of all clients.
pub struct SessionManager {
    session: Mutex<Session>,
    factory: Arc<dyn PlayerFactory>,
    broadcaster: Arc<Broadcaster>,
    listener: PlayerListener,
}


impl SessionManager {
    /// Creates a session without a player.
    ///
    /// @param factory - Builds players on `prepare`
    /// @param broadcaster - Receives the events this session emits
    /// @param listener - Handed to every player this session creates
    pub fn new(
        factory: Arc<dyn PlayerFactory>,
        broadcaster: Arc<Broadcaster>,
        listener: PlayerListener,
    ) -> Self {
        Self {
            session: Mutex::new( Session::default() ),
            factory,
            broadcaster,
            listener,
        }
    }


    fn lock( &self ) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else( PoisonError::into_inner )
    }


    /// Loads a track, creating a player first when there is none or the
    /// previous one was released.
    pub fn prepare( &self, uri: &str, credential: Credential ) {
        let mut session = self.lock();
        if session.closed {
            tracing::debug!( "prepare ignored: session closed" );
            return;
        }

        tracing::debug!( "prepare: {}", uri );
        session.prepared_uri = Some( uri.to_string() );

        let needs_player = session.player
            .as_ref()
            .map_or( true, |p| p.state() == PlayerState::Released );

        if needs_player {
            // A released player is never reused
            session.player = None;

            match self.factory.create( &credential, self.listener.clone() ) {
                Ok( player ) => {
                    tracing::info!( "Player created" );
                    session.player = Some( player );
                }
                Err( e ) => {
                    tracing::error!( "Failed to create player: {}", e );
                }
            }
        }
        session.credential = Some( credential );

        match session.player.as_mut() {
            Some( player ) => {
                if let Err( e ) = player.play_track( uri ) {
                    tracing::error!( "play_track({}) failed: {}", uri, e );
                }
            }
            None => tracing::warn!( "No player available, cannot prepare {}", uri ),
        }
    }


    /// Resumes or starts playback. Ignored while the player is absent,
    /// buffering, stopped or released.
    pub fn play( &self ) {
        tracing::debug!( "play called" );
        self.transport( "play", |player| player.play() );
    }


    /// Pauses playback. Same guard as [`SessionManager::play`].
    pub fn pause( &self ) {
        tracing::debug!( "pause called" );
        self.transport( "pause", |player| player.pause() );
    }


    fn transport(
        &self,
        name: &str,
        op: impl FnOnce( &mut dyn TrackPlayer ) -> Result<(), PlayerError>,
    ) {
        let mut session = self.lock();
        if session.closed {
            return;
        }
        let Some( player ) = session.live_player() else {
            tracing::debug!( "{} ignored: no player", name );
            return;
        };

        let state = player.state();
        if !state.accepts_transport() {
            tracing::debug!( "{} ignored in state {}", name, state );
            return;
        }

        if let Err( e ) = op( &mut **player ) {
            tracing::error!( "{} failed: {}", name, e );
        }
    }


    /// Seeks to `position_ms`.
    ///
    /// The new position is broadcast even when the player reports a seek
    /// failure, after an error event. A rejected seek is only logged.
    pub fn seek( &self, position_ms: i32 ) {
        tracing::debug!( "seek({})", position_ms );

        {
            let mut session = self.lock();
            if session.closed {
                return;
            }
            let Some( player ) = session.live_player() else {
                tracing::debug!( "seek ignored: no player" );
                return;
            };

            match player.seek( position_ms ) {
                Ok(()) => {}
                Err( PlayerError::Rejected( reason ) ) => {
                    tracing::error!( "seek rejected: {}", reason );
                    return;
                }
                Err( e ) => {
                    tracing::error!( "seek failed: {}", e );
                    self.broadcaster.broadcast( &Event::error( SEEK_ERROR_MESSAGE ) );
                }
            }
        }

        self.broadcaster.broadcast( &Event::OnPlayerPositionChanged {
            position_ms,
            timestamp_ms: now_millis(),
        });
    }


    /// Accepted for compatibility; bitrate selection is not implemented.
    pub fn set_bit_rate( &self, mode: i32 ) {
        tracing::debug!( "set_bit_rate({}) ignored", mode );
    }


    /// Current state of the player, if one exists.
    pub fn state( &self ) -> Option<PlayerState> {
        self.lock().player.as_ref().map( |p| p.state() )
    }


    /// The identifier of the most recently prepared track.
    pub fn prepared_uri( &self ) -> Option<String> {
        self.lock().prepared_uri.clone()
    }


    /// The credential of the most recent `prepare`, used for the next
    /// player this session creates.
    pub fn credential( &self ) -> Option<Credential> {
        self.lock().credential.clone()
    }


    pub fn has_player( &self ) -> bool {
        self.lock().player.is_some()
    }


    /// Translates a player notification into client events.
    ///
    /// Runs on the main context.
    pub fn handle_notification( &self, notification: PlayerNotification ) {
        let event = match notification {
            PlayerNotification::StateChanged { state, time_position_ms } => {
                tracing::debug!( "Player state {} at {} ms", state, time_position_ms );
                match state {
                    PlayerState::Ready => match self.prepared_uri() {
                        Some( uri ) => Event::OnPrepared { uri },
                        None => {
                            tracing::warn!( "Player ready without a prepared track" );
                            return;
                        }
                    },
                    PlayerState::PlaybackCompleted => Event::OnPlayerEndOfTrack,
                    PlayerState::Paused => Event::OnPause,
                    PlayerState::Started => Event::OnPlay,
                    _ => return,
                }
            }
            PlayerNotification::BufferError { message, percent } => {
                tracing::debug!( "onBufferError: {} ({:.1}%)", message, percent );
                Event::error( BUFFER_ERROR_MESSAGE )
            }
            PlayerNotification::PlayerError { message, time_position_ms } => {
                tracing::debug!( "onPlayerError: {} at {} ms", message, time_position_ms );
                Event::error( format!( "PlayerError: {}", message ) )
            }
        };

        self.broadcaster.broadcast( &event );
    }


    /// Releases the player, whatever its state, and closes the session.
    /// Calling it again does nothing.
    pub fn teardown( &self ) {
        let mut session = self.lock();
        session.closed = true;

        if let Some( mut player ) = session.player.take() {
            tracing::info!( "Releasing player in state {}", player.state() );
            player.release();
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::testing::{ listener, MockFactory, RecordingSink };


    struct Fixture {
        factory: MockFactory,
        session: SessionManager,
        client: RecordingSink,
    }


    fn fixture() -> Fixture {
        let factory = MockFactory::new();
        let broadcaster = Arc::new( Broadcaster::new() );
        let client = RecordingSink::new();
        broadcaster.register( client.client() );
        let ( listener, _rx ) = listener();
        let session = SessionManager::new( Arc::new( factory.clone() ), broadcaster, listener );
        Fixture { factory, session, client }
    }


    fn credential() -> Credential {
        Credential::new( "token", 0 ).with_secret( "secret" )
    }


    #[test]
    fn test_prepare_creates_player_and_loads_track() {
        let f = fixture();
        f.session.prepare( "123", credential() );

        assert_eq!( f.factory.created(), 1 );
        assert_eq!( f.factory.player().calls(), vec![ "play_track(123)" ] );
        assert_eq!( f.session.prepared_uri().as_deref(), Some( "123" ) );
        assert_eq!( f.factory.last_credential(), Some( credential() ) );
    }


    #[test]
    fn test_prepare_records_latest_credential() {
        let f = fixture();
        assert_eq!( f.session.credential(), None );

        f.session.prepare( "1", credential() );
        f.factory.player().set_state( PlayerState::Started );
        let renewed = Credential::new( "renewed", 0 );
        f.session.prepare( "2", renewed.clone() );

        assert_eq!( f.session.credential(), Some( renewed ) );
        assert_eq!( f.factory.last_credential(), Some( credential() ) );
    }


    #[test]
    fn test_prepare_reuses_live_player() {
        let f = fixture();
        f.session.prepare( "1", credential() );
        f.factory.player().set_state( PlayerState::Started );
        f.session.prepare( "2", credential() );

        assert_eq!( f.factory.created(), 1 );
        assert_eq!( f.factory.player().calls(), vec![ "play_track(1)", "play_track(2)" ] );
        assert_eq!( f.session.prepared_uri().as_deref(), Some( "2" ) );
    }


    #[test]
    fn test_prepare_replaces_released_player() {
        let f = fixture();
        f.session.prepare( "1", credential() );
        let first = f.factory.player();
        first.set_state( PlayerState::Released );

        f.session.prepare( "2", credential() );

        assert_eq!( f.factory.created(), 2 );
        assert_eq!( first.calls(), vec![ "play_track(1)" ] );
        assert_eq!( f.factory.player().calls(), vec![ "play_track(2)" ] );
    }


    #[test]
    fn test_construction_failure_leaves_session_without_player() {
        let f = fixture();
        f.factory.fail_with( PlayerError::TooManyPlayers );

        f.session.prepare( "1", credential() );
        assert!( !f.session.has_player() );
        assert_eq!( f.session.prepared_uri().as_deref(), Some( "1" ) );

        f.session.play();
        f.session.pause();
        f.session.seek( 100 );
        assert!( f.client.events().is_empty() );
    }


    #[test]
    fn test_play_before_ready_is_ignored() {
        let f = fixture();
        f.session.prepare( "1", credential() );
        f.factory.player().set_state( PlayerState::WaitingForData );

        f.session.play();

        assert_eq!( f.factory.player().calls(), vec![ "play_track(1)" ] );
    }


    #[test]
    fn test_play_and_pause_gated_on_state() {
        let f = fixture();
        f.session.prepare( "1", credential() );
        let player = f.factory.player();

        for state in [ PlayerState::WaitingForData, PlayerState::Stopped, PlayerState::Released ] {
            player.set_state( state );
            f.session.play();
            f.session.pause();
        }
        assert_eq!( player.calls(), vec![ "play_track(1)" ] );

        player.set_state( PlayerState::Ready );
        f.session.play();
        player.set_state( PlayerState::Started );
        f.session.pause();
        assert_eq!( player.calls(), vec![ "play_track(1)", "play", "pause" ] );
    }


    #[test]
    fn test_play_without_player_is_noop() {
        let f = fixture();
        f.session.play();
        f.session.pause();
        assert_eq!( f.factory.created(), 0 );
        assert_eq!( f.session.state(), None );
    }


    #[test]
    fn test_seek_without_player_emits_nothing() {
        let f = fixture();
        f.session.seek( 5000 );
        assert!( f.client.events().is_empty() );
    }


    #[test]
    fn test_seek_on_released_player_emits_nothing() {
        let f = fixture();
        f.session.prepare( "1", credential() );
        f.factory.player().set_state( PlayerState::Released );

        f.session.seek( 5000 );
        assert!( f.client.events().is_empty() );
        assert_eq!( f.factory.player().calls(), vec![ "play_track(1)" ] );
    }


    #[test]
    fn test_seek_broadcasts_position() {
        let f = fixture();
        f.session.prepare( "1", credential() );
        f.factory.player().set_state( PlayerState::Started );

        let before = now_millis();
        f.session.seek( 5000 );

        let events = f.client.events();
        assert_eq!( events.len(), 1 );
        match &events[ 0 ] {
            Event::OnPlayerPositionChanged { position_ms, timestamp_ms } => {
                assert_eq!( *position_ms, 5000 );
                assert!( *timestamp_ms >= before );
            }
            other => panic!( "unexpected event {:?}", other ),
        }
        assert_eq!( f.factory.player().calls(), vec![ "play_track(1)", "seek(5000)" ] );
    }


    #[test]
    fn test_failed_seek_reports_error_then_position() {
        let f = fixture();
        f.session.prepare( "1", credential() );
        f.factory.player().fail_seek_with( PlayerError::Engine( "boom".into() ) );

        f.session.seek( 1200 );

        let events = f.client.events();
        assert_eq!( events.len(), 2 );
        assert_eq!( events[ 0 ], Event::error( SEEK_ERROR_MESSAGE ) );
        assert!( matches!( events[ 1 ], Event::OnPlayerPositionChanged { position_ms: 1200, .. } ) );
    }


    #[test]
    fn test_rejected_seek_is_only_logged() {
        let f = fixture();
        f.session.prepare( "1", credential() );
        f.factory.player().fail_seek_with( PlayerError::Rejected( "pool full".into() ) );

        f.session.seek( 1200 );
        assert!( f.client.events().is_empty() );
    }


    #[test]
    fn test_set_bit_rate_is_noop() {
        let f = fixture();
        f.session.prepare( "1", credential() );
        f.session.set_bit_rate( 2 );
        assert_eq!( f.factory.player().calls(), vec![ "play_track(1)" ] );
        assert!( f.client.events().is_empty() );
    }


    #[test]
    fn test_state_notifications_translate_to_events() {
        let f = fixture();
        f.session.prepare( "track:123", credential() );

        let states = [
            PlayerState::WaitingForData,
            PlayerState::Ready,
            PlayerState::Started,
            PlayerState::Paused,
            PlayerState::Stopped,
            PlayerState::PlaybackCompleted,
            PlayerState::Released,
        ];
        for state in states {
            f.session.handle_notification( PlayerNotification::StateChanged { state, time_position_ms: 0 } );
        }

        assert_eq!( f.client.events(), vec![
            Event::OnPrepared { uri: "track:123".into() },
            Event::OnPlay,
            Event::OnPause,
            Event::OnPlayerEndOfTrack,
        ]);
    }


    #[test]
    fn test_error_notifications() {
        let f = fixture();
        f.session.handle_notification( PlayerNotification::BufferError {
            message: "socket closed".into(),
            percent: 12.5,
        });
        f.session.handle_notification( PlayerNotification::PlayerError {
            message: "decoder crashed".into(),
            time_position_ms: 10,
        });

        assert_eq!( f.client.events(), vec![
            Event::error( "Error while buffering" ),
            Event::error( "PlayerError: decoder crashed" ),
        ]);
    }


    #[test]
    fn test_ready_without_prepare_emits_nothing() {
        let f = fixture();
        f.session.handle_notification( PlayerNotification::StateChanged {
            state: PlayerState::Ready,
            time_position_ms: 0,
        });
        assert!( f.client.events().is_empty() );
    }


    #[test]
    fn test_teardown_releases_once() {
        let f = fixture();
        f.session.prepare( "1", credential() );
        let player = f.factory.player();
        player.set_state( PlayerState::WaitingForData );

        f.session.teardown();
        f.session.teardown();

        assert_eq!( player.calls(), vec![ "play_track(1)", "release" ] );
        assert!( !f.session.has_player() );
    }


    #[test]
    fn test_commands_after_teardown_are_ignored() {
        let f = fixture();
        f.session.teardown();
        f.session.prepare( "1", credential() );
        f.session.seek( 10 );

        assert_eq!( f.factory.created(), 0 );
        assert!( f.client.events().is_empty() );
    }


    #[test]
    fn test_teardown_without_player() {
        let f = fixture();
        f.session.teardown();
        assert!( !f.session.has_player() );
    }
}
