//! The playback-control service
//!
//! Owns the session, the client registry and the main context, and tears
//! them down exactly once.

use std::sync::atomic::{ AtomicBool, Ordering };
use std::sync::{ Arc, Mutex, PoisonError };

use thiserror::Error;

use crate::broadcast::Broadcaster;
use crate::dispatcher::Dispatcher;
use crate::main_context::MainContext;
use crate::player::{ PlayerFactory, PlayerListener };
use crate::session::SessionManager;


/// Errors that can occur while starting the service.
#[derive( Debug, Error )]
pub enum ServiceError {
    #[error( "Failed to start main context: {0}" )]
    MainContext( #[from] std::io::Error ),
}


/// A running playback-control service.
pub struct Service {
    session: Arc<SessionManager>,
    broadcaster: Arc<Broadcaster>,
    main: Mutex<MainContext>,
    shut_down: AtomicBool,
}


impl Service {
    /// Starts a service whose players come from `factory`.
    pub fn start( factory: Arc<dyn PlayerFactory> ) -> Result<Self, ServiceError> {
        let ( tx, rx ) = MainContext::channel();
        let broadcaster = Arc::new( Broadcaster::new() );
        let session = Arc::new( SessionManager::new(
            factory,
            broadcaster.clone(),
            PlayerListener::new( tx.clone() ),
        ));
        let main = MainContext::spawn( tx, rx, Arc::downgrade( &session ) )?;

        tracing::info!( "Playback service has been created" );

        Ok( Self {
            session,
            broadcaster,
            main: Mutex::new( main ),
            shut_down: AtomicBool::new( false ),
        })
    }


    /// A dispatcher routing messages into this service.
    pub fn dispatcher( &self ) -> Dispatcher {
        Dispatcher::new( &self.session, &self.broadcaster )
    }


    pub fn session( &self ) -> &Arc<SessionManager> {
        &self.session
    }


    pub fn broadcaster( &self ) -> &Arc<Broadcaster> {
        &self.broadcaster
    }


    /// Waits until all player notifications posted so far have been broadcast.
    pub fn flush( &self ) {
        self.main.lock().unwrap_or_else( PoisonError::into_inner ).flush();
    }


    pub fn is_shut_down( &self ) -> bool {
        self.shut_down.load( Ordering::SeqCst )
    }


    /// Releases the player and stops the main context. Idempotent.
    pub fn shutdown( &self ) {
        if self.shut_down.swap( true, Ordering::SeqCst ) {
            return;
        }

        self.session.teardown();
        // Notifications emitted while releasing still reach clients
        self.main.lock().unwrap_or_else( PoisonError::into_inner ).stop();

        tracing::info!( "Playback service has been destroyed" );
    }
}


impl Drop for Service {
    fn drop( &mut self ) {
        self.shutdown();
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::command::{ Command, Message };
    use crate::event::Event;
    use crate::player::{ Credential, PlayerState };
    use crate::testing::{ MockFactory, RecordingSink };


    fn start() -> ( MockFactory, Service ) {
        let factory = MockFactory::new();
        let service = Service::start( Arc::new( factory.clone() ) ).unwrap();
        ( factory, service )
    }


    fn prepare( uri: &str ) -> Command {
        Command::Prepare {
            uri: uri.into(),
            credential: Credential::new( "token", 1_900_000_000_000 ).with_secret( "secret" ),
        }
    }


    #[test]
    fn test_prepared_event_after_ready() {
        let ( factory, service ) = start();
        let dispatcher = service.dispatcher();
        let a = RecordingSink::new();

        dispatcher.dispatch( Message::RegisterClient( a.client() ) );
        dispatcher.dispatch( prepare( "track:123" ) );
        factory.listener().on_state_change( PlayerState::Ready, 0 );
        service.flush();

        assert_eq!( a.events(), vec![ Event::OnPrepared { uri: "track:123".into() } ] );
    }


    #[test]
    fn test_pause_from_started() {
        let ( factory, service ) = start();
        let dispatcher = service.dispatcher();
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        dispatcher.dispatch( Message::RegisterClient( a.client() ) );
        dispatcher.dispatch( Message::RegisterClient( b.client() ) );

        dispatcher.dispatch( prepare( "1" ) );
        factory.player().set_state( PlayerState::Started );
        dispatcher.dispatch( Command::Pause );
        assert_eq!( factory.player().calls(), vec![ "play_track(1)", "pause" ] );

        factory.player().set_state( PlayerState::Paused );
        factory.listener().on_state_change( PlayerState::Paused, 1_000 );
        service.flush();

        assert_eq!( a.events(), vec![ Event::OnPause ] );
        assert_eq!( b.events(), vec![ Event::OnPause ] );
    }


    #[test]
    fn test_broken_client_removed_during_broadcast() {
        let ( factory, service ) = start();
        let dispatcher = service.dispatcher();
        let a = RecordingSink::new();
        let b = RecordingSink::new();
        dispatcher.dispatch( Message::RegisterClient( a.client() ) );
        dispatcher.dispatch( Message::RegisterClient( b.client() ) );
        dispatcher.dispatch( prepare( "1" ) );
        b.break_channel();

        factory.listener().on_state_change( PlayerState::Started, 0 );
        service.flush();
        assert_eq!( service.broadcaster().client_count(), 1 );

        b.repair_channel();
        factory.listener().on_state_change( PlayerState::PlaybackCompleted, 0 );
        service.flush();

        assert_eq!( a.events(), vec![ Event::OnPlay, Event::OnPlayerEndOfTrack ] );
        assert!( b.events().is_empty() );
    }


    #[test]
    fn test_player_error_notifications() {
        let ( factory, service ) = start();
        let dispatcher = service.dispatcher();
        let a = RecordingSink::new();
        dispatcher.dispatch( Message::RegisterClient( a.client() ) );
        dispatcher.dispatch( prepare( "1" ) );

        let listener = factory.listener();
        listener.on_buffer_error( "connection reset", 40.0 );
        listener.on_player_error( "license expired", 1_500 );
        service.flush();

        assert_eq!( a.events(), vec![
            Event::error( "Error while buffering" ),
            Event::error( "PlayerError: license expired" ),
        ]);
    }


    #[test]
    fn test_seek_without_player() {
        let ( factory, service ) = start();
        let dispatcher = service.dispatcher();
        let a = RecordingSink::new();
        dispatcher.dispatch( Message::RegisterClient( a.client() ) );

        dispatcher.dispatch( Command::Seek { position_ms: 5000 } );
        service.flush();

        assert_eq!( factory.created(), 0 );
        assert!( a.events().is_empty() );
    }


    #[test]
    fn test_shutdown_is_idempotent() {
        let ( factory, service ) = start();
        let dispatcher = service.dispatcher();
        dispatcher.dispatch( prepare( "1" ) );
        factory.player().set_state( PlayerState::Started );

        service.shutdown();
        service.shutdown();
        service.flush();

        assert!( service.is_shut_down() );
        assert_eq!( factory.player().calls(), vec![ "play_track(1)", "release" ] );

        dispatcher.dispatch( prepare( "2" ) );
        assert_eq!( factory.created(), 1 );
    }


    #[test]
    fn test_dispatcher_outlives_service() {
        let ( factory, service ) = start();
        let dispatcher = service.dispatcher();
        drop( service );

        dispatcher.dispatch( prepare( "1" ) );
        assert_eq!( factory.created(), 0 );
    }


    #[test]
    fn test_concurrent_clients() {
        let ( factory, service ) = start();
        let dispatcher = service.dispatcher();
        dispatcher.dispatch( prepare( "1" ) );
        factory.player().set_state( PlayerState::Started );

        let handles: Vec<_> = ( 0..8 )
            .map( |i| {
                let dispatcher = dispatcher.clone();
                std::thread::spawn( move || {
                    let sink = RecordingSink::new();
                    dispatcher.dispatch( Message::RegisterClient( sink.client() ) );
                    dispatcher.dispatch( Command::Seek { position_ms: i * 100 } );
                    sink
                })
            })
            .collect();

        let sinks: Vec<_> = handles.into_iter().map( |h| h.join().unwrap() ).collect();
        assert_eq!( service.broadcaster().client_count(), 8 );

        let seeks = factory.player().calls().iter().filter( |c| c.starts_with( "seek" ) ).count();
        assert_eq!( seeks, 8 );
        for sink in sinks {
            assert!( !sink.events().is_empty() );
        }
    }
}
