//! Routes inbound messages to the session and the client registry.

use std::sync::{ Arc, Weak };

use crate::broadcast::Broadcaster;
use crate::command::{ Command, Message };
use crate::session::SessionManager;


/// Routes messages without keeping the service alive.
///
/// Targets are resolved per message; once the service has been dropped,
/// messages are discarded.
#[derive( Clone )]
pub struct Dispatcher {
    session: Weak<SessionManager>,
    broadcaster: Weak<Broadcaster>,
}


impl Dispatcher {
    pub fn new( session: &Arc<SessionManager>, broadcaster: &Arc<Broadcaster> ) -> Self {
        Self {
            session: Arc::downgrade( session ),
            broadcaster: Arc::downgrade( broadcaster ),
        }
    }


    /// Handles one message to completion.
    pub fn dispatch( &self, message: impl Into<Message> ) {
        match message.into() {
            Message::RegisterClient( client ) => match self.broadcaster.upgrade() {
                Some( broadcaster ) => {
                    broadcaster.register( client );
                }
                None => tracing::debug!( "Dropping registration: service gone" ),
            },
            Message::UnregisterClient( client ) => match self.broadcaster.upgrade() {
                Some( broadcaster ) => {
                    broadcaster.unregister( &client );
                }
                None => tracing::debug!( "Dropping unregistration: service gone" ),
            },
            Message::Command( command ) => match self.session.upgrade() {
                Some( session ) => Self::execute( &session, command ),
                None => tracing::debug!( "Dropping {:?}: service gone", command ),
            },
            Message::Unknown( what ) => {
                tracing::debug!( "Ignoring unknown message {}", what );
            }
        }
    }


    fn execute( session: &SessionManager, command: Command ) {
        match command {
            Command::Prepare { uri, credential } => session.prepare( &uri, credential ),
            Command::Play => session.play(),
            Command::Pause => session.pause(),
            Command::Seek { position_ms } => session.seek( position_ms ),
            Command::SetBitRate { mode } => session.set_bit_rate( mode ),
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::player::{ Credential, PlayerState };
    use crate::testing::{ listener, MockFactory, RecordingSink };


    fn setup() -> ( MockFactory, Arc<SessionManager>, Arc<Broadcaster>, Dispatcher ) {
        let factory = MockFactory::new();
        let broadcaster = Arc::new( Broadcaster::new() );
        let ( listener, _rx ) = listener();
        let session = Arc::new( SessionManager::new(
            Arc::new( factory.clone() ),
            broadcaster.clone(),
            listener,
        ));
        let dispatcher = Dispatcher::new( &session, &broadcaster );
        ( factory, session, broadcaster, dispatcher )
    }


    #[test]
    fn test_routes_commands_to_session() {
        let ( factory, _session, _broadcaster, dispatcher ) = setup();

        dispatcher.dispatch( Command::Prepare {
            uri: "7".into(),
            credential: Credential::new( "tok", 0 ),
        });
        factory.player().set_state( PlayerState::Ready );
        dispatcher.dispatch( Command::Play );
        factory.player().set_state( PlayerState::Started );
        dispatcher.dispatch( Command::Pause );
        dispatcher.dispatch( Command::Seek { position_ms: 300 } );
        dispatcher.dispatch( Command::SetBitRate { mode: 1 } );

        assert_eq!( factory.player().calls(), vec![ "play_track(7)", "play", "pause", "seek(300)" ] );
    }


    #[test]
    fn test_registration_path() {
        let ( _factory, _session, broadcaster, dispatcher ) = setup();
        let a = RecordingSink::new();

        dispatcher.dispatch( Message::RegisterClient( a.client() ) );
        dispatcher.dispatch( Message::RegisterClient( a.client() ) );
        assert_eq!( broadcaster.client_count(), 1 );

        dispatcher.dispatch( Message::UnregisterClient( a.client() ) );
        dispatcher.dispatch( Message::UnregisterClient( a.client() ) );
        assert_eq!( broadcaster.client_count(), 0 );
    }


    #[test]
    fn test_unknown_message_is_ignored() {
        let ( factory, _session, broadcaster, dispatcher ) = setup();
        let a = RecordingSink::new();
        dispatcher.dispatch( Message::RegisterClient( a.client() ) );

        dispatcher.dispatch( Message::Unknown( 999 ) );

        assert_eq!( factory.created(), 0 );
        assert_eq!( broadcaster.client_count(), 1 );
        assert!( a.events().is_empty() );
    }


    #[test]
    fn test_messages_dropped_after_service_gone() {
        let ( factory, session, broadcaster, dispatcher ) = setup();
        drop( session );
        drop( broadcaster );

        let a = RecordingSink::new();
        dispatcher.dispatch( Message::RegisterClient( a.client() ) );
        dispatcher.dispatch( Command::Prepare {
            uri: "7".into(),
            credential: Credential::new( "tok", 0 ),
        });

        assert_eq!( factory.created(), 0 );
    }


    #[test]
    fn test_seek_event_reaches_registered_client() {
        let ( factory, _session, _broadcaster, dispatcher ) = setup();
        let a = RecordingSink::new();
        dispatcher.dispatch( Message::RegisterClient( a.client() ) );
        dispatcher.dispatch( Command::Prepare {
            uri: "7".into(),
            credential: Credential::new( "tok", 0 ),
        });
        factory.player().set_state( PlayerState::Ready );

        dispatcher.dispatch( Command::Seek { position_ms: 42 } );

        assert!( matches!(
            a.events().as_slice(),
            [ Event::OnPlayerPositionChanged { position_ms: 42, .. } ]
        ));
    }
}
